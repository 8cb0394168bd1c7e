//! Finite-difference gradient checking helpers shared by the workspace test suites.

use crate::autograd::NoGradGuard;
use crate::tensor::Tensor;
use crate::Result;

/// Central-difference gradient of the scalar function `f` at `x`.
pub fn numerical_grad(f: &dyn Fn(&Tensor) -> Result<f32>, x: &Tensor, eps: f32) -> Result<Vec<f32>> {
    let _guard = NoGradGuard::new();
    let mut probe = x.detach();
    let mut grad = vec![0.0f32; x.numel()];
    for (i, g) in grad.iter_mut().enumerate() {
        let orig = x.as_f32_slice()[i];
        probe.update_data(|d| d[i] = orig + eps);
        let fp = f(&probe)?;
        probe.update_data(|d| d[i] = orig - eps);
        let fm = f(&probe)?;
        probe.update_data(|d| d[i] = orig);
        *g = (fp - fm) / (2.0 * eps);
    }
    Ok(grad)
}

/// Panic unless `analytic` matches `numerical` within relative tolerance `tol`.
///
/// Differences below `1e-3` in absolute terms always pass.
pub fn check_close(analytic: &[f32], numerical: &[f32], tol: f32, name: &str) {
    assert_eq!(analytic.len(), numerical.len(), "{name}: length mismatch");
    for (i, (&a, &n)) in analytic.iter().zip(numerical).enumerate() {
        let abs_err = (a - n).abs();
        if abs_err < 1e-3 {
            continue;
        }
        let rel = abs_err / a.abs().max(n.abs()).max(1e-7);
        assert!(
            rel < tol,
            "{name}[{i}]: analytic={a:.6}, numerical={n:.6}, rel_err={rel:.6}"
        );
    }
}

/// Compare the autograd gradient of `f` at `x` with finite differences.
pub fn assert_gradient(f: &dyn Fn(&Tensor) -> Result<Tensor>, x: &Tensor, tol: f32, name: &str) -> Result<()> {
    let leaf = x.detach().with_requires_grad();
    f(&leaf)?.backward()?;
    let analytic = leaf
        .grad()
        .map(|g| g.to_vec())
        .unwrap_or_else(|| vec![0.0; x.numel()]);
    let numerical = numerical_grad(&|t| f(t)?.item(), x, 1e-2)?;
    check_close(&analytic, &numerical, tol, name);
    Ok(())
}
