//! Two-dimensional rotation strategies.
//!
//! Every rotator first reduces the angle to `[-pi/4, pi/4]` with a lossless
//! quarter-turn pre-rotation (a swap and sign flip of the components), then applies
//! its own approximation to the residual angle. Computation runs in `f64`.

mod cache;
mod cordic;
mod exact;
mod first_order;
pub mod metrics;

pub use cache::{CachedRotator, DEFAULT_CACHE_CAPACITY};
pub use cordic::{CordicRotator, DEFAULT_CORDIC_STAGES};
pub use exact::ExactRotator;
pub use first_order::{DoubleFirstOrderRotator, FirstOrderRotator, RefinedDoubleFirstOrderRotator};

use std::f64::consts::{FRAC_PI_2, PI, TAU};

use varformer_core::{Result, VarError};

/// Rotate a 2D vector by an angle in radians.
pub trait Rotator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rotate by `theta`, already reduced to `[-pi/4, pi/4]`.
    fn rotate_reduced(&self, theta: f64, v: [f64; 2]) -> [f64; 2];

    /// Rotate by any real angle.
    fn rotate(&self, theta: f64, v: [f64; 2]) -> [f64; 2] {
        let (residual, v) = trivial_rotation(theta, v);
        self.rotate_reduced(residual, v)
    }
}

impl<R: Rotator + ?Sized> Rotator for Box<R> {
    fn name(&self) -> &'static str {
        (**self).name()
    }
    fn rotate_reduced(&self, theta: f64, v: [f64; 2]) -> [f64; 2] {
        (**self).rotate_reduced(theta, v)
    }
    fn rotate(&self, theta: f64, v: [f64; 2]) -> [f64; 2] {
        (**self).rotate(theta, v)
    }
}

/// Split `theta` into an exact multiple of a quarter turn, applied to `v` by
/// swapping and negating components, and a residual in `[-pi/4, pi/4]`.
pub fn trivial_rotation(theta: f64, v: [f64; 2]) -> (f64, [f64; 2]) {
    let mut t = theta % TAU;
    if t > PI {
        t -= TAU;
    } else if t <= -PI {
        t += TAU;
    }
    let quarters = (t / FRAC_PI_2).round();
    let residual = t - quarters * FRAC_PI_2;
    let [x, y] = v;
    let turned = match (quarters as i64).rem_euclid(4) {
        0 => [x, y],
        1 => [-y, x],
        2 => [-x, -y],
        _ => [y, -x],
    };
    (residual, turned)
}

/// Rotate a length-2 slice; any other length is a contract violation.
pub fn rotate_slice(rotator: &dyn Rotator, theta: f64, v: &[f32]) -> Result<[f32; 2]> {
    let [x, y] = v else {
        return Err(VarError::contract(format!(
            "rotator `{}` expects a 2-element vector, got {} elements",
            rotator.name(),
            v.len()
        )));
    };
    let [a, b] = rotator.rotate(theta, [*x as f64, *y as f64]);
    Ok([a as f32, b as f32])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_4;

    fn close(a: [f64; 2], b: [f64; 2]) -> bool {
        (a[0] - b[0]).abs() < 1e-9 && (a[1] - b[1]).abs() < 1e-9
    }

    #[test]
    fn test_trivial_rotation_quarter_turns() {
        let v = [3.0, 1.0];
        let (r, out) = trivial_rotation(FRAC_PI_2, v);
        assert!(r.abs() < 1e-12);
        assert!(close(out, [-1.0, 3.0]));
        let (_, out) = trivial_rotation(PI, v);
        assert!(close(out, [-3.0, -1.0]));
        let (_, out) = trivial_rotation(-FRAC_PI_2, v);
        assert!(close(out, [1.0, -3.0]));
        let (_, out) = trivial_rotation(4.0 * PI, v);
        assert!(close(out, v));
    }

    #[test]
    fn test_residual_is_reduced_and_consistent() {
        let exact = ExactRotator;
        for k in -40..40 {
            let theta = k as f64 * 0.37;
            let (r, turned) = trivial_rotation(theta, [1.0, 2.0]);
            assert!(r.abs() <= FRAC_PI_4 + 1e-12, "theta {theta} -> {r}");
            let direct = [
                theta.cos() * 1.0 - theta.sin() * 2.0,
                theta.sin() * 1.0 + theta.cos() * 2.0,
            ];
            let via = exact.rotate_reduced(r, turned);
            assert!((via[0] - direct[0]).abs() < 1e-9 && (via[1] - direct[1]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rotate_slice_rejects_wrong_length() {
        let err = rotate_slice(&ExactRotator, 0.3, &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, VarError::Contract(_)));
        assert!(rotate_slice(&ExactRotator, 0.3, &[1.0]).is_err());
        let out = rotate_slice(&ExactRotator, FRAC_PI_2, &[1.0, 0.0]).unwrap();
        assert!(out[0].abs() < 1e-6 && (out[1] - 1.0).abs() < 1e-6);
    }
}
