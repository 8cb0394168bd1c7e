use varformer_core::{Result, Tensor, VarError};

use crate::moe::RouterDecision;

/// Turns router logits `[N, E]` into a top-`k` selection per token.
pub trait Router: Send + Sync {
    fn name(&self) -> &'static str;
    fn route(&self, logits: &Tensor, k: usize) -> Result<RouterDecision>;
}

fn check(logits: &Tensor, k: usize) -> Result<(usize, usize)> {
    if logits.ndim() != 2 {
        return Err(VarError::ShapeMismatch {
            expected: vec![0, 0],
            got: logits.dims().to_vec(),
        });
    }
    let (n, e) = (logits.dims()[0], logits.dims()[1]);
    if k == 0 || k > e {
        return Err(VarError::contract(format!("router top-k must be in 1..={e}, got {k}")));
    }
    Ok((n, e))
}

/// Flat `[N * E]` offsets of the chosen experts, in selection order.
fn flat_indices(topk: &[Vec<usize>], experts: usize) -> Vec<usize> {
    topk.iter()
        .enumerate()
        .flat_map(|(t, row)| row.iter().map(move |&e| t * experts + e))
        .collect()
}

fn selections(topk: Vec<Vec<usize>>, k: usize) -> Vec<Vec<(usize, usize)>> {
    topk.into_iter()
        .enumerate()
        .map(|(t, row)| row.into_iter().enumerate().map(|(r, e)| (e, t * k + r)).collect())
        .collect()
}

/// Softmax over every expert, keep the top `k`, renormalize the kept mass.
pub struct TopKSoftmax;

impl Router for TopKSoftmax {
    fn name(&self) -> &'static str {
        "topk_softmax"
    }

    fn route(&self, logits: &Tensor, k: usize) -> Result<RouterDecision> {
        let (n, e) = check(logits, k)?;
        let probs = logits.softmax()?;
        let topk = probs.topk_last(k)?;
        let kept = probs
            .reshape(&[-1])?
            .index_select(0, &flat_indices(&topk, e))?
            .reshape(&[n as isize, k as isize])?;
        let weights = kept.div(&kept.sum_last_keepdim()?)?.reshape(&[-1])?;
        Ok(RouterDecision {
            selections: selections(topk, k),
            weights,
            probs,
        })
    }
}

/// Keep the top `k` logits, softmax among them only.
pub struct SoftmaxTopK;

impl Router for SoftmaxTopK {
    fn name(&self) -> &'static str {
        "softmax_topk"
    }

    fn route(&self, logits: &Tensor, k: usize) -> Result<RouterDecision> {
        let (n, e) = check(logits, k)?;
        let topk = logits.topk_last(k)?;
        let weights = logits
            .reshape(&[-1])?
            .index_select(0, &flat_indices(&topk, e))?
            .reshape(&[n as isize, k as isize])?
            .softmax()?
            .reshape(&[-1])?;
        Ok(RouterDecision {
            selections: selections(topk, k),
            weights,
            probs: logits.softmax()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logits() -> Tensor {
        Tensor::from_f32(&[1.0, 3.0, 2.0, 0.0, 0.5, -1.0, 4.0, 0.0], &[2, 4])
    }

    #[test]
    fn test_both_schemes_agree_on_selection_and_weights() {
        // renormalized softmax over the kept experts equals softmax over their logits
        let a = TopKSoftmax.route(&logits(), 2).unwrap();
        let b = SoftmaxTopK.route(&logits(), 2).unwrap();
        assert_eq!(a.selections, vec![vec![(1, 0), (2, 1)], vec![(2, 2), (0, 3)]]);
        assert_eq!(a.selections, b.selections);
        for (x, y) in a.weights.to_vec().iter().zip(b.weights.to_vec()) {
            assert!((x - y).abs() < 1e-6);
        }
        let w = a.weights.to_vec();
        assert!((w[0] + w[1] - 1.0).abs() < 1e-6);
        assert!((w[0] - 1.0 / (1.0 + (-1.0f32).exp())).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_bad_k() {
        assert!(TopKSoftmax.route(&logits(), 0).is_err());
        assert!(SoftmaxTopK.route(&logits(), 5).is_err());
    }

    #[test]
    fn test_weights_carry_gradient_to_logits() {
        let l = logits().with_requires_grad();
        let d = TopKSoftmax.route(&l, 1).unwrap();
        // a single kept expert always gets weight one, so only the aux path remains
        assert!(d.weights.to_vec().iter().all(|w| (w - 1.0).abs() < 1e-6));
        d.probs.sum().unwrap().backward().unwrap();
        assert!(l.grad().is_some());
    }
}
