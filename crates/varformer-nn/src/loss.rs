//! Loss functions.

use varformer_core::{Result, Tensor, VarError};

/// Target value that contributes nothing to the loss.
pub const IGNORE_INDEX: usize = usize::MAX;

/// Mean cross-entropy over the rows of `logits: [N, C]`, skipping `IGNORE_INDEX`.
///
/// Returns a zero scalar when every target is ignored.
pub fn cross_entropy(logits: &Tensor, targets: &[usize]) -> Result<Tensor> {
    if logits.ndim() != 2 || logits.dims()[0] != targets.len() {
        return Err(VarError::ShapeMismatch {
            expected: vec![targets.len(), logits.shape().last_dim()],
            got: logits.dims().to_vec(),
        });
    }
    let classes = logits.dims()[1];
    let mut flat = Vec::with_capacity(targets.len());
    for (row, &t) in targets.iter().enumerate() {
        if t == IGNORE_INDEX {
            continue;
        }
        if t >= classes {
            return Err(VarError::IndexOutOfRange { index: t, size: classes });
        }
        flat.push(row * classes + t);
    }
    if flat.is_empty() {
        return Ok(Tensor::scalar(0.0));
    }

    let log_probs = logits.log_softmax()?.reshape(&[-1])?;
    let picked = log_probs.index_select(0, &flat)?;
    picked.mean()?.neg()
}

/// Mean squared error.
pub fn mse(prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
    prediction.sub(target)?.pow_scalar(2.0)?.mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use varformer_core::gradcheck::assert_gradient;

    #[test]
    fn test_uniform_logits_give_log_classes() {
        let logits = Tensor::zeros(&[2, 4]);
        let loss = cross_entropy(&logits, &[1, 3]).unwrap().item().unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_ignored_targets() {
        let logits = Tensor::from_f32(&[5.0, 0.0, 0.0, 0.0, 0.0, 0.0], &[2, 3]);
        let a = cross_entropy(&logits, &[0, IGNORE_INDEX]).unwrap().item().unwrap();
        let b = cross_entropy(&logits.narrow(0, 0, 1).unwrap(), &[0]).unwrap().item().unwrap();
        assert!((a - b).abs() < 1e-6);
        assert_eq!(cross_entropy(&logits, &[IGNORE_INDEX; 2]).unwrap().item().unwrap(), 0.0);
        assert!(cross_entropy(&logits, &[3, 0]).is_err());
    }

    #[test]
    fn test_cross_entropy_gradient() {
        let x0 = Tensor::from_f32(&[0.2, -0.5, 1.0, 0.3, 0.8, -1.2], &[2, 3]);
        assert_gradient(&|x| cross_entropy(x, &[2, 0]), &x0, 0.02, "cross_entropy").unwrap();
    }

    #[test]
    fn test_mse() {
        let a = Tensor::from_f32(&[1.0, 2.0], &[2]);
        let b = Tensor::from_f32(&[0.0, 4.0], &[2]);
        assert_eq!(mse(&a, &b).unwrap().item().unwrap(), 2.5);
    }
}
