use rand::Rng;
use varformer_core::{Result, Tensor, VarError};

use crate::module::Module;

/// Standard deviation of the default normal initialization.
pub const INIT_STD: f32 = 0.02;

/// `y = x @ W^T + b` for `W: [out, in]`, broadcasting over leading input dims.
pub fn linear(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let in_features = weight.dims()[1];
    if input.shape().last_dim() != in_features {
        return Err(VarError::ShapeMismatch {
            expected: vec![in_features],
            got: input.dims().to_vec(),
        });
    }
    let out = input.matmul(&weight.transpose(0, 1)?)?;
    match bias {
        Some(b) => out.add(b),
        None => Ok(out),
    }
}

/// Fully connected layer: `y = x @ W^T + b`.
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Normal(0, 0.02) weights from the thread RNG, zero bias.
    pub fn new(in_features: usize, out_features: usize, bias: bool) -> Self {
        Self::with_rng(in_features, out_features, bias, INIT_STD, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        bias: bool,
        std: f32,
        rng: &mut R,
    ) -> Self {
        let weight = Tensor::randn_with(&[out_features, in_features], std, rng).with_requires_grad();
        let bias = bias.then(|| Tensor::zeros(&[out_features]).with_requires_grad());
        Self { weight, bias }
    }

    /// Build from explicit tensors; both become trainable leaves.
    pub fn from_weights(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        if weight.ndim() != 2 {
            return Err(VarError::ShapeMismatch {
                expected: vec![0, 0],
                got: weight.dims().to_vec(),
            });
        }
        if let Some(b) = &bias {
            if b.dims() != [weight.dims()[0]] {
                return Err(VarError::ShapeMismatch {
                    expected: vec![weight.dims()[0]],
                    got: b.dims().to_vec(),
                });
            }
        }
        Ok(Self {
            weight: weight.detach().with_requires_grad(),
            bias: bias.map(|b| b.detach().with_requires_grad()),
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        linear(input, &self.weight, self.bias.as_ref())
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = vec![("weight".to_string(), &self.weight)];
        if let Some(b) = &self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = vec![("weight".to_string(), &mut self.weight)];
        if let Some(b) = &mut self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }
}

impl std::fmt::Display for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Linear(in={}, out={}, bias={})",
            self.in_features(),
            self.out_features(),
            self.bias.is_some()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use varformer_core::gradcheck::assert_gradient;

    #[test]
    fn test_linear_shapes_and_params() {
        let layer = Linear::new(4, 3, true);
        assert_eq!(layer.weight().dims(), &[3, 4]);
        assert_eq!(layer.parameters().len(), 2);
        assert_eq!(layer.num_parameters(), 15);
        let out = layer.forward(&Tensor::ones(&[2, 5, 4])).unwrap();
        assert_eq!(out.dims(), &[2, 5, 3]);
        assert_eq!(Linear::new(4, 3, false).parameters().len(), 1);
    }

    #[test]
    fn test_linear_known_values() {
        let w = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = Tensor::from_f32(&[0.5, -0.5], &[2]);
        let layer = Linear::from_weights(w, Some(b)).unwrap();
        let y = layer.forward(&Tensor::from_f32(&[1.0, 1.0], &[1, 2])).unwrap();
        assert_eq!(y.to_vec(), vec![3.5, 6.5]);
    }

    #[test]
    fn test_linear_rejects_wrong_width() {
        let layer = Linear::new(4, 3, false);
        assert!(layer.forward(&Tensor::ones(&[2, 5])).is_err());
    }

    #[test]
    fn test_linear_weight_gradient() {
        let x = Tensor::from_f32(&[0.5, -1.0, 2.0, 0.25, 1.5, -0.5], &[3, 2]);
        let w0 = Tensor::from_f32(&[0.1, 0.2, -0.3, 0.4], &[2, 2]);
        assert_gradient(&|w| linear(&x, w, None)?.pow_scalar(2.0)?.sum(), &w0, 0.02, "linear w").unwrap();
    }
}
