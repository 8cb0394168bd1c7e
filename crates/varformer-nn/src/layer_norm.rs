//! Layer normalization over the last dimension with a fused backward pass.
//!
//! `y = (x - mean) / sqrt(var + eps) * gamma + beta`

use varformer_core::{GradFn, Result, Tensor, VarError};

use crate::module::Module;

pub struct LayerNorm {
    gamma: Tensor,
    beta: Option<Tensor>,
    eps: f32,
}

impl LayerNorm {
    pub fn new(dim: usize, eps: f32, bias: bool) -> Self {
        Self {
            gamma: Tensor::ones(&[dim]).with_requires_grad(),
            beta: bias.then(|| Tensor::zeros(&[dim]).with_requires_grad()),
            eps,
        }
    }

    pub fn gamma(&self) -> &Tensor {
        &self.gamma
    }

    pub fn beta(&self) -> Option<&Tensor> {
        self.beta.as_ref()
    }

    pub fn dim(&self) -> usize {
        self.gamma.numel()
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }
}

impl Module for LayerNorm {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let dim = self.dim();
        if input.ndim() == 0 || input.shape().last_dim() != dim {
            return Err(VarError::ShapeMismatch {
                expected: vec![dim],
                got: input.dims().to_vec(),
            });
        }
        let x = input.as_f32_slice();
        let g = self.gamma.as_f32_slice();
        let b = self.beta.as_ref().map(|t| t.as_f32_slice());
        let rows = x.len() / dim;

        let mut out = vec![0.0f32; x.len()];
        let mut xhat = vec![0.0f32; x.len()];
        let mut rstd = vec![0.0f32; rows];
        for r in 0..rows {
            let row = &x[r * dim..(r + 1) * dim];
            let mean = row.iter().sum::<f32>() / dim as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / dim as f32;
            let inv = 1.0 / (var + self.eps).sqrt();
            rstd[r] = inv;
            for i in 0..dim {
                let h = (row[i] - mean) * inv;
                xhat[r * dim + i] = h;
                out[r * dim + i] = h * g[i] + b.map_or(0.0, |b| b[i]);
            }
        }

        let out = Tensor::from_vec(out, input.dims())?;
        let mut inputs = vec![input, &self.gamma];
        if let Some(beta) = &self.beta {
            inputs.push(beta);
        }
        Ok(out.attach_grad_fn(
            LayerNormBackward {
                xhat,
                rstd,
                gamma: self.gamma.detach(),
                has_beta: self.beta.is_some(),
                input_dims: input.dims().to_vec(),
            },
            &inputs,
        ))
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = vec![("weight".to_string(), &self.gamma)];
        if let Some(b) = &self.beta {
            params.push(("bias".to_string(), b));
        }
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = vec![("weight".to_string(), &mut self.gamma)];
        if let Some(b) = &mut self.beta {
            params.push(("bias".to_string(), b));
        }
        params
    }
}

/// `dx = rstd * (dxhat - mean(dxhat) - xhat * mean(dxhat * xhat))` with `dxhat = g * dy`.
struct LayerNormBackward {
    xhat: Vec<f32>,
    rstd: Vec<f32>,
    gamma: Tensor,
    has_beta: bool,
    input_dims: Vec<usize>,
}

impl GradFn for LayerNormBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let dy = grad_output.as_f32_slice();
        let g = self.gamma.as_f32_slice();
        let dim = g.len();
        let mut dx = vec![0.0f32; dy.len()];
        let mut dgamma = vec![0.0f32; dim];
        let mut dbeta = vec![0.0f32; dim];

        for (r, &inv) in self.rstd.iter().enumerate() {
            let base = r * dim;
            let mut mean_d = 0.0;
            let mut mean_dx = 0.0;
            for i in 0..dim {
                let d = dy[base + i] * g[i];
                mean_d += d;
                mean_dx += d * self.xhat[base + i];
                dgamma[i] += dy[base + i] * self.xhat[base + i];
                dbeta[i] += dy[base + i];
            }
            mean_d /= dim as f32;
            mean_dx /= dim as f32;
            for i in 0..dim {
                let d = dy[base + i] * g[i];
                dx[base + i] = inv * (d - mean_d - self.xhat[base + i] * mean_dx);
            }
        }

        let mut grads = vec![
            Some(Tensor::from_vec(dx, &self.input_dims)?),
            Some(Tensor::from_vec(dgamma, &[dim])?),
        ];
        if self.has_beta {
            grads.push(Some(Tensor::from_vec(dbeta, &[dim])?));
        }
        Ok(grads)
    }

    fn name(&self) -> &str {
        "LayerNormBackward"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use varformer_core::gradcheck::assert_gradient;

    #[test]
    fn test_layer_norm_normalizes_rows() {
        let ln = LayerNorm::new(4, 1e-5, true);
        let x = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, -2.0, 0.0, 2.0, 4.0], &[2, 4]);
        let y = ln.forward(&x).unwrap().to_vec();
        for row in y.chunks(4) {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_layer_norm_rejects_wrong_width() {
        let ln = LayerNorm::new(4, 1e-5, false);
        assert!(ln.forward(&Tensor::ones(&[2, 3])).is_err());
        assert_eq!(ln.parameters().len(), 1);
    }

    #[test]
    fn test_layer_norm_input_gradient() {
        let ln = LayerNorm::new(3, 1e-5, true);
        let w = Tensor::from_f32(&[0.3, -1.2, 0.7, 2.0, 0.1, -0.4], &[2, 3]);
        let x0 = Tensor::from_f32(&[0.5, -1.0, 2.0, 1.5, 0.25, -0.75], &[2, 3]);
        assert_gradient(&|x| ln.forward(x)?.mul(&w)?.sum(), &x0, 0.03, "layernorm x").unwrap();
    }

    #[test]
    fn test_layer_norm_parameter_gradients() {
        let ln = LayerNorm::new(3, 1e-5, true);
        let x = Tensor::from_f32(&[1.0, 2.0, 4.0], &[1, 3]);
        let w = Tensor::from_f32(&[1.0, 2.0, 3.0], &[1, 3]);
        ln.forward(&x).unwrap().mul(&w).unwrap().sum().unwrap().backward().unwrap();
        let xhat = LayerNorm::new(3, 1e-5, true).forward(&x).unwrap().to_vec();
        let dgamma = ln.gamma().grad().unwrap().to_vec();
        for i in 0..3 {
            assert!((dgamma[i] - w.to_vec()[i] * xhat[i]).abs() < 1e-5);
        }
        assert_eq!(ln.beta().unwrap().grad().unwrap().to_vec(), vec![1.0, 2.0, 3.0]);
    }
}
