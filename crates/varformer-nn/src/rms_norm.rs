//! RMSNorm: `y = x / sqrt(mean(x^2) + eps) * gamma`.
//!
//! No mean subtraction and no bias. Forward and backward are fused per row.

use varformer_core::{GradFn, Result, Tensor, VarError};

use crate::module::Module;

pub struct RMSNorm {
    gamma: Tensor,
    eps: f32,
}

impl RMSNorm {
    pub fn new(dim: usize, eps: f32) -> Self {
        Self {
            gamma: Tensor::ones(&[dim]).with_requires_grad(),
            eps,
        }
    }

    pub fn gamma(&self) -> &Tensor {
        &self.gamma
    }

    pub fn dim(&self) -> usize {
        self.gamma.numel()
    }
}

impl Module for RMSNorm {
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
        let rows = x.len() / dim;
        let mut out = vec![0.0f32; x.len()];
        let mut rrms = vec![0.0f32; rows];

        for r in 0..rows {
            let row = &x[r * dim..(r + 1) * dim];
            let ms = row.iter().map(|v| v * v).sum::<f32>() / dim as f32;
            let inv = 1.0 / (ms + self.eps).sqrt();
            rrms[r] = inv;
            for i in 0..dim {
                out[r * dim + i] = row[i] * inv * g[i];
            }
        }

        let out = Tensor::from_vec(out, input.dims())?;
        Ok(out.attach_grad_fn(
            RMSNormBackward {
                input: input.detach(),
                gamma: self.gamma.detach(),
                rrms,
            },
            &[input, &self.gamma],
        ))
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        vec![("weight".to_string(), &self.gamma)]
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        vec![("weight".to_string(), &mut self.gamma)]
    }
}

/// With `u = gamma * dy` and `r = 1/rms`: `dx = r*u - x * r^3 * mean(u * x)`.
struct RMSNormBackward {
    input: Tensor,
    gamma: Tensor,
    rrms: Vec<f32>,
}

impl GradFn for RMSNormBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let dy = grad_output.as_f32_slice();
        let x = self.input.as_f32_slice();
        let g = self.gamma.as_f32_slice();
        let dim = g.len();
        let mut dx = vec![0.0f32; x.len()];
        let mut dgamma = vec![0.0f32; dim];

        for (r, &inv) in self.rrms.iter().enumerate() {
            let base = r * dim;
            let mut dot = 0.0;
            for i in 0..dim {
                dot += g[i] * dy[base + i] * x[base + i];
                dgamma[i] += dy[base + i] * x[base + i] * inv;
            }
            let coeff = inv * inv * inv * dot / dim as f32;
            for i in 0..dim {
                dx[base + i] = inv * g[i] * dy[base + i] - x[base + i] * coeff;
            }
        }

        Ok(vec![
            Some(Tensor::from_vec(dx, self.input.dims())?),
            Some(Tensor::from_vec(dgamma, &[dim])?),
        ])
    }

    fn name(&self) -> &str {
        "RMSNormBackward"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use varformer_core::gradcheck::assert_gradient;

    #[test]
    fn test_rms_norm_unit_rms() {
        let norm = RMSNorm::new(4, 1e-8);
        let y = norm
            .forward(&Tensor::from_f32(&[1.0, -2.0, 3.0, 0.5], &[1, 4]))
            .unwrap()
            .to_vec();
        let ms: f32 = y.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!((ms - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_rms_norm_input_gradient() {
        let norm = RMSNorm::new(4, 1e-6);
        let w = Tensor::from_f32(&[0.5, -1.0, 0.3, 2.0, 1.0, 0.2, -0.7, 0.4], &[2, 4]);
        let x0 = Tensor::from_f32(&[1.0, -0.5, 0.25, 2.0, -1.5, 0.75, 1.25, -0.3], &[2, 4]);
        assert_gradient(&|x| norm.forward(x)?.mul(&w)?.sum(), &x0, 0.03, "rmsnorm x").unwrap();
    }

    #[test]
    fn test_rms_norm_gamma_gradient() {
        let norm = RMSNorm::new(2, 0.0);
        let x = Tensor::from_f32(&[3.0, 4.0], &[1, 2]);
        norm.forward(&x).unwrap().sum().unwrap().backward().unwrap();
        let rms = (12.5f32).sqrt();
        let g = norm.gamma().grad().unwrap().to_vec();
        assert!((g[0] - 3.0 / rms).abs() < 1e-5);
        assert!((g[1] - 4.0 / rms).abs() < 1e-5);
    }
}
