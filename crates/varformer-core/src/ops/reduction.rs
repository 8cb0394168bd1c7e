//! Reductions and row-wise normalizers over the last axis.

use rayon::prelude::*;

use crate::autograd::{GradFn, SumBackward};
use crate::error::VarError;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

const PAR_THRESHOLD: usize = 8192;

impl Tensor {
    /// Sum of all elements as a scalar tensor.
    pub fn sum(&self) -> Result<Tensor> {
        let data = self.as_f32_slice();
        let total: f32 = if data.len() >= PAR_THRESHOLD {
            data.par_iter().sum()
        } else {
            data.iter().sum()
        };
        Ok(Tensor::scalar(total).attach_grad_fn(
            SumBackward {
                input_shape: self.shape().clone(),
                scale: 1.0,
            },
            &[self],
        ))
    }

    /// Mean of all elements as a scalar tensor.
    pub fn mean(&self) -> Result<Tensor> {
        let n = self.numel().max(1) as f32;
        let data = self.as_f32_slice();
        let total: f32 = if data.len() >= PAR_THRESHOLD {
            data.par_iter().sum()
        } else {
            data.iter().sum()
        };
        Ok(Tensor::scalar(total / n).attach_grad_fn(
            SumBackward {
                input_shape: self.shape().clone(),
                scale: 1.0 / n,
            },
            &[self],
        ))
    }

    /// Sum over the last axis, keeping it as size 1.
    pub fn sum_last_keepdim(&self) -> Result<Tensor> {
        let cols = self.shape().last_dim();
        let out: Vec<f32> = self
            .as_f32_slice()
            .chunks(cols.max(1))
            .map(|row| row.iter().sum())
            .collect();
        let result = Tensor::from_parts(out, keepdim_shape(self.shape()));
        Ok(result.attach_grad_fn(
            SumLastBackward {
                input_shape: self.shape().clone(),
            },
            &[self],
        ))
    }

    /// Largest magnitude over all elements (0 for an empty tensor).
    pub fn max_abs(&self) -> f32 {
        let data = self.as_f32_slice();
        if data.len() >= PAR_THRESHOLD {
            data.par_iter().map(|v| v.abs()).reduce(|| 0.0, f32::max)
        } else {
            data.iter().fold(0.0f32, |m, v| m.max(v.abs()))
        }
    }

    /// Row maxima over the last axis, keepdim, no graph.
    pub fn max_last_keepdim(&self) -> Tensor {
        let cols = self.shape().last_dim().max(1);
        let out = self
            .as_f32_slice()
            .chunks(cols)
            .map(|row| row.iter().copied().fold(f32::NEG_INFINITY, f32::max))
            .collect();
        Tensor::from_parts(out, keepdim_shape(self.shape()))
    }

    /// Index of the maximum in each row of the last axis.
    pub fn argmax_last(&self) -> Vec<usize> {
        let cols = self.shape().last_dim().max(1);
        self.as_f32_slice()
            .chunks(cols)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 {
                            (i, v)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect()
    }

    /// Top-`k` indices per row of the last axis, largest first; ties keep the lower index.
    pub fn topk_last(&self, k: usize) -> Result<Vec<Vec<usize>>> {
        let cols = self.shape().last_dim();
        if k > cols {
            return Err(VarError::IndexOutOfRange { index: k, size: cols });
        }
        Ok(self
            .as_f32_slice()
            .chunks(cols.max(1))
            .map(|row| {
                let mut order: Vec<usize> = (0..row.len()).collect();
                order.sort_by(|&a, &b| row[b].total_cmp(&row[a]).then(a.cmp(&b)));
                order.truncate(k);
                order
            })
            .collect())
    }

    /// Numerically stable softmax over the last axis.
    ///
    /// A row that is entirely `-inf` produces zeros instead of NaN.
    pub fn softmax(&self) -> Result<Tensor> {
        let cols = self.shape().last_dim().max(1);
        let mut out = self.to_vec();
        let rows = |row: &mut [f32]| {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            if max == f32::NEG_INFINITY {
                row.iter_mut().for_each(|v| *v = 0.0);
                return;
            }
            let mut denom = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                denom += *v;
            }
            row.iter_mut().for_each(|v| *v /= denom);
        };
        if out.len() >= PAR_THRESHOLD {
            out.par_chunks_mut(cols).for_each(rows);
        } else {
            out.chunks_mut(cols).for_each(rows);
        }
        let result = Tensor::from_parts(out, self.shape().clone());
        let saved = result.detach();
        Ok(result.attach_grad_fn(SoftmaxBackward { output: saved }, &[self]))
    }

    /// `x - logsumexp(x)` over the last axis.
    pub fn log_softmax(&self) -> Result<Tensor> {
        let cols = self.shape().last_dim().max(1);
        let mut out = self.to_vec();
        for row in out.chunks_mut(cols) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let lse = max + row.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
            row.iter_mut().for_each(|v| *v -= lse);
        }
        let result = Tensor::from_parts(out, self.shape().clone());
        let saved = result.detach();
        Ok(result.attach_grad_fn(LogSoftmaxBackward { output: saved }, &[self]))
    }
}

fn keepdim_shape(shape: &Shape) -> Shape {
    let mut dims = shape.dims().to_vec();
    match dims.last_mut() {
        Some(last) => *last = 1,
        None => dims.push(1),
    }
    Shape::from(dims)
}

struct SumLastBackward {
    input_shape: Shape,
}

impl GradFn for SumLastBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let cols = self.input_shape.last_dim().max(1);
        let g = grad_output.as_f32_slice();
        let out = (0..self.input_shape.numel()).map(|i| g[i / cols]).collect();
        Ok(vec![Some(Tensor::from_parts(out, self.input_shape.clone()))])
    }
    fn name(&self) -> &str {
        "SumLastBackward"
    }
}

/// `dx = y * (g - sum(g * y))` per row.
struct SoftmaxBackward {
    output: Tensor,
}

impl GradFn for SoftmaxBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let cols = self.output.shape().last_dim().max(1);
        let y = self.output.as_f32_slice();
        let mut dx = grad_output.to_vec();
        for (row, y_row) in dx.chunks_mut(cols).zip(y.chunks(cols)) {
            let dot: f32 = row.iter().zip(y_row).map(|(g, y)| g * y).sum();
            for (d, &yv) in row.iter_mut().zip(y_row) {
                *d = yv * (*d - dot);
            }
        }
        Ok(vec![Some(Tensor::from_parts(dx, self.output.shape().clone()))])
    }
    fn name(&self) -> &str {
        "SoftmaxBackward"
    }
}

/// `dx = g - softmax(x) * sum(g)` per row.
struct LogSoftmaxBackward {
    output: Tensor,
}

impl GradFn for LogSoftmaxBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let cols = self.output.shape().last_dim().max(1);
        let y = self.output.as_f32_slice();
        let mut dx = grad_output.to_vec();
        for (row, y_row) in dx.chunks_mut(cols).zip(y.chunks(cols)) {
            let total: f32 = row.iter().sum();
            for (d, &yv) in row.iter_mut().zip(y_row) {
                *d -= yv.exp() * total;
            }
        }
        Ok(vec![Some(Tensor::from_parts(dx, self.output.shape().clone()))])
    }
    fn name(&self) -> &str {
        "LogSoftmaxBackward"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_and_mean() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        assert_eq!(t.sum().unwrap().item().unwrap(), 10.0);
        assert_eq!(t.mean().unwrap().item().unwrap(), 2.5);
    }

    #[test]
    fn test_sum_last_keepdim() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let s = t.sum_last_keepdim().unwrap();
        assert_eq!(s.dims(), &[2, 1]);
        assert_eq!(s.to_vec(), vec![6.0, 15.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 1000.0, 1000.0, f32::NEG_INFINITY], &[2, 3]);
        let s = t.softmax().unwrap().to_vec();
        assert!((s[0] + s[1] + s[2] - 1.0).abs() < 1e-6);
        assert!((s[3] - 0.5).abs() < 1e-6);
        assert_eq!(s[5], 0.0);
    }

    #[test]
    fn test_fully_masked_row_is_zero() {
        let t = Tensor::full(&[1, 3], f32::NEG_INFINITY);
        assert_eq!(t.softmax().unwrap().to_vec(), vec![0.0; 3]);
    }

    #[test]
    fn test_log_softmax_matches_log_of_softmax() {
        let t = Tensor::from_f32(&[0.5, -1.0, 2.0], &[3]);
        let a = t.log_softmax().unwrap().to_vec();
        let b: Vec<f32> = t.softmax().unwrap().to_vec().iter().map(|v| v.ln()).collect();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_topk_and_argmax() {
        let t = Tensor::from_f32(&[0.1, 0.7, 0.2, 0.5, 0.5, 0.0], &[2, 3]);
        assert_eq!(t.topk_last(2).unwrap(), vec![vec![1, 2], vec![0, 1]]);
        assert_eq!(t.argmax_last(), vec![1, 0]);
        assert!(t.topk_last(4).is_err());
    }

    #[test]
    fn test_max_abs() {
        let t = Tensor::from_f32(&[0.5, -3.0, 2.0], &[3]);
        assert_eq!(t.max_abs(), 3.0);
        assert_eq!(Tensor::zeros(&[4]).max_abs(), 0.0);
    }
}
