//! Element-wise arithmetic with broadcasting, scalar ops and batched matmul.

use rayon::prelude::*;

use crate::autograd::{
    AddBackward, DivBackward, ElementwiseBackward, MatmulBackward, MulBackward, SubBackward,
};
use crate::error::VarError;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

/// Below this many multiply-adds, matmul stays on the calling thread.
const PAR_MATMUL_THRESHOLD: usize = 1 << 16;

impl Tensor {
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        let out = binary_op(self, other, |a, b| a + b)?;
        Ok(out.attach_grad_fn(
            AddBackward {
                lhs_shape: self.shape().clone(),
                rhs_shape: other.shape().clone(),
            },
            &[self, other],
        ))
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        let out = binary_op(self, other, |a, b| a - b)?;
        Ok(out.attach_grad_fn(
            SubBackward {
                lhs_shape: self.shape().clone(),
                rhs_shape: other.shape().clone(),
            },
            &[self, other],
        ))
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        let out = binary_op(self, other, |a, b| a * b)?;
        Ok(out.attach_grad_fn(
            MulBackward {
                lhs: self.detach(),
                rhs: other.detach(),
            },
            &[self, other],
        ))
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        let out = binary_op(self, other, |a, b| a / b)?;
        Ok(out.attach_grad_fn(
            DivBackward {
                lhs: self.detach(),
                rhs: other.detach(),
            },
            &[self, other],
        ))
    }

    /// Apply `f` element-wise; `df(x, y)` gives the local derivative at input `x`
    /// with output `y` and is only evaluated when a graph is being recorded.
    pub fn map_with_derivative(
        &self,
        op: &'static str,
        f: impl Fn(f32) -> f32 + Sync,
        df: impl Fn(f32, f32) -> f32 + Sync,
    ) -> Result<Tensor> {
        let x = self.as_f32_slice();
        let y: Vec<f32> = x.iter().map(|&v| f(v)).collect();
        let record = Tensor::should_record(&[self]);
        let derivative = record.then(|| {
            let d: Vec<f32> = x.iter().zip(&y).map(|(&a, &b)| df(a, b)).collect();
            Tensor::from_parts(d, self.shape().clone())
        });
        let out = Tensor::from_parts(y, self.shape().clone());
        Ok(match derivative {
            Some(derivative) => out.attach_grad_fn(ElementwiseBackward { derivative, op }, &[self]),
            None => out,
        })
    }

    pub fn neg(&self) -> Result<Tensor> {
        self.map_with_derivative("NegBackward", |x| -x, |_, _| -1.0)
    }

    pub fn add_scalar(&self, s: f32) -> Result<Tensor> {
        self.map_with_derivative("AddScalarBackward", move |x| x + s, |_, _| 1.0)
    }

    pub fn mul_scalar(&self, s: f32) -> Result<Tensor> {
        self.map_with_derivative("MulScalarBackward", move |x| x * s, move |_, _| s)
    }

    pub fn pow_scalar(&self, p: f32) -> Result<Tensor> {
        self.map_with_derivative(
            "PowBackward",
            move |x| x.powf(p),
            move |x, _| p * x.powf(p - 1.0),
        )
    }

    pub fn exp(&self) -> Result<Tensor> {
        self.map_with_derivative("ExpBackward", f32::exp, |_, y| y)
    }

    pub fn log(&self) -> Result<Tensor> {
        self.map_with_derivative("LogBackward", f32::ln, |x, _| 1.0 / x)
    }

    pub fn sqrt(&self) -> Result<Tensor> {
        self.map_with_derivative("SqrtBackward", f32::sqrt, |_, y| 0.5 / y)
    }

    pub fn abs(&self) -> Result<Tensor> {
        self.map_with_derivative("AbsBackward", f32::abs, |x, _| {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        })
    }

    /// Matrix product over the last two dimensions with broadcast batch dimensions.
    ///
    /// - `[M, K] @ [K, N] -> [M, N]`
    /// - `[B, T, K] @ [K, N] -> [B, T, N]`
    /// - `[B, H, M, K] @ [B, H, K, N] -> [B, H, M, N]`
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        if self.ndim() < 2 || other.ndim() < 2 {
            return Err(VarError::ShapeMismatch {
                expected: vec![0, 0],
                got: if self.ndim() < 2 {
                    self.dims().to_vec()
                } else {
                    other.dims().to_vec()
                },
            });
        }
        let (a_batch, a_mat) = self.dims().split_at(self.ndim() - 2);
        let (b_batch, b_mat) = other.dims().split_at(other.ndim() - 2);
        let (m, k) = (a_mat[0], a_mat[1]);
        let (k2, n) = (b_mat[0], b_mat[1]);
        if k != k2 {
            return Err(VarError::MatmulDimMismatch { m, k1: k, k2, n });
        }

        let a_batch = Shape::new(a_batch);
        let b_batch = Shape::new(b_batch);
        let batch = a_batch
            .broadcast_with(&b_batch)
            .ok_or_else(|| VarError::BroadcastError {
                a: self.dims().to_vec(),
                b: other.dims().to_vec(),
            })?;

        let a = self.as_f32_slice();
        let b = other.as_f32_slice();
        let mut out = vec![0.0f32; batch.numel() * m * n];

        if b_batch.numel() == 1 && a_batch.numel() == batch.numel() {
            // Weight-style rhs: fold every batch row into one tall GEMM.
            gemm(a, b, &mut out, batch.numel() * m, k, n);
        } else {
            let a_strides = a_batch.broadcast_strides(&batch);
            let b_strides = b_batch.broadcast_strides(&batch);
            let offsets: Vec<(usize, usize)> = (0..batch.numel())
                .map(|i| {
                    let (oa, ob) = batch_offsets(i, batch.dims(), &a_strides, &b_strides);
                    (oa * m * k, ob * k * n)
                })
                .collect();
            let work = |(i, chunk): (usize, &mut [f32])| {
                let (oa, ob) = offsets[i];
                gemm(&a[oa..oa + m * k], &b[ob..ob + k * n], chunk, m, k, n);
            };
            if m * n * k * batch.numel() >= PAR_MATMUL_THRESHOLD && m * n > 0 {
                out.par_chunks_mut(m * n).enumerate().for_each(work);
            } else if m * n > 0 {
                out.chunks_mut(m * n).enumerate().for_each(work);
            }
        }

        let mut dims = batch.dims().to_vec();
        dims.extend([m, n]);
        let result = Tensor::from_parts(out, Shape::new(&dims));
        Ok(result.attach_grad_fn(
            MatmulBackward {
                lhs: self.detach(),
                rhs: other.detach(),
            },
            &[self, other],
        ))
    }

    /// Sum a broadcast gradient back down to `target` (no graph).
    pub fn sum_to_shape(&self, target: &Shape) -> Result<Tensor> {
        if self.shape() == target {
            return Ok(self.detach());
        }
        match target.broadcast_with(self.shape()) {
            Some(s) if &s == self.shape() => {}
            _ => {
                return Err(VarError::BroadcastError {
                    a: self.dims().to_vec(),
                    b: target.dims().to_vec(),
                })
            }
        }
        let strides = target.broadcast_strides(self.shape());
        let dims = self.dims();
        let mut out = vec![0.0f32; target.numel()];
        let mut index = vec![0usize; dims.len()];
        let mut offset = 0usize;
        for &g in self.as_f32_slice() {
            out[offset] += g;
            advance(&mut index, dims, &mut offset, &strides, None);
        }
        Ok(Tensor::from_parts(out, target.clone()))
    }
}

/// Row-major `out[m, n] += a[m, k] @ b[k, n]` with rows split across rayon when large.
fn gemm(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    if n == 0 {
        return;
    }
    let row = |(i, out_row): (usize, &mut [f32])| {
        let a_row = &a[i * k..(i + 1) * k];
        for (p, &av) in a_row.iter().enumerate() {
            let b_row = &b[p * n..(p + 1) * n];
            for (o, &bv) in out_row.iter_mut().zip(b_row) {
                *o += av * bv;
            }
        }
    };
    if m * n * k >= PAR_MATMUL_THRESHOLD {
        out[..m * n].par_chunks_mut(n).enumerate().for_each(row);
    } else {
        out[..m * n].chunks_mut(n).enumerate().for_each(row);
    }
}

fn batch_offsets(
    mut i: usize,
    dims: &[usize],
    a_strides: &[usize],
    b_strides: &[usize],
) -> (usize, usize) {
    let (mut oa, mut ob) = (0, 0);
    for d in (0..dims.len()).rev() {
        let idx = i % dims[d];
        i /= dims[d];
        oa += idx * a_strides[d];
        ob += idx * b_strides[d];
    }
    (oa, ob)
}

/// Step a row-major multi-index, keeping one or two strided offsets in sync.
pub(crate) fn advance(
    index: &mut [usize],
    dims: &[usize],
    off_a: &mut usize,
    strides_a: &[usize],
    mut second: Option<(&mut usize, &[usize])>,
) {
    for d in (0..dims.len()).rev() {
        index[d] += 1;
        *off_a += strides_a[d];
        if let Some((off_b, strides_b)) = second.as_mut() {
            **off_b += strides_b[d];
        }
        if index[d] < dims[d] {
            return;
        }
        *off_a -= strides_a[d] * dims[d];
        if let Some((off_b, strides_b)) = second.as_mut() {
            **off_b -= strides_b[d] * dims[d];
        }
        index[d] = 0;
    }
}

/// Broadcasting element-wise kernel shared by the binary ops (no graph).
pub(crate) fn binary_op(a: &Tensor, b: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
    let (x, y) = (a.as_f32_slice(), b.as_f32_slice());
    if a.shape() == b.shape() {
        let out = x.iter().zip(y).map(|(&p, &q)| f(p, q)).collect();
        return Ok(Tensor::from_parts(out, a.shape().clone()));
    }
    if b.numel() == 1 && b.ndim() <= a.ndim() {
        let q = y[0];
        let out = x.iter().map(|&p| f(p, q)).collect();
        return Ok(Tensor::from_parts(out, a.shape().clone()));
    }

    let shape = a
        .shape()
        .broadcast_with(b.shape())
        .ok_or_else(|| VarError::BroadcastError {
            a: a.dims().to_vec(),
            b: b.dims().to_vec(),
        })?;
    let sa = a.shape().broadcast_strides(&shape);
    let sb = b.shape().broadcast_strides(&shape);
    let dims = shape.dims();
    let mut out = Vec::with_capacity(shape.numel());
    let mut index = vec![0usize; dims.len()];
    let (mut ia, mut ib) = (0usize, 0usize);
    for _ in 0..shape.numel() {
        out.push(f(x[ia], y[ib]));
        advance(&mut index, dims, &mut ia, &sa, Some((&mut ib, &sb)));
    }
    Ok(Tensor::from_parts(out, shape))
}
