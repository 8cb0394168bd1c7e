//! Shape manipulation, slicing, gather/scatter along an axis and masking.

use crate::autograd::GradFn;
use crate::error::VarError;
use crate::ops::arithmetic::binary_op;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

/// Resolve a possibly negative axis against `ndim`.
pub fn normalize_axis(axis: isize, ndim: usize) -> Result<usize> {
    let resolved = if axis < 0 { axis + ndim as isize } else { axis };
    if resolved < 0 || resolved as usize >= ndim {
        return Err(VarError::InvalidAxis {
            axis: axis.unsigned_abs(),
            ndim,
        });
    }
    Ok(resolved as usize)
}

impl Tensor {
    /// View the data under a new shape; one entry may be `-1`.
    pub fn reshape(&self, dims: &[isize]) -> Result<Tensor> {
        let shape = self
            .shape()
            .resolve_reshape(dims)
            .ok_or_else(|| VarError::InvalidReshape {
                from: self.dims().to_vec(),
                to: dims.to_vec(),
            })?;
        Ok(self.with_shape(shape).attach_grad_fn(
            ReshapeBackward {
                input_shape: self.shape().clone(),
            },
            &[self],
        ))
    }

    /// Reorder dimensions; `perm[i]` is the source dimension of output dimension `i`.
    pub fn permute(&self, perm: &[usize]) -> Result<Tensor> {
        let ndim = self.ndim();
        let mut seen = vec![false; ndim];
        if perm.len() != ndim || perm.iter().any(|&p| p >= ndim || std::mem::replace(&mut seen[p], true)) {
            return Err(VarError::ShapeMismatch {
                expected: (0..ndim).collect(),
                got: perm.to_vec(),
            });
        }

        let dims = self.dims();
        let src_strides = self.shape().contiguous_strides();
        let out_dims: Vec<usize> = perm.iter().map(|&p| dims[p]).collect();
        let strides: Vec<usize> = perm.iter().map(|&p| src_strides[p]).collect();
        let src = self.as_f32_slice();

        let mut out = Vec::with_capacity(self.numel());
        let mut index = vec![0usize; ndim];
        let mut offset = 0usize;
        for _ in 0..self.numel() {
            out.push(src[offset]);
            crate::ops::arithmetic::advance(&mut index, &out_dims, &mut offset, &strides, None);
        }

        let mut inverse = vec![0usize; ndim];
        for (i, &p) in perm.iter().enumerate() {
            inverse[p] = i;
        }
        Ok(Tensor::from_parts(out, Shape::from(out_dims))
            .attach_grad_fn(PermuteBackward { inverse }, &[self]))
    }

    /// Swap two dimensions (negative indices count from the end).
    pub fn transpose(&self, a: isize, b: isize) -> Result<Tensor> {
        let a = normalize_axis(a, self.ndim())?;
        let b = normalize_axis(b, self.ndim())?;
        let mut perm: Vec<usize> = (0..self.ndim()).collect();
        perm.swap(a, b);
        self.permute(&perm)
    }

    /// Contiguous slice `[start, start + len)` along `axis`.
    pub fn narrow(&self, axis: isize, start: usize, len: usize) -> Result<Tensor> {
        let axis = normalize_axis(axis, self.ndim())?;
        let (outer, size, inner) = self.shape().split_at_axis(axis)?;
        if start + len > size {
            return Err(VarError::IndexOutOfRange {
                index: start + len,
                size,
            });
        }
        let src = self.as_f32_slice();
        let mut out = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = (o * size + start) * inner;
            out.extend_from_slice(&src[base..base + len * inner]);
        }
        let mut dims = self.dims().to_vec();
        dims[axis] = len;
        Ok(Tensor::from_parts(out, Shape::from(dims)).attach_grad_fn(
            NarrowBackward {
                input_shape: self.shape().clone(),
                axis,
                start,
            },
            &[self],
        ))
    }

    /// Concatenate along `axis`; all other dimensions must agree.
    pub fn cat(tensors: &[&Tensor], axis: isize) -> Result<Tensor> {
        let first = tensors.first().ok_or_else(|| VarError::contract("cat of zero tensors"))?;
        let axis = normalize_axis(axis, first.ndim())?;
        let mut dims = first.dims().to_vec();
        let mut sizes = Vec::with_capacity(tensors.len());
        dims[axis] = 0;
        for t in tensors {
            let mut expect = first.dims().to_vec();
            expect[axis] = t.dims().get(axis).copied().unwrap_or(0);
            if t.dims() != expect.as_slice() {
                return Err(VarError::ShapeMismatch {
                    expected: expect,
                    got: t.dims().to_vec(),
                });
            }
            sizes.push(t.dims()[axis]);
            dims[axis] += t.dims()[axis];
        }

        let (outer, _, inner) = first.shape().split_at_axis(axis)?;
        let mut out = Vec::with_capacity(dims.iter().product());
        for o in 0..outer {
            for (t, &len) in tensors.iter().zip(&sizes) {
                let chunk = len * inner;
                out.extend_from_slice(&t.as_f32_slice()[o * chunk..(o + 1) * chunk]);
            }
        }
        Ok(Tensor::from_parts(out, Shape::from(dims)).attach_grad_fn(
            CatBackward { axis, sizes },
            tensors,
        ))
    }

    /// Gather slices `indices` along `axis` (indices may repeat).
    pub fn index_select(&self, axis: isize, indices: &[usize]) -> Result<Tensor> {
        let axis = normalize_axis(axis, self.ndim())?;
        let (outer, size, inner) = self.shape().split_at_axis(axis)?;
        if let Some(&bad) = indices.iter().find(|&&i| i >= size) {
            return Err(VarError::IndexOutOfRange { index: bad, size });
        }
        let src = self.as_f32_slice();
        let mut out = Vec::with_capacity(outer * indices.len() * inner);
        for o in 0..outer {
            for &i in indices {
                let base = (o * size + i) * inner;
                out.extend_from_slice(&src[base..base + inner]);
            }
        }
        let mut dims = self.dims().to_vec();
        dims[axis] = indices.len();
        Ok(Tensor::from_parts(out, Shape::from(dims)).attach_grad_fn(
            IndexSelectBackward {
                input_shape: self.shape().clone(),
                axis,
                indices: indices.to_vec(),
            },
            &[self],
        ))
    }

    /// `self` with `source` slices added at `indices` along `axis`; repeated indices sum.
    pub fn index_add(&self, axis: isize, indices: &[usize], source: &Tensor) -> Result<Tensor> {
        let axis = normalize_axis(axis, self.ndim())?;
        let (outer, size, inner) = self.shape().split_at_axis(axis)?;
        let mut expect = self.dims().to_vec();
        expect[axis] = indices.len();
        if source.dims() != expect.as_slice() {
            return Err(VarError::ShapeMismatch {
                expected: expect,
                got: source.dims().to_vec(),
            });
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= size) {
            return Err(VarError::IndexOutOfRange { index: bad, size });
        }
        let mut out = self.to_vec();
        scatter_add(&mut out, source.as_f32_slice(), indices, outer, size, inner);
        Ok(Tensor::from_parts(out, self.shape().clone()).attach_grad_fn(
            IndexAddBackward {
                axis,
                indices: indices.to_vec(),
            },
            &[self, source],
        ))
    }

    /// Replace entries where `mask` (broadcast to this shape) is non-zero with `value`.
    pub fn masked_fill(&self, mask: &Tensor, value: f32) -> Result<Tensor> {
        match mask.shape().broadcast_with(self.shape()) {
            Some(s) if &s == self.shape() => {}
            _ => {
                return Err(VarError::BroadcastError {
                    a: self.dims().to_vec(),
                    b: mask.dims().to_vec(),
                })
            }
        }
        let out = binary_op(self, mask, |x, m| if m != 0.0 { value } else { x })?;
        Ok(out.attach_grad_fn(
            MaskedFillBackward {
                mask: mask.detach(),
            },
            &[self],
        ))
    }
}

fn scatter_add(out: &mut [f32], src: &[f32], indices: &[usize], outer: usize, size: usize, inner: usize) {
    for o in 0..outer {
        for (j, &i) in indices.iter().enumerate() {
            let dst = (o * size + i) * inner;
            let from = (o * indices.len() + j) * inner;
            for (d, s) in out[dst..dst + inner].iter_mut().zip(&src[from..from + inner]) {
                *d += s;
            }
        }
    }
}

struct ReshapeBackward {
    input_shape: Shape,
}

impl GradFn for ReshapeBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.with_shape(self.input_shape.clone()))])
    }
    fn name(&self) -> &str {
        "ReshapeBackward"
    }
}

struct PermuteBackward {
    inverse: Vec<usize>,
}

impl GradFn for PermuteBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.permute(&self.inverse)?)])
    }
    fn name(&self) -> &str {
        "PermuteBackward"
    }
}

struct NarrowBackward {
    input_shape: Shape,
    axis: usize,
    start: usize,
}

impl GradFn for NarrowBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let (outer, size, inner) = self.input_shape.split_at_axis(self.axis)?;
        let len = grad_output.dims()[self.axis];
        let g = grad_output.as_f32_slice();
        let mut out = vec![0.0f32; self.input_shape.numel()];
        for o in 0..outer {
            let dst = (o * size + self.start) * inner;
            let src = o * len * inner;
            out[dst..dst + len * inner].copy_from_slice(&g[src..src + len * inner]);
        }
        Ok(vec![Some(Tensor::from_parts(out, self.input_shape.clone()))])
    }
    fn name(&self) -> &str {
        "NarrowBackward"
    }
}

struct CatBackward {
    axis: usize,
    sizes: Vec<usize>,
}

impl GradFn for CatBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let mut start = 0;
        let mut grads = Vec::with_capacity(self.sizes.len());
        for &len in &self.sizes {
            grads.push(Some(grad_output.narrow(self.axis as isize, start, len)?));
            start += len;
        }
        Ok(grads)
    }
    fn name(&self) -> &str {
        "CatBackward"
    }
}

struct IndexSelectBackward {
    input_shape: Shape,
    axis: usize,
    indices: Vec<usize>,
}

impl GradFn for IndexSelectBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let (outer, size, inner) = self.input_shape.split_at_axis(self.axis)?;
        let mut out = vec![0.0f32; self.input_shape.numel()];
        scatter_add(&mut out, grad_output.as_f32_slice(), &self.indices, outer, size, inner);
        Ok(vec![Some(Tensor::from_parts(out, self.input_shape.clone()))])
    }
    fn name(&self) -> &str {
        "IndexSelectBackward"
    }
}

struct IndexAddBackward {
    axis: usize,
    indices: Vec<usize>,
}

impl GradFn for IndexAddBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let grad_src = grad_output.index_select(self.axis as isize, &self.indices)?;
        Ok(vec![Some(grad_output.detach()), Some(grad_src)])
    }
    fn name(&self) -> &str {
        "IndexAddBackward"
    }
}

struct MaskedFillBackward {
    mask: Tensor,
}

impl GradFn for MaskedFillBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let g = binary_op(grad_output, &self.mask, |g, m| if m != 0.0 { 0.0 } else { g })?;
        Ok(vec![Some(g)])
    }
    fn name(&self) -> &str {
        "MaskedFillBackward"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transpose_3d() {
        let t = Tensor::from_f32(&(0..6).map(|i| i as f32).collect::<Vec<_>>(), &[1, 2, 3]);
        let tt = t.transpose(1, 2).unwrap();
        assert_eq!(tt.dims(), &[1, 3, 2]);
        assert_eq!(tt.to_vec(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_permute_gradient_is_inverse() {
        let t = Tensor::randn(&[2, 3, 4]).with_requires_grad();
        let p = t.permute(&[2, 0, 1]).unwrap();
        assert_eq!(p.dims(), &[4, 2, 3]);
        let w = Tensor::arange(24).reshape(&[4, 2, 3]).unwrap();
        p.mul(&w).unwrap().sum().unwrap().backward().unwrap();
        let back = w.permute(&[1, 2, 0]).unwrap();
        assert_eq!(t.grad().unwrap().to_vec(), back.to_vec());
    }

    #[test]
    fn test_narrow_and_cat_roundtrip() {
        let t = Tensor::arange(12).reshape(&[2, 6]).unwrap();
        let a = t.narrow(1, 0, 2).unwrap();
        let b = t.narrow(-1, 2, 4).unwrap();
        assert_eq!(a.to_vec(), vec![0.0, 1.0, 6.0, 7.0]);
        let c = Tensor::cat(&[&a, &b], 1).unwrap();
        assert_eq!(c.to_vec(), t.to_vec());
        assert!(t.narrow(1, 4, 3).is_err());
    }

    #[test]
    fn test_index_select_repeats_and_grads_accumulate() {
        let table = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]).with_requires_grad();
        let rows = table.index_select(0, &[2, 0, 2]).unwrap();
        assert_eq!(rows.to_vec(), vec![5.0, 6.0, 1.0, 2.0, 5.0, 6.0]);
        rows.sum().unwrap().backward().unwrap();
        assert_eq!(table.grad().unwrap().to_vec(), vec![1.0, 1.0, 0.0, 0.0, 2.0, 2.0]);
        assert!(table.index_select(0, &[3]).is_err());
    }

    #[test]
    fn test_index_add_scatters() {
        let base = Tensor::zeros(&[3, 2]);
        let src = Tensor::from_f32(&[1.0, 1.0, 2.0, 2.0], &[2, 2]).with_requires_grad();
        let out = base.index_add(0, &[1, 1], &src).unwrap();
        assert_eq!(out.to_vec(), vec![0.0, 0.0, 3.0, 3.0, 0.0, 0.0]);
        let w = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]);
        out.mul(&w).unwrap().sum().unwrap().backward().unwrap();
        assert_eq!(src.grad().unwrap().to_vec(), vec![3.0, 4.0, 3.0, 4.0]);
    }

    #[test]
    fn test_masked_fill_broadcast_and_grad() {
        let x = Tensor::ones(&[2, 2, 2]).with_requires_grad();
        let mask = Tensor::from_f32(&[0.0, 1.0, 0.0, 0.0], &[2, 2]);
        let y = x.masked_fill(&mask, f32::NEG_INFINITY).unwrap();
        assert_eq!(y.to_vec()[1], f32::NEG_INFINITY);
        assert_eq!(y.to_vec()[5], f32::NEG_INFINITY);
        x.masked_fill(&mask, 0.0).unwrap().sum().unwrap().backward().unwrap();
        assert_eq!(
            x.grad().unwrap().to_vec(),
            vec![1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0]
        );
    }

    #[test]
    fn test_reshape_rejects_bad_target() {
        let t = Tensor::zeros(&[2, 3]);
        assert!(matches!(t.reshape(&[4, -1]), Err(VarError::InvalidReshape { .. })));
    }
}
