use smallvec::SmallVec;
use std::fmt;

use crate::error::VarError;
use crate::Result;

/// Dimension list for a row-major tensor.
///
/// Attention activations top out at four dimensions (`[batch, heads, seq, head_dim]`),
/// so up to four extents live inline without a heap allocation.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    /// Zero-dimensional shape holding a single element.
    pub fn scalar() -> Self {
        Self {
            dims: SmallVec::new(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Element count; a scalar shape holds one element.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    /// Size of the trailing dimension (1 for scalars).
    pub fn last_dim(&self) -> usize {
        self.dims.last().copied().unwrap_or(1)
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Row-major strides for a dense buffer of this shape.
    pub fn contiguous_strides(&self) -> SmallVec<[usize; 4]> {
        let mut strides: SmallVec<[usize; 4]> = SmallVec::from_elem(1, self.dims.len());
        let mut acc = 1;
        for i in (0..self.dims.len()).rev() {
            strides[i] = acc;
            acc *= self.dims[i];
        }
        strides
    }

    /// Split the shape around `axis` into `(outer, size, inner)` extents.
    pub fn split_at_axis(&self, axis: usize) -> Result<(usize, usize, usize)> {
        if axis >= self.ndim() {
            return Err(VarError::InvalidAxis {
                axis,
                ndim: self.ndim(),
            });
        }
        let outer = self.dims[..axis].iter().product();
        let inner = self.dims[axis + 1..].iter().product();
        Ok((outer, self.dims[axis], inner))
    }

    /// NumPy broadcast of two shapes, aligned from the trailing dimension.
    pub fn broadcast_with(&self, other: &Shape) -> Option<Shape> {
        let rank = self.ndim().max(other.ndim());
        let mut out: SmallVec<[usize; 4]> = SmallVec::from_elem(1, rank);
        for i in 0..rank {
            let a = self.rev_dim(i);
            let b = other.rev_dim(i);
            out[rank - 1 - i] = match (a, b) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => return None,
            };
        }
        Some(Shape { dims: out })
    }

    /// Strides that read this shape as if it were broadcast to `target`.
    ///
    /// Broadcast dimensions get stride 0. `target` must be a valid broadcast of `self`.
    pub fn broadcast_strides(&self, target: &Shape) -> SmallVec<[usize; 4]> {
        let own = self.contiguous_strides();
        let rank = target.ndim();
        let offset = rank - self.ndim();
        let mut strides: SmallVec<[usize; 4]> = SmallVec::from_elem(0, rank);
        for i in 0..self.ndim() {
            if self.dims[i] == target.dims[i + offset] {
                strides[i + offset] = own[i];
            }
        }
        strides
    }

    /// Resolve a reshape target where at most one entry is `-1`.
    pub fn resolve_reshape(&self, target: &[isize]) -> Option<Shape> {
        let mut inferred = None;
        let mut known = 1usize;
        for (i, &d) in target.iter().enumerate() {
            match d {
                -1 if inferred.is_none() => inferred = Some(i),
                d if d > 0 => known = known.checked_mul(d as usize)?,
                _ => return None,
            }
        }

        let numel = self.numel();
        let mut dims: SmallVec<[usize; 4]> =
            target.iter().map(|&d| d.max(0) as usize).collect();
        if let Some(i) = inferred {
            if known == 0 || numel % known != 0 {
                return None;
            }
            dims[i] = numel / known;
        }

        let shape = Shape { dims };
        (shape.numel() == numel).then_some(shape)
    }

    /// Shape with dimensions `a` and `b` exchanged.
    pub fn swapped(&self, a: usize, b: usize) -> Option<Shape> {
        if a >= self.ndim() || b >= self.ndim() {
            return None;
        }
        let mut dims = self.dims.clone();
        dims.swap(a, b);
        Some(Shape { dims })
    }

    fn rev_dim(&self, i: usize) -> usize {
        if i < self.ndim() {
            self.dims[self.ndim() - 1 - i]
        } else {
            1
        }
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims.as_slice())
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape {
            dims: SmallVec::from_vec(dims),
        }
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(&dims)
    }
}
