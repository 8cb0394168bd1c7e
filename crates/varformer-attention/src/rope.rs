//! Rotary position encoding driven by a pluggable [`Rotator`].
//!
//! Pair `(2i, 2i + 1)` of the rotated span at position `m` is turned by
//! `m * base^(-2i / d)`. Every rotator is linear in its vector argument for a fixed
//! angle, so the table stores one 2x2 matrix per `(position, pair)`, obtained by
//! rotating the two basis vectors. The backward pass applies the transposes.

use std::sync::Arc;

use tracing::debug;
use varformer_core::{GradFn, Result, Tensor, VarError};

use crate::rotator::Rotator;

pub const DEFAULT_ROPE_BASE: f64 = 10_000.0;

/// Row-major `[a, b, c, d]` for `[[a, b], [c, d]]`.
type Mat2 = [f32; 4];

pub struct RotaryEmbedding {
    head_dim: usize,
    rotary_dim: usize,
    period: Option<usize>,
    positions: usize,
    table: Arc<Vec<Mat2>>,
    rotator: &'static str,
}

fn build_table(rotator: &dyn Rotator, rotary_dim: usize, positions: usize, base: f64) -> Vec<Mat2> {
    let pairs = rotary_dim / 2;
    let freqs: Vec<f64> = (0..pairs)
        .map(|i| base.powf(-2.0 * i as f64 / rotary_dim as f64))
        .collect();
    let mut table = Vec::with_capacity(positions * pairs);
    for m in 0..positions {
        for &f in &freqs {
            let angle = m as f64 * f;
            let e0 = rotator.rotate(angle, [1.0, 0.0]);
            let e1 = rotator.rotate(angle, [0.0, 1.0]);
            table.push([e0[0] as f32, e1[0] as f32, e0[1] as f32, e1[1] as f32]);
        }
    }
    table
}

impl RotaryEmbedding {
    /// Rotate the whole head vector for positions `0..max_positions`.
    pub fn new(head_dim: usize, max_positions: usize, base: f64, rotator: &dyn Rotator) -> Result<Self> {
        if head_dim < 2 || head_dim % 2 != 0 {
            return Err(VarError::config(format!(
                "rotary encoding needs an even head dimension >= 2, got {head_dim}"
            )));
        }
        let table = build_table(rotator, head_dim, max_positions, base);
        debug!(head_dim, max_positions, rotator = rotator.name(), "built rotary table");
        Ok(Self {
            head_dim,
            rotary_dim: head_dim,
            period: None,
            positions: max_positions,
            table: Arc::new(table),
            rotator: rotator.name(),
        })
    }

    /// Rotate only the last `length` dimensions, with positions taken modulo `length`.
    pub fn short(head_dim: usize, length: usize, base: f64, rotator: &dyn Rotator) -> Result<Self> {
        if length < 2 || length % 2 != 0 || length > head_dim {
            return Err(VarError::config(format!(
                "shortrope length must be even, >= 2 and <= head dimension {head_dim}, got {length}"
            )));
        }
        let table = build_table(rotator, length, length, base);
        debug!(head_dim, length, rotator = rotator.name(), "built shortrope table");
        Ok(Self {
            head_dim,
            rotary_dim: length,
            period: Some(length),
            positions: length,
            table: Arc::new(table),
            rotator: rotator.name(),
        })
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim
    }

    pub fn max_positions(&self) -> Option<usize> {
        self.period.is_none().then_some(self.positions)
    }

    pub fn rotator_name(&self) -> &'static str {
        self.rotator
    }

    /// Shrink the table to `positions` entries. No-op for the periodic variant.
    pub fn crop(&mut self, positions: usize) {
        if self.period.is_some() || positions >= self.positions {
            return;
        }
        let pairs = self.rotary_dim / 2;
        self.table = Arc::new(self.table[..positions * pairs].to_vec());
        self.positions = positions;
    }

    fn table_row(&self, t: usize) -> Result<usize> {
        let m = match self.period {
            Some(p) => t % p,
            None => t,
        };
        if m >= self.positions {
            return Err(VarError::contract(format!(
                "position {t} is beyond the rotary table of {} positions",
                self.positions
            )));
        }
        Ok(m)
    }

    /// Apply to `x: [..., T, head_dim]`, treating axis `-2` as the position.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        if x.ndim() < 2 || x.shape().last_dim() != self.head_dim {
            return Err(VarError::ShapeMismatch {
                expected: vec![0, self.head_dim],
                got: x.dims().to_vec(),
            });
        }
        let seq = x.dims()[x.ndim() - 2];
        let rows = (0..seq).map(|t| self.table_row(t)).collect::<Result<Vec<_>>>()?;
        let out = rotate_all(x.as_f32_slice(), &self.table, &rows, self.head_dim, self.rotary_dim, false);
        Ok(Tensor::from_vec(out, x.dims())?.attach_grad_fn(
            RopeBackward {
                table: Arc::clone(&self.table),
                rows,
                head_dim: self.head_dim,
                rotary_dim: self.rotary_dim,
                dims: x.dims().to_vec(),
            },
            &[x],
        ))
    }
}

fn rotate_all(
    data: &[f32],
    table: &[Mat2],
    rows: &[usize],
    head_dim: usize,
    rotary_dim: usize,
    transpose: bool,
) -> Vec<f32> {
    let pairs = rotary_dim / 2;
    let offset = head_dim - rotary_dim;
    let seq = rows.len();
    let mut out = data.to_vec();
    for (idx, vec) in out.chunks_mut(head_dim).enumerate() {
        let m = rows[idx % seq];
        for i in 0..pairs {
            let [a, b, c, d] = table[m * pairs + i];
            let (a, b, c, d) = if transpose { (a, c, b, d) } else { (a, b, c, d) };
            let j = offset + 2 * i;
            let (x0, x1) = (vec[j], vec[j + 1]);
            vec[j] = a * x0 + b * x1;
            vec[j + 1] = c * x0 + d * x1;
        }
    }
    out
}

struct RopeBackward {
    table: Arc<Vec<Mat2>>,
    rows: Vec<usize>,
    head_dim: usize,
    rotary_dim: usize,
    dims: Vec<usize>,
}

impl GradFn for RopeBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let dx = rotate_all(
            grad_output.as_f32_slice(),
            &self.table,
            &self.rows,
            self.head_dim,
            self.rotary_dim,
            true,
        );
        Ok(vec![Some(Tensor::from_vec(dx, &self.dims)?)])
    }

    fn name(&self) -> &str {
        "RopeBackward"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotator::{CordicRotator, ExactRotator};
    use varformer_core::gradcheck::assert_gradient;

    fn norms(t: &Tensor, d: usize) -> Vec<f32> {
        t.to_vec().chunks(2).take(d).map(|p| p[0].hypot(p[1])).collect()
    }

    #[test]
    fn test_position_zero_is_identity() {
        let rope = RotaryEmbedding::new(4, 8, DEFAULT_ROPE_BASE, &ExactRotator).unwrap();
        let x = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[1, 4]);
        let y = rope.apply(&x).unwrap().to_vec();
        for (a, b) in y.iter().zip(x.to_vec()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_exact_rope_matches_closed_form_and_preserves_pair_norms() {
        let rope = RotaryEmbedding::new(4, 8, 100.0, &ExactRotator).unwrap();
        let x = Tensor::from_f32(&[0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.5, -2.0], &[3, 4]);
        let y = rope.apply(&x).unwrap();
        let v = y.to_vec();
        // position 1, pair 0 rotates by 1 rad, pair 1 by 100^(-1/2) rad
        assert!((v[4] - 1f32.cos()).abs() < 1e-6);
        assert!((v[5] - 1f32.sin()).abs() < 1e-6);
        assert!((v[6] - 0.1f32.cos()).abs() < 1e-6);
        assert!((v[7] - 0.1f32.sin()).abs() < 1e-6);
        let before = norms(&x, 6);
        let after = norms(&y, 6);
        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_positions_beyond_table_are_rejected() {
        let rope = RotaryEmbedding::new(2, 3, DEFAULT_ROPE_BASE, &ExactRotator).unwrap();
        let err = rope.apply(&Tensor::ones(&[4, 2])).unwrap_err();
        assert!(matches!(err, VarError::Contract(_)));
        assert!(RotaryEmbedding::new(3, 3, DEFAULT_ROPE_BASE, &ExactRotator).is_err());
    }

    #[test]
    fn test_shortrope_rotates_tail_periodically() {
        let rope = RotaryEmbedding::short(6, 2, DEFAULT_ROPE_BASE, &ExactRotator).unwrap();
        let x = Tensor::ones(&[5, 6]);
        let y = rope.apply(&x).unwrap().to_vec();
        for t in 0..5 {
            let row = &y[t * 6..(t + 1) * 6];
            assert_eq!(&row[..4], &[1.0; 4]);
        }
        // positions 0, 2, 4 share an angle, as do 1 and 3
        assert_eq!(&y[4..6], &y[16..18]);
        assert_eq!(&y[10..12], &y[22..24]);
        assert!(RotaryEmbedding::short(6, 8, DEFAULT_ROPE_BASE, &ExactRotator).is_err());
        assert!(RotaryEmbedding::short(6, 3, DEFAULT_ROPE_BASE, &ExactRotator).is_err());
    }

    #[test]
    fn test_crop_shrinks_table() {
        let mut rope = RotaryEmbedding::new(4, 16, DEFAULT_ROPE_BASE, &ExactRotator).unwrap();
        rope.crop(4);
        assert_eq!(rope.max_positions(), Some(4));
        assert!(rope.apply(&Tensor::ones(&[5, 4])).is_err());
        assert!(rope.apply(&Tensor::ones(&[2, 4, 4])).is_ok());
    }

    #[test]
    fn test_rope_gradient_with_approximate_rotator() {
        let rope = RotaryEmbedding::new(4, 4, DEFAULT_ROPE_BASE, &CordicRotator::new(4)).unwrap();
        let w = Tensor::from_f32(&(0..12).map(|i| (i as f32 * 0.37).sin()).collect::<Vec<_>>(), &[3, 4]);
        let x0 = Tensor::from_f32(&(0..12).map(|i| (i as f32 * 0.91).cos()).collect::<Vec<_>>(), &[3, 4]);
        assert_gradient(&|x| rope.apply(x)?.mul(&w)?.sum(), &x0, 0.02, "rope").unwrap();
    }
}
