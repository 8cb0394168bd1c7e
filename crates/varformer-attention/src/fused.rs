//! Fused causal attention with an online softmax.
//!
//! Scores are never materialized: each query row walks the visible keys in tiles,
//! keeping a running max and normalizer. Only the per-row log-sum-exp is saved, and
//! the backward pass recomputes probabilities from it.

use rayon::prelude::*;
use varformer_core::{GradFn, Result, Tensor, VarError};

const BLOCK_SIZE: usize = 64;

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn check_inputs(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<(usize, usize, usize)> {
    if q.ndim() != 4 || q.dims() != k.dims() || q.dims() != v.dims() {
        let got = if q.dims() != k.dims() { k.dims() } else { v.dims() };
        return Err(VarError::ShapeMismatch {
            expected: q.dims().to_vec(),
            got: got.to_vec(),
        });
    }
    let d = q.dims();
    Ok((d[0] * d[1], d[2], d[3]))
}

/// `softmax(q k^T * scale + causal) v` for `q, k, v: [B, H, T, D]`.
pub fn fused_causal_attention(q: &Tensor, k: &Tensor, v: &Tensor, scale: f32) -> Result<Tensor> {
    let (bh, seq, dim) = check_inputs(q, k, v)?;
    let (qd, kd, vd) = (q.as_f32_slice(), k.as_f32_slice(), v.as_f32_slice());
    let span = seq * dim;

    let mut out = vec![0.0f32; bh * span];
    let mut lse = vec![0.0f32; bh * seq];
    out.par_chunks_mut(span.max(1))
        .zip(lse.par_chunks_mut(seq.max(1)))
        .enumerate()
        .for_each(|(n, (o, l))| {
            let base = n * span;
            let (qh, kh, vh) = (&qd[base..base + span], &kd[base..base + span], &vd[base..base + span]);
            for i in 0..seq {
                let qi = &qh[i * dim..(i + 1) * dim];
                let acc = &mut o[i * dim..(i + 1) * dim];
                let mut row_max = f32::NEG_INFINITY;
                let mut row_sum = 0.0f32;
                for start in (0..=i).step_by(BLOCK_SIZE) {
                    let end = (start + BLOCK_SIZE).min(i + 1);
                    let scores: Vec<f32> = (start..end)
                        .map(|j| dot(qi, &kh[j * dim..(j + 1) * dim]) * scale)
                        .collect();
                    let block_max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let new_max = row_max.max(block_max);
                    let rescale = (row_max - new_max).exp();
                    row_sum *= rescale;
                    acc.iter_mut().for_each(|a| *a *= rescale);
                    for (j, s) in (start..end).zip(&scores) {
                        let w = (s - new_max).exp();
                        row_sum += w;
                        for (a, &vv) in acc.iter_mut().zip(&vh[j * dim..(j + 1) * dim]) {
                            *a += w * vv;
                        }
                    }
                    row_max = new_max;
                }
                acc.iter_mut().for_each(|a| *a /= row_sum);
                l[i] = row_max + row_sum.ln();
            }
        });

    let result = Tensor::from_vec(out, q.dims())?;
    let saved_out = result.detach();
    Ok(result.attach_grad_fn(
        FusedAttentionBackward {
            q: q.detach(),
            k: k.detach(),
            v: v.detach(),
            out: saved_out,
            lse,
            scale,
        },
        &[q, k, v],
    ))
}

struct FusedAttentionBackward {
    q: Tensor,
    k: Tensor,
    v: Tensor,
    out: Tensor,
    lse: Vec<f32>,
    scale: f32,
}

impl GradFn for FusedAttentionBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let (bh, seq, dim) = check_inputs(&self.q, &self.k, &self.v)?;
        let span = seq * dim;
        let (qd, kd, vd) = (self.q.as_f32_slice(), self.k.as_f32_slice(), self.v.as_f32_slice());
        let (od, gd) = (self.out.as_f32_slice(), grad_output.as_f32_slice());

        let per_head: Vec<(Vec<f32>, Vec<f32>, Vec<f32>)> = (0..bh)
            .into_par_iter()
            .map(|n| {
                let base = n * span;
                let r = base..base + span;
                let (qh, kh, vh) = (&qd[r.clone()], &kd[r.clone()], &vd[r.clone()]);
                let (oh, gh) = (&od[r.clone()], &gd[r]);
                let lse = &self.lse[n * seq..(n + 1) * seq];
                let mut dq = vec![0.0f32; span];
                let mut dk = vec![0.0f32; span];
                let mut dv = vec![0.0f32; span];
                for i in 0..seq {
                    let row = i * dim..(i + 1) * dim;
                    let (qi, gi) = (&qh[row.clone()], &gh[row.clone()]);
                    let delta = dot(gi, &oh[row]);
                    for j in 0..=i {
                        let col = j * dim..(j + 1) * dim;
                        let (kj, vj) = (&kh[col.clone()], &vh[col.clone()]);
                        let p = (dot(qi, kj) * self.scale - lse[i]).exp();
                        let ds = p * (dot(gi, vj) - delta) * self.scale;
                        for c in 0..dim {
                            dv[j * dim + c] += p * gi[c];
                            dq[i * dim + c] += ds * kj[c];
                            dk[j * dim + c] += ds * qi[c];
                        }
                    }
                }
                (dq, dk, dv)
            })
            .collect();

        let mut dq = Vec::with_capacity(bh * span);
        let mut dk = Vec::with_capacity(bh * span);
        let mut dv = Vec::with_capacity(bh * span);
        for (a, b, c) in per_head {
            dq.extend(a);
            dk.extend(b);
            dv.extend(c);
        }
        let dims = self.q.dims();
        Ok(vec![
            Some(Tensor::from_vec(dq, dims)?),
            Some(Tensor::from_vec(dk, dims)?),
            Some(Tensor::from_vec(dv, dims)?),
        ])
    }

    fn name(&self) -> &str {
        "FusedAttentionBackward"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::causal_mask;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use varformer_core::gradcheck::assert_gradient;

    fn reference(q: &Tensor, k: &Tensor, v: &Tensor, scale: f32) -> Result<Tensor> {
        let t = q.dims()[2];
        q.matmul(&k.transpose(-2, -1)?)?
            .mul_scalar(scale)?
            .masked_fill(&causal_mask(t), f32::NEG_INFINITY)?
            .softmax()?
            .matmul(v)
    }

    #[test]
    fn test_matches_reference_forward() {
        let mut rng = StdRng::seed_from_u64(9);
        let q = Tensor::randn_with(&[2, 2, 70, 4], 1.0, &mut rng);
        let k = Tensor::randn_with(&[2, 2, 70, 4], 1.0, &mut rng);
        let v = Tensor::randn_with(&[2, 2, 70, 4], 1.0, &mut rng);
        let fused = fused_causal_attention(&q, &k, &v, 0.5).unwrap().to_vec();
        let manual = reference(&q, &k, &v, 0.5).unwrap().to_vec();
        for (a, b) in fused.iter().zip(&manual) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(4);
        let q0 = Tensor::randn_with(&[1, 2, 3, 2], 1.0, &mut rng);
        let k0 = Tensor::randn_with(&[1, 2, 3, 2], 1.0, &mut rng);
        let v0 = Tensor::randn_with(&[1, 2, 3, 2], 1.0, &mut rng);
        let w = Tensor::randn_with(&[1, 2, 3, 2], 1.0, &mut rng);
        let s = 0.7;
        assert_gradient(&|q| fused_causal_attention(q, &k0, &v0, s)?.mul(&w)?.sum(), &q0, 0.03, "dq").unwrap();
        assert_gradient(&|k| fused_causal_attention(&q0, k, &v0, s)?.mul(&w)?.sum(), &k0, 0.03, "dk").unwrap();
        assert_gradient(&|v| fused_causal_attention(&q0, &k0, v, s)?.mul(&w)?.sum(), &v0, 0.03, "dv").unwrap();
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let q = Tensor::zeros(&[1, 1, 2, 2]);
        assert!(fused_causal_attention(&q, &Tensor::zeros(&[1, 1, 3, 2]), &q, 1.0).is_err());
    }
}
