//! FIRE: learned functional relative position bias.
//!
//! `b(i, j) = f(psi(i - j) / psi(max(i, L)))` with `psi(x) = ln(c * x + 1)` and `f` a
//! small `1 -> hidden -> heads` ReLU MLP shared by all positions.

use rand::Rng;
use varformer_core::{Result, Tensor, VarError};
use varformer_nn::activations::relu;
use varformer_nn::linear::INIT_STD;
use varformer_nn::module::{prefixed, prefixed_mut};
use varformer_nn::{Linear, Module};

pub struct FireBias {
    fc1: Linear,
    fc2: Linear,
    c: f32,
    threshold: f32,
    n_head: usize,
}

impl FireBias {
    pub fn new<R: Rng + ?Sized>(n_head: usize, hidden: usize, c: f32, threshold: f32, rng: &mut R) -> Result<Self> {
        if c <= 0.0 || threshold < 1.0 || hidden == 0 {
            return Err(VarError::config(format!(
                "FIRE needs c > 0, L >= 1 and a hidden width >= 1 (c={c}, L={threshold}, hidden={hidden})"
            )));
        }
        Ok(Self {
            fc1: Linear::with_rng(1, hidden, true, INIT_STD, rng),
            fc2: Linear::with_rng(hidden, n_head, true, INIT_STD, rng),
            c,
            threshold,
            n_head,
        })
    }

    fn psi(&self, x: f32) -> f32 {
        (self.c * x + 1.0).ln()
    }

    /// Normalized causal distances as a `[T * T, 1]` column; future keys get 0.
    pub fn distances(&self, seq_len: usize) -> Tensor {
        let data: Vec<f32> = (0..seq_len * seq_len)
            .map(|idx| {
                let (i, j) = (idx / seq_len, idx % seq_len);
                let rel = i.saturating_sub(j) as f32;
                self.psi(rel) / self.psi((i as f32).max(self.threshold))
            })
            .collect();
        Tensor::from_f32(&data, &[seq_len * seq_len, 1])
    }

    /// Additive score bias, shape `[1, n_head, T, T]`.
    pub fn bias(&self, seq_len: usize) -> Result<Tensor> {
        let per_pair = self.forward(&self.distances(seq_len))?;
        let s = seq_len as isize;
        per_pair
            .transpose(0, 1)?
            .reshape(&[1, self.n_head as isize, s, s])
    }
}

impl Module for FireBias {
    /// Maps normalized distances `[N, 1]` to per-head biases `[N, n_head]`.
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let h = relu(&self.fc1.forward(input)?)?;
        self.fc2.forward(&h)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("fc1", self.fc1.named_parameters());
        params.extend(prefixed("fc2", self.fc2.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("fc1", self.fc1.named_parameters_mut());
        params.extend(prefixed_mut("fc2", self.fc2.named_parameters_mut()));
        params
    }
}
