//! Inverted dropout: zero elements with probability `p` in training mode and scale
//! survivors by `1 / (1 - p)`. Identity in evaluation mode.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use varformer_core::{Result, Tensor, VarError};

use crate::module::Module;

pub struct Dropout {
    p: f32,
    training: bool,
    rng: Mutex<StdRng>,
}

impl Dropout {
    pub fn new(p: f32) -> Result<Self> {
        Self::with_seed(p, rand::thread_rng().gen())
    }

    pub fn with_seed(p: f32, seed: u64) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(VarError::config(format!("dropout probability must be in [0, 1), got {p}")));
        }
        Ok(Self {
            p,
            training: true,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    /// Whether a forward pass would change its input.
    pub fn is_active(&self) -> bool {
        self.training && self.p > 0.0
    }
}

impl Module for Dropout {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if !self.is_active() {
            return Ok(input.clone());
        }
        let scale = 1.0 / (1.0 - self.p);
        let mask: Vec<f32> = {
            let mut rng = self.rng.lock();
            (0..input.numel())
                .map(|_| if rng.gen::<f32>() < self.p { 0.0 } else { scale })
                .collect()
        };
        input.mul(&Tensor::from_vec(mask, input.dims())?)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        Vec::new()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        Vec::new()
    }

    fn train(&mut self, mode: bool) {
        self.training = mode;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}
