//! Dense feed-forward sub-layer.
//!
//! `mlp`:    `c_proj(act(c_fc(x)))`
//! `swiglu`: `c_proj(act(c_fc(x)) * c_fc2(x))`

use rand::RngCore;
use varformer_core::Result;
use varformer_core::Tensor;
use varformer_nn::linear::INIT_STD;
use varformer_nn::module::{prefixed, prefixed_mut};
use varformer_nn::{Dropout, Module};

use crate::config::{LinearSite, ModelConfig};
use crate::registry::registry;
use crate::variants::{Activation, LinearLayer, LinearSpec};

/// Init std of residual output projections: `0.02 / sqrt(2 * n_layer)`.
pub fn residual_std(config: &ModelConfig) -> f32 {
    INIT_STD / (2.0 * config.n_layer as f32).sqrt()
}

pub struct Mlp {
    c_fc: Box<dyn LinearLayer>,
    c_fc2: Option<Box<dyn LinearLayer>>,
    c_proj: Box<dyn LinearLayer>,
    activation: Box<dyn Activation>,
    dropout: Dropout,
}

impl Mlp {
    pub fn new(config: &ModelConfig, rng: &mut dyn RngCore) -> Result<Self> {
        let reg = registry();
        let hidden = config.mlp_hidden();
        let up = LinearSpec {
            in_features: config.n_embd,
            out_features: hidden,
            bias: config.bias,
            std: INIT_STD,
        };
        let down = LinearSpec {
            in_features: hidden,
            out_features: config.n_embd,
            bias: config.bias,
            std: residual_std(config),
        };
        let up_variant = config.linear_variant_for(LinearSite::MlpUp);
        let c_fc = reg.linear(up_variant, &up, config, rng)?;
        let c_fc2 = match config.mlp_variant.as_str() {
            "swiglu" => Some(reg.linear(up_variant, &up, config, rng)?),
            _ => None,
        };
        let c_proj = reg.linear(config.linear_variant_for(LinearSite::MlpDown), &down, config, rng)?;
        Ok(Self {
            c_fc,
            c_fc2,
            c_proj,
            activation: reg.activation(&config.activation_variant)?,
            dropout: Dropout::with_seed(config.dropout, rng.next_u64())?,
        })
    }

    pub fn variant(&self) -> &'static str {
        if self.c_fc2.is_some() {
            "swiglu"
        } else {
            "mlp"
        }
    }

    pub fn activation(&self) -> &'static str {
        self.activation.name()
    }

    pub fn hidden(&self) -> usize {
        self.c_fc.out_features()
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = self.activation.apply(&self.c_fc.forward(x)?)?;
        if let Some(gate) = &self.c_fc2 {
            h = h.mul(&gate.forward(x)?)?;
        }
        self.dropout.forward(&self.c_proj.forward(&h)?)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("c_fc", self.c_fc.named_parameters());
        if let Some(gate) = &self.c_fc2 {
            params.extend(prefixed("c_fc2", gate.named_parameters()));
        }
        params.extend(prefixed("c_proj", self.c_proj.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("c_fc", self.c_fc.named_parameters_mut());
        if let Some(gate) = &mut self.c_fc2 {
            params.extend(prefixed_mut("c_fc2", gate.named_parameters_mut()));
        }
        params.extend(prefixed_mut("c_proj", self.c_proj.named_parameters_mut()));
        params
    }

    fn train(&mut self, mode: bool) {
        self.dropout.train(mode);
    }

    fn is_training(&self) -> bool {
        self.dropout.is_training()
    }
}
