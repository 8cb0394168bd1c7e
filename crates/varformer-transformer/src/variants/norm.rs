use varformer_nn::{LayerNorm, Module, RMSNorm};

use crate::config::ModelConfig;

/// A normalization layer over the last axis.
pub trait Normalization: Module {
    fn name(&self) -> &'static str;
}

impl Normalization for LayerNorm {
    fn name(&self) -> &'static str {
        "layernorm"
    }
}

impl Normalization for RMSNorm {
    fn name(&self) -> &'static str {
        "rmsnorm"
    }
}

pub(crate) fn layernorm(dim: usize, config: &ModelConfig) -> Box<dyn Normalization> {
    Box::new(LayerNorm::new(dim, config.norm_eps, config.bias))
}

pub(crate) fn rmsnorm(dim: usize, config: &ModelConfig) -> Box<dyn Normalization> {
    Box::new(RMSNorm::new(dim, config.norm_eps))
}
