use std::collections::HashMap;

use varformer_core::{Result, Tensor};

/// Base trait for layers that own trainable tensors.
pub trait Module: Send + Sync {
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Trainable tensors with dotted names relative to this module.
    fn named_parameters(&self) -> Vec<(String, &Tensor)>;

    /// Mutable access in the same order as [`Module::named_parameters`].
    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)>;

    fn parameters(&self) -> Vec<&Tensor> {
        self.named_parameters().into_iter().map(|(_, t)| t).collect()
    }

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|t| t.numel()).sum()
    }

    fn train(&mut self, _mode: bool) {}

    fn is_training(&self) -> bool {
        false
    }

    fn state_dict(&self) -> HashMap<String, Tensor> {
        self.named_parameters()
            .into_iter()
            .map(|(name, t)| (name, t.detach()))
            .collect()
    }
}

/// Prepend `prefix.` to every parameter name.
pub fn prefixed<'a>(prefix: &str, params: Vec<(String, &'a Tensor)>) -> Vec<(String, &'a Tensor)> {
    params
        .into_iter()
        .map(|(name, t)| (format!("{prefix}.{name}"), t))
        .collect()
}

pub fn prefixed_mut<'a>(
    prefix: &str,
    params: Vec<(String, &'a mut Tensor)>,
) -> Vec<(String, &'a mut Tensor)> {
    params
        .into_iter()
        .map(|(name, t)| (format!("{prefix}.{name}"), t))
        .collect()
}
