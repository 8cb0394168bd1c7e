use varformer_core::{Result, Tensor};
use varformer_nn::activations;

/// An element-wise nonlinearity.
pub trait Activation: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, input: &Tensor) -> Result<Tensor>;
}

/// Wraps one of the plain activation functions.
pub struct Elementwise {
    name: &'static str,
    f: fn(&Tensor) -> Result<Tensor>,
}

impl Activation for Elementwise {
    fn name(&self) -> &'static str {
        self.name
    }

    fn apply(&self, input: &Tensor) -> Result<Tensor> {
        (self.f)(input)
    }
}

pub(crate) const BUILTIN: [(&str, fn(&Tensor) -> Result<Tensor>); 6] = [
    ("gelu", activations::gelu),
    ("relu", activations::relu),
    ("squared_relu", activations::squared_relu),
    ("silu", activations::silu),
    ("sigmoid", activations::sigmoid),
    ("tanh", activations::tanh),
];

pub(crate) fn elementwise(name: &'static str, f: fn(&Tensor) -> Result<Tensor>) -> Box<dyn Activation> {
    Box::new(Elementwise { name, f })
}
