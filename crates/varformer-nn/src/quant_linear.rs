//! Quantization-aware linear layers.
//!
//! Both layers keep full-precision master weights and quantize them on every
//! forward pass, so gradients reach the master copy through a straight-through
//! estimator.

use rand::Rng;
use varformer_core::{Result, Tensor};

use crate::linear::{linear, Linear, INIT_STD};
use crate::module::Module;
use crate::quantize::{fake_quantize_with, Bits, QuantMethod, StraightThroughBackward};

/// Linear layer whose weight (and optionally input) is fake-quantized each forward.
pub struct QuantizedLinear {
    weight: Tensor,
    bias: Option<Tensor>,
    weight_bits: Bits,
    activation_bits: Option<Bits>,
    method: QuantMethod,
}

impl QuantizedLinear {
    pub fn new(in_features: usize, out_features: usize, bias: bool, weight_bits: Bits) -> Self {
        Self::with_rng(
            in_features,
            out_features,
            bias,
            weight_bits,
            INIT_STD,
            &mut rand::thread_rng(),
        )
    }

    pub fn with_rng<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        bias: bool,
        weight_bits: Bits,
        std: f32,
        rng: &mut R,
    ) -> Self {
        let dense = Linear::with_rng(in_features, out_features, bias, std, rng);
        Self::from_linear(&dense, weight_bits)
    }

    pub fn from_linear(dense: &Linear, weight_bits: Bits) -> Self {
        Self {
            weight: dense.weight().detach().with_requires_grad(),
            bias: dense.bias().map(|b| b.detach().with_requires_grad()),
            weight_bits,
            activation_bits: None,
            method: QuantMethod::Stochastic,
        }
    }

    /// Also fake-quantize the input at `bits`.
    pub fn with_activation_bits(mut self, bits: Bits) -> Self {
        self.activation_bits = Some(bits);
        self
    }

    pub fn with_method(mut self, method: QuantMethod) -> Self {
        self.method = method;
        self
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn weight_bits(&self) -> Bits {
        self.weight_bits
    }

    pub fn activation_bits(&self) -> Option<Bits> {
        self.activation_bits
    }
}

impl Module for QuantizedLinear {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut rng = rand::thread_rng();
        let (w, _) = fake_quantize_with(&self.weight, self.weight_bits, self.method, &mut rng);
        let x = match self.activation_bits {
            Some(bits) => fake_quantize_with(input, bits, self.method, &mut rng).0,
            None => input.clone(),
        };
        linear(&x, &w, self.bias.as_ref())
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = vec![("weight".to_string(), &self.weight)];
        if let Some(b) = &self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = vec![("weight".to_string(), &mut self.weight)];
        if let Some(b) = &mut self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }
}

/// Ternary-weight linear layer (1.58 bits per weight).
///
/// Weights are scaled by their mean magnitude, rounded and clamped to `{-1, 0, +1}`,
/// then rescaled.
pub struct BitLinear {
    weight: Tensor,
    bias: Option<Tensor>,
    eps: f32,
}

impl BitLinear {
    pub fn new(in_features: usize, out_features: usize, bias: bool) -> Self {
        Self::from_linear(&Linear::new(in_features, out_features, bias))
    }

    pub fn with_rng<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        bias: bool,
        std: f32,
        rng: &mut R,
    ) -> Self {
        Self::from_linear(&Linear::with_rng(in_features, out_features, bias, std, rng))
    }

    pub fn from_linear(dense: &Linear) -> Self {
        Self {
            weight: dense.weight().detach().with_requires_grad(),
            bias: dense.bias().map(|b| b.detach().with_requires_grad()),
            eps: 1e-5,
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// The absmean scale and the ternary codes of the current weight.
    pub fn ternary_weights(&self) -> (f32, Vec<i8>) {
        let w = self.weight.as_f32_slice();
        let gamma = absmean(w) + self.eps;
        let codes = w
            .iter()
            .map(|&v| (v / gamma).round().clamp(-1.0, 1.0) as i8)
            .collect();
        (gamma, codes)
    }

    fn quantized_weight(&self) -> Tensor {
        let (gamma, codes) = self.ternary_weights();
        let data: Vec<f32> = codes.iter().map(|&c| c as f32 * gamma).collect();
        Tensor::from_f32(&data, self.weight.dims()).attach_grad_fn(StraightThroughBackward, &[&self.weight])
    }
}

fn absmean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|v| v.abs()).sum::<f32>() / values.len() as f32
}

impl Module for BitLinear {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        linear(input, &self.quantized_weight(), self.bias.as_ref())
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = vec![("weight".to_string(), &self.weight)];
        if let Some(b) = &self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = vec![("weight".to_string(), &mut self.weight)];
        if let Some(b) = &mut self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }
}
