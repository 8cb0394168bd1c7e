//! # varformer-nn
//!
//! Neural network building blocks for varformer: the `Module` trait, dense and
//! quantization-aware linear layers, normalization, activations, dropout,
//! embeddings, losses, and safetensors checkpoint I/O.

pub mod activations;
pub mod dropout;
pub mod embedding;
pub mod layer_norm;
pub mod linear;
pub mod loss;
pub mod module;
pub mod quant_linear;
pub mod quantize;
pub mod rms_norm;
pub mod serialization;

pub use dropout::Dropout;
pub use embedding::Embedding;
pub use layer_norm::LayerNorm;
pub use linear::Linear;
pub use module::Module;
pub use quant_linear::{BitLinear, QuantizedLinear};
pub use quantize::{Bits, QuantMethod, QuantSite, QuantSpec, QuantStats, Quantized};
pub use rms_norm::RMSNorm;
