//! Strategy traits behind every registry namespace, and their built-in implementations.

pub mod activation;
pub mod linear;
pub mod norm;
pub mod position;
pub mod router;
pub mod softmax;

pub use activation::Activation;
pub use linear::{LinearLayer, LinearSpec};
pub use norm::Normalization;
pub use position::{NoPositionEncoding, PositionEncoding};
pub use router::{Router, SoftmaxTopK, TopKSoftmax};
pub use softmax::SoftmaxVariant;
