//! # varformer-attention
//!
//! Attention building blocks for varformer:
//! - Two-dimensional rotators, exact and hardware-style approximate, with error metrics
//! - Rotary position encoding over any rotator, including the periodic short variant
//! - Causal and sliding-window masks
//! - FIRE functional relative position bias
//! - Fused causal attention with an online softmax and its own backward pass

pub mod fire;
pub mod fused;
pub mod mask;
pub mod rope;
pub mod rotator;

pub use fire::FireBias;
pub use fused::fused_causal_attention;
pub use mask::{causal_mask, sliding_window_mask};
pub use rope::RotaryEmbedding;
pub use rotator::{
    CachedRotator, CordicRotator, DoubleFirstOrderRotator, ExactRotator, FirstOrderRotator,
    RefinedDoubleFirstOrderRotator, Rotator,
};
