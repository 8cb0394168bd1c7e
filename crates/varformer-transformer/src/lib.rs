//! # varformer-transformer
//!
//! GPT-style decoder whose every sub-component is chosen by name:
//! - `ModelConfig`: the single source of truth, JSON (de)serializable, validated up front
//! - `registry`: per-namespace variant tables (norms, activations, softmaxes, linears,
//!   position encodings, rotators, routers, quantization methods)
//! - `CausalSelfAttention`: GQA, sliding window, FIRE, gates, eight quantization sites
//! - `Mlp` / `MoeLayer`: dense feed-forward and top-k mixture of experts
//! - `SharedLayout`: layer-to-instance mapping for shared attention/MLP units
//! - `GPT`: full model with tied output head, generation and checkpoint I/O

pub mod attention;
pub mod block;
pub mod config;
pub mod feed_forward;
pub mod model;
pub mod moe;
pub mod presets;
pub mod prune;
pub mod registry;
pub mod sharing;
pub mod variants;

pub use attention::{AttentionQuantSites, CausalSelfAttention};
pub use block::{AttentionUnit, FeedForward, MlpUnit};
pub use config::{AttentionQuantConfig, LinearSite, ModelConfig, SiteQuant};
pub use feed_forward::Mlp;
pub use model::{LayerSummary, ParamGroups, GPT};
pub use moe::{MoeLayer, RouterDecision};
pub use prune::{magnitude_prune, PruneReport};
pub use registry::{registry, Namespace, Registry};
pub use sharing::SharedLayout;
