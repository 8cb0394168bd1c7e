//! Model configuration record.
//!
//! Every field has a default, so a JSON file only needs the keys it changes.
//! [`ModelConfig::validate`] checks the structural invariants and that every named
//! variant resolves in the registry; model construction calls it first.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;
use varformer_core::{Result, VarError};
use varformer_nn::quantize::MAX_BITS;

use crate::registry::{registry, Namespace};

/// Where a projection sits, for per-site linear variant selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinearSite {
    Query,
    Key,
    Value,
    AttnProj,
    MlpUp,
    MlpDown,
}

impl LinearSite {
    pub const ALL: [LinearSite; 6] = [
        LinearSite::Query,
        LinearSite::Key,
        LinearSite::Value,
        LinearSite::AttnProj,
        LinearSite::MlpUp,
        LinearSite::MlpDown,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LinearSite::Query => "q",
            LinearSite::Key => "k",
            LinearSite::Value => "v",
            LinearSite::AttnProj => "attn_proj",
            LinearSite::MlpUp => "mlp_up",
            LinearSite::MlpDown => "mlp_down",
        }
    }

    fn is_attention(self) -> bool {
        matches!(
            self,
            LinearSite::Query | LinearSite::Key | LinearSite::Value | LinearSite::AttnProj
        )
    }
}

/// One attention quantization site: on/off plus an optional bit-width override.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteQuant {
    pub enabled: bool,
    pub bits: Option<u32>,
}

/// Fake-quantization settings for the eight attention tensor sites.
///
/// A site is active when `all` or its own flag is set; its bit-width falls back to
/// `default_bits`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionQuantConfig {
    pub all: bool,
    pub default_bits: u32,
    pub input: SiteQuant,
    pub qk_input: SiteQuant,
    pub qk_output: SiteQuant,
    pub softmax_input: SiteQuant,
    pub softmax_output: SiteQuant,
    pub pv_input: SiteQuant,
    pub pv_output: SiteQuant,
    pub output: SiteQuant,
}

impl Default for AttentionQuantConfig {
    fn default() -> Self {
        Self {
            all: false,
            default_bits: 8,
            input: SiteQuant::default(),
            qk_input: SiteQuant::default(),
            qk_output: SiteQuant::default(),
            softmax_input: SiteQuant::default(),
            softmax_output: SiteQuant::default(),
            pv_input: SiteQuant::default(),
            pv_output: SiteQuant::default(),
            output: SiteQuant::default(),
        }
    }
}

impl AttentionQuantConfig {
    /// Sites in pipeline order, with their names.
    pub fn sites(&self) -> [(&'static str, &SiteQuant); 8] {
        [
            ("input", &self.input),
            ("qk_input", &self.qk_input),
            ("qk_output", &self.qk_output),
            ("softmax_input", &self.softmax_input),
            ("softmax_output", &self.softmax_output),
            ("pv_input", &self.pv_input),
            ("pv_output", &self.pv_output),
            ("output", &self.output),
        ]
    }

    /// `(enabled, bits)` after applying the master switch and default width.
    pub fn resolve(&self, site: &SiteQuant) -> (bool, u32) {
        (self.all || site.enabled, site.bits.unwrap_or(self.default_bits))
    }

    pub fn any_enabled(&self) -> bool {
        self.sites().iter().any(|(_, s)| self.resolve(s).0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    // sizes
    pub block_size: usize,
    pub vocab_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    /// Key/value head count; `None` means one per query head.
    pub n_kv_group: Option<usize>,
    /// Query projections sharing one key/value projection per attention.
    pub n_query_sets: usize,
    pub n_embd: usize,
    pub dropout: f32,
    pub bias: bool,
    pub qkv_bias: bool,
    pub seed: u64,

    // layout and normalization
    pub use_post_ln: bool,
    pub norm_variant_attn: String,
    pub norm_variant_output: String,
    pub norm_eps: f32,

    // mlp
    pub mlp_variant: String,
    pub activation_variant: String,
    pub mlp_expansion_factor: f32,

    // softmax variants
    pub softmax_variant_attn: String,
    pub softmax_variant_output: String,
    pub softermax_use_xmax: bool,
    pub constantmax_initial_beta: f32,
    pub constantmax_initial_gamma: f32,
    pub constantmax_use_euler_base: bool,
    pub constantmax_base: f32,
    /// Exponent bit width of `constantmax_quan`.
    pub constantmax_quant_bits: u32,
    pub polymax_x_intercept: f32,
    pub polymax_y_intercept: f32,
    pub polymax_power: f32,
    pub polymax_divisor: f32,
    pub sigsoftmax_use_euler_base: bool,
    pub sigsoftmax_base: f32,
    pub strongermax_strength: f32,

    // linear variants: site, then axis, then global
    pub linear_variant: String,
    pub linear_variant_attn: Option<String>,
    pub linear_variant_mlp: Option<String>,
    pub linear_variant_q: Option<String>,
    pub linear_variant_k: Option<String>,
    pub linear_variant_v: Option<String>,
    pub linear_variant_attn_proj: Option<String>,
    pub linear_variant_mlp_up: Option<String>,
    pub linear_variant_mlp_down: Option<String>,
    pub linear_quant_bits: u32,
    /// Also fake-quantize the inputs of `quantized` linears at this width.
    pub linear_quant_activation_bits: Option<u32>,
    pub quantization_method: String,

    // position encoding
    pub use_abs_pos_embeddings: bool,
    pub use_rotary_embeddings: bool,
    pub rope_variant: String,
    pub rotator_variant: String,
    pub cordic_stages: usize,
    pub rope_base: f64,
    pub shortrope_length: usize,

    // attention
    pub window_size: Option<usize>,
    pub use_gate: bool,
    pub use_fire_embeddings: bool,
    pub fire_hidden: usize,
    pub fire_init_c: f32,
    pub fire_init_l: f32,
    pub use_fused_attention: bool,
    pub attn_quant: AttentionQuantConfig,

    // sharing
    pub shared_attn_size: usize,
    pub shared_attn_sym: bool,
    pub shared_mlp_size: usize,
    pub shared_mlp_sym: bool,

    // mixture of experts
    pub use_moe: bool,
    pub n_experts: usize,
    pub moe_top_k: usize,
    pub moe_layer_freq: usize,
    pub moe_router_scheme: String,
    pub moe_aux_loss_coef: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            block_size: 1024,
            vocab_size: 50304,
            n_layer: 12,
            n_head: 12,
            n_kv_group: None,
            n_query_sets: 1,
            n_embd: 768,
            dropout: 0.0,
            bias: false,
            qkv_bias: false,
            seed: 1337,

            use_post_ln: false,
            norm_variant_attn: "rmsnorm".into(),
            norm_variant_output: "rmsnorm".into(),
            norm_eps: 1e-5,

            mlp_variant: "mlp".into(),
            activation_variant: "gelu".into(),
            mlp_expansion_factor: 4.0,

            softmax_variant_attn: "softmax".into(),
            softmax_variant_output: "softmax".into(),
            softermax_use_xmax: true,
            constantmax_initial_beta: 0.0,
            constantmax_initial_gamma: 1.0,
            constantmax_use_euler_base: true,
            constantmax_base: 2.0,
            constantmax_quant_bits: 8,
            polymax_x_intercept: -100.0,
            polymax_y_intercept: 1.0,
            polymax_power: 2.0,
            polymax_divisor: 1000.0,
            sigsoftmax_use_euler_base: true,
            sigsoftmax_base: 2.0,
            strongermax_strength: 2.0,

            linear_variant: "linear".into(),
            linear_variant_attn: None,
            linear_variant_mlp: None,
            linear_variant_q: None,
            linear_variant_k: None,
            linear_variant_v: None,
            linear_variant_attn_proj: None,
            linear_variant_mlp_up: None,
            linear_variant_mlp_down: None,
            linear_quant_bits: 8,
            linear_quant_activation_bits: None,
            quantization_method: "stochastic".into(),

            use_abs_pos_embeddings: false,
            use_rotary_embeddings: true,
            rope_variant: "rope".into(),
            rotator_variant: "exact".into(),
            cordic_stages: 5,
            rope_base: 10_000.0,
            shortrope_length: 8,

            window_size: None,
            use_gate: false,
            use_fire_embeddings: false,
            fire_hidden: 32,
            fire_init_c: 0.1,
            fire_init_l: 512.0,
            use_fused_attention: true,
            attn_quant: AttentionQuantConfig::default(),

            shared_attn_size: 1,
            shared_attn_sym: false,
            shared_mlp_size: 1,
            shared_mlp_sym: false,

            use_moe: false,
            n_experts: 8,
            moe_top_k: 2,
            moe_layer_freq: 2,
            moe_router_scheme: "topk_softmax".into(),
            moe_aux_loss_coef: 0.01,
        }
    }
}

fn check_bits(what: &str, bits: u32) -> Result<()> {
    if bits == 0 || bits > MAX_BITS {
        return Err(VarError::config(format!(
            "{what}: bit width must be in 1..={MAX_BITS}, got {bits}"
        )));
    }
    Ok(())
}

impl ModelConfig {
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head.max(1)
    }

    pub fn kv_groups(&self) -> usize {
        self.n_kv_group.unwrap_or(self.n_head)
    }

    /// Hidden width of a dense MLP.
    pub fn mlp_hidden(&self) -> usize {
        (self.mlp_expansion_factor * self.n_embd as f32).round() as usize
    }

    /// Position encoding actually applied to queries and keys.
    pub fn position_variant(&self) -> &str {
        if self.use_rotary_embeddings {
            &self.rope_variant
        } else {
            "none"
        }
    }

    /// Linear variant for `site`: site override, then axis default, then global.
    pub fn linear_variant_for(&self, site: LinearSite) -> &str {
        let specific = match site {
            LinearSite::Query => &self.linear_variant_q,
            LinearSite::Key => &self.linear_variant_k,
            LinearSite::Value => &self.linear_variant_v,
            LinearSite::AttnProj => &self.linear_variant_attn_proj,
            LinearSite::MlpUp => &self.linear_variant_mlp_up,
            LinearSite::MlpDown => &self.linear_variant_mlp_down,
        };
        let axis = if site.is_attention() {
            &self.linear_variant_attn
        } else {
            &self.linear_variant_mlp
        };
        specific
            .as_deref()
            .or(axis.as_deref())
            .unwrap_or(&self.linear_variant)
    }

    /// Whether layer `i` uses a mixture of experts instead of a dense MLP.
    pub fn is_moe_layer(&self, layer: usize) -> bool {
        self.use_moe && layer % self.moe_layer_freq.max(1) == 0
    }

    pub fn validate(&self) -> Result<()> {
        for (what, v) in [
            ("n_embd", self.n_embd),
            ("n_head", self.n_head),
            ("n_layer", self.n_layer),
            ("block_size", self.block_size),
            ("vocab_size", self.vocab_size),
            ("n_query_sets", self.n_query_sets),
        ] {
            if v == 0 {
                return Err(VarError::config(format!("{what} must be >= 1")));
            }
        }
        if self.n_embd % self.n_head != 0 {
            return Err(VarError::config(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        let kv = self.kv_groups();
        if kv == 0 || self.n_head % kv != 0 {
            return Err(VarError::config(format!(
                "n_head ({}) must be divisible by n_kv_group ({kv})",
                self.n_head
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(VarError::config(format!("dropout must be in [0, 1), got {}", self.dropout)));
        }
        if self.mlp_hidden() == 0 {
            return Err(VarError::config("mlp_expansion_factor gives an empty hidden layer"));
        }
        if !matches!(self.mlp_variant.as_str(), "mlp" | "swiglu") {
            return Err(VarError::config(format!(
                "mlp_variant must be 'mlp' or 'swiglu', got '{}'",
                self.mlp_variant
            )));
        }

        let head_dim = self.head_dim();
        if self.use_rotary_embeddings {
            if head_dim % 2 != 0 {
                return Err(VarError::config(format!(
                    "rotary encoding needs an even head dimension, got {head_dim}"
                )));
            }
            if self.rope_variant == "shortrope"
                && (self.shortrope_length < 2
                    || self.shortrope_length % 2 != 0
                    || self.shortrope_length > head_dim)
            {
                return Err(VarError::config(format!(
                    "shortrope_length must be even, >= 2 and <= head dimension {head_dim}, got {}",
                    self.shortrope_length
                )));
            }
        }

        if let Some(w) = self.window_size {
            if w == 0 {
                return Err(VarError::config("window_size must be >= 1"));
            }
            if w >= self.block_size {
                warn!(window = w, block_size = self.block_size, "window covers the whole block");
            }
        }
        if self.use_fire_embeddings
            && (self.fire_hidden == 0 || self.fire_init_c <= 0.0 || self.fire_init_l < 1.0)
        {
            return Err(VarError::config(
                "FIRE needs fire_hidden >= 1, fire_init_c > 0 and fire_init_l >= 1",
            ));
        }

        if self.shared_attn_size == 0 || self.shared_mlp_size == 0 {
            return Err(VarError::config("shared group sizes must be >= 1"));
        }

        check_bits("linear_quant_bits", self.linear_quant_bits)?;
        if let Some(bits) = self.linear_quant_activation_bits {
            check_bits("linear_quant_activation_bits", bits)?;
        }
        check_bits("constantmax_quant_bits", self.constantmax_quant_bits)?;
        check_bits("attn_quant.default_bits", self.attn_quant.default_bits)?;
        for (name, site) in self.attn_quant.sites() {
            if let Some(bits) = site.bits {
                check_bits(&format!("attn_quant.{name}"), bits)?;
            }
        }

        if self.use_moe {
            if self.n_experts == 0 {
                return Err(VarError::config("n_experts must be >= 1"));
            }
            if self.moe_top_k == 0 || self.moe_top_k > self.n_experts {
                return Err(VarError::config(format!(
                    "moe_top_k must be in 1..={}, got {}",
                    self.n_experts, self.moe_top_k
                )));
            }
            if self.moe_layer_freq == 0 {
                return Err(VarError::config("moe_layer_freq must be >= 1"));
            }
        }

        self.check_variants()
    }

    fn check_variants(&self) -> Result<()> {
        let reg = registry();
        reg.check(Namespace::Normalization, &self.norm_variant_attn)?;
        reg.check(Namespace::Normalization, &self.norm_variant_output)?;
        reg.check(Namespace::Activation, &self.activation_variant)?;
        reg.check(Namespace::Softmax, &self.softmax_variant_attn)?;
        reg.check(Namespace::Softmax, &self.softmax_variant_output)?;
        for site in LinearSite::ALL {
            reg.check(Namespace::Linear, self.linear_variant_for(site))?;
        }
        reg.check(Namespace::PositionEncoding, self.position_variant())?;
        reg.check(Namespace::Rotator, &self.rotator_variant)?;
        reg.check(Namespace::QuantizationMethod, &self.quantization_method)?;
        if self.use_moe {
            reg.check(Namespace::Router, &self.moe_router_scheme)?;
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| VarError::Serialization(e.to_string()))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| VarError::Serialization(e.to_string()))
    }
}
