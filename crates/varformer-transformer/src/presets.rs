//! Named model configurations.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use varformer_core::{Result, VarError};

use crate::config::ModelConfig;

fn gpt2(n_layer: usize, n_head: usize, n_embd: usize) -> ModelConfig {
    ModelConfig {
        n_layer,
        n_head,
        n_embd,
        vocab_size: 50257,
        block_size: 1024,
        bias: true,
        norm_variant_attn: "layernorm".into(),
        norm_variant_output: "layernorm".into(),
        activation_variant: "gelu".into(),
        use_abs_pos_embeddings: true,
        use_rotary_embeddings: false,
        ..ModelConfig::default()
    }
}

fn qwen2(n_layer: usize, n_head: usize, n_kv: usize, n_embd: usize, hidden: usize, vocab: usize, block: usize) -> ModelConfig {
    ModelConfig {
        n_layer,
        n_head,
        n_kv_group: Some(n_kv),
        n_embd,
        vocab_size: vocab,
        block_size: block,
        bias: false,
        qkv_bias: true,
        norm_variant_attn: "rmsnorm".into(),
        norm_variant_output: "rmsnorm".into(),
        activation_variant: "silu".into(),
        mlp_variant: "swiglu".into(),
        mlp_expansion_factor: hidden as f32 / n_embd as f32,
        use_abs_pos_embeddings: false,
        use_rotary_embeddings: true,
        ..ModelConfig::default()
    }
}

static PRESETS: Lazy<BTreeMap<&'static str, ModelConfig>> = Lazy::new(|| {
    BTreeMap::from([
        ("gpt2", gpt2(12, 12, 768)),
        ("gpt2-medium", gpt2(24, 16, 1024)),
        ("gpt2-large", gpt2(36, 20, 1280)),
        ("gpt2-xl", gpt2(48, 25, 1600)),
        ("qwen2_0p5b", qwen2(24, 14, 2, 896, 4864, 151936, 128)),
        ("qwen2_1p5b", qwen2(28, 12, 2, 1536, 8960, 151936, 256)),
        ("qwen2_7b", qwen2(28, 28, 4, 3584, 18944, 152064, 512)),
        (
            "tiny",
            ModelConfig {
                n_layer: 2,
                n_head: 4,
                n_embd: 64,
                block_size: 64,
                vocab_size: 256,
                ..ModelConfig::default()
            },
        ),
    ])
});

/// A copy of the preset called `name`.
pub fn preset(name: &str) -> Result<ModelConfig> {
    PRESETS.get(name).cloned().ok_or_else(|| VarError::UnknownVariant {
        namespace: "preset",
        name: name.to_string(),
    })
}

pub fn names() -> Vec<&'static str> {
    PRESETS.keys().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_preset_validates() {
        assert_eq!(names().len(), 8);
        for name in names() {
            preset(name).unwrap().validate().unwrap_or_else(|e| panic!("{name}: {e}"));
        }
    }

    #[test]
    fn test_preset_shapes() {
        let xl = preset("gpt2-xl").unwrap();
        assert_eq!((xl.n_layer, xl.n_head, xl.n_embd, xl.head_dim()), (48, 25, 1600, 64));
        let q = preset("qwen2_7b").unwrap();
        assert_eq!(q.kv_groups(), 4);
        assert_eq!(q.mlp_hidden(), 18944);
        assert_eq!(preset("qwen2_0p5b").unwrap().mlp_hidden(), 4864);
        assert!(preset("llama").unwrap_err().is_config_error());
    }
}
