//! Residual sub-units that make up one decoder layer.
//!
//! Each layer position pairs an [`AttentionUnit`] with an [`MlpUnit`]; the model keeps
//! them in separate arenas so the two kinds can be shared independently.

use rand::RngCore;
use varformer_core::{Result, Tensor};
use varformer_nn::module::{prefixed, prefixed_mut};
use varformer_nn::Module;

use crate::attention::CausalSelfAttention;
use crate::config::ModelConfig;
use crate::feed_forward::Mlp;
use crate::moe::MoeLayer;
use crate::registry::registry;
use crate::variants::Normalization;

/// `x + attn(norm(x))`, or `norm(x + attn(x))` in post-norm layout.
pub struct AttentionUnit {
    norm: Box<dyn Normalization>,
    attn: CausalSelfAttention,
}

impl AttentionUnit {
    pub fn new(config: &ModelConfig, rng: &mut dyn RngCore) -> Result<Self> {
        Ok(Self {
            norm: registry().normalization(&config.norm_variant_attn, config.n_embd, config)?,
            attn: CausalSelfAttention::new(config, rng)?,
        })
    }

    pub fn attention(&self) -> &CausalSelfAttention {
        &self.attn
    }

    pub fn attention_mut(&mut self) -> &mut CausalSelfAttention {
        &mut self.attn
    }

    pub fn norm_name(&self) -> &'static str {
        self.norm.name()
    }

    pub fn residual(&self, x: &Tensor, post_ln: bool) -> Result<Tensor> {
        if post_ln {
            self.norm.forward(&x.add(&self.attn.forward(x)?)?)
        } else {
            x.add(&self.attn.forward(&self.norm.forward(x)?)?)
        }
    }
}

impl Module for AttentionUnit {
    /// Sub-layer output without the residual connection.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.attn.forward(&self.norm.forward(x)?)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("norm", self.norm.named_parameters());
        params.extend(self.attn.named_parameters());
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("norm", self.norm.named_parameters_mut());
        params.extend(self.attn.named_parameters_mut());
        params
    }

    fn train(&mut self, mode: bool) {
        self.attn.train(mode);
    }

    fn is_training(&self) -> bool {
        self.attn.is_training()
    }
}

pub enum FeedForward {
    Dense(Mlp),
    Moe(MoeLayer),
}

impl FeedForward {
    fn as_module(&self) -> &dyn Module {
        match self {
            FeedForward::Dense(m) => m,
            FeedForward::Moe(m) => m,
        }
    }

    fn as_module_mut(&mut self) -> &mut dyn Module {
        match self {
            FeedForward::Dense(m) => m,
            FeedForward::Moe(m) => m,
        }
    }

    /// Output plus the balancing loss of a mixture layer.
    pub fn forward_with_aux(&self, x: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        match self {
            FeedForward::Dense(m) => Ok((m.forward(x)?, None)),
            FeedForward::Moe(m) => {
                let (y, aux) = m.forward_with_aux(x)?;
                Ok((y, Some(aux)))
            }
        }
    }
}

/// Residual MLP or mixture-of-experts sub-unit.
pub struct MlpUnit {
    norm: Box<dyn Normalization>,
    ffn: FeedForward,
}

impl MlpUnit {
    pub fn new(config: &ModelConfig, moe: bool, rng: &mut dyn RngCore) -> Result<Self> {
        let norm = registry().normalization(&config.norm_variant_attn, config.n_embd, config)?;
        let ffn = if moe {
            FeedForward::Moe(MoeLayer::new(config, rng)?)
        } else {
            FeedForward::Dense(Mlp::new(config, rng)?)
        };
        Ok(Self { norm, ffn })
    }

    pub fn feed_forward(&self) -> &FeedForward {
        &self.ffn
    }

    pub fn kind(&self) -> &'static str {
        match self.ffn {
            FeedForward::Dense(_) => "dense",
            FeedForward::Moe(_) => "moe",
        }
    }

    pub fn residual(&self, x: &Tensor, post_ln: bool) -> Result<(Tensor, Option<Tensor>)> {
        if post_ln {
            let (y, aux) = self.ffn.forward_with_aux(x)?;
            Ok((self.norm.forward(&x.add(&y)?)?, aux))
        } else {
            let (y, aux) = self.ffn.forward_with_aux(&self.norm.forward(x)?)?;
            Ok((x.add(&y)?, aux))
        }
    }
}

impl Module for MlpUnit {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.ffn.as_module().forward(&self.norm.forward(x)?)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("norm", self.norm.named_parameters());
        params.extend(self.ffn.as_module().named_parameters());
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("norm", self.norm.named_parameters_mut());
        params.extend(self.ffn.as_module_mut().named_parameters_mut());
        params
    }

    fn train(&mut self, mode: bool) {
        self.ffn.as_module_mut().train(mode);
    }

    fn is_training(&self) -> bool {
        self.ffn.as_module().is_training()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cfg() -> ModelConfig {
        ModelConfig {
            n_embd: 8,
            n_head: 2,
            n_layer: 1,
            block_size: 4,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_pre_and_post_norm_layouts() {
        let mut rng = StdRng::seed_from_u64(6);
        let unit = AttentionUnit::new(&cfg(), &mut rng).unwrap();
        let x = Tensor::randn_with(&[1, 3, 8], 1.0, &mut rng);

        let pre = unit.residual(&x, false).unwrap();
        let expected = x.add(&unit.forward(&x).unwrap()).unwrap();
        assert_eq!(pre.to_vec(), expected.to_vec());

        // post-norm output is normalized: unit RMS per row for rmsnorm
        let post = unit.residual(&x, true).unwrap().to_vec();
        for row in post.chunks(8) {
            let rms = (row.iter().map(|v| v * v).sum::<f32>() / 8.0).sqrt();
            assert!((rms - 1.0).abs() < 1e-3, "{rms}");
        }
    }

    #[test]
    fn test_mlp_unit_kinds_and_names() {
        let mut rng = StdRng::seed_from_u64(7);
        let config = ModelConfig {
            use_moe: true,
            n_experts: 2,
            moe_top_k: 1,
            ..cfg()
        };
        let dense = MlpUnit::new(&config, false, &mut rng).unwrap();
        let moe = MlpUnit::new(&config, true, &mut rng).unwrap();
        assert_eq!(dense.kind(), "dense");
        assert_eq!(moe.kind(), "moe");
        let names: Vec<String> = moe.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"router.weight".to_string()));
        assert!(names.contains(&"experts.1.c_proj.weight".to_string()));
        let x = Tensor::ones(&[1, 2, 8]);
        assert!(dense.residual(&x, false).unwrap().1.is_none());
        assert!(moe.residual(&x, false).unwrap().1.is_some());
    }
}
