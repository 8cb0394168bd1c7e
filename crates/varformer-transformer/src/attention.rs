//! Configurable causal self-attention.
//!
//! Grouped key/value heads, optional sigmoid gates on the projections, rotary (or no)
//! position encoding, causal or sliding-window masking, an optional FIRE bias, any
//! registered softmax variant, and eight fake-quantization sites along the way.
//! Several query sets may share one key/value projection; their outputs are
//! concatenated before the output projection.
//! When none of the extras are active the fused causal kernel replaces the manual
//! score/softmax/value pipeline.

use rand::RngCore;
use tracing::debug;
use varformer_attention::{causal_mask, fused_causal_attention, sliding_window_mask, FireBias};
use varformer_core::{Result, Tensor, VarError};
use varformer_nn::activations::sigmoid;
use varformer_nn::linear::INIT_STD;
use varformer_nn::module::{prefixed, prefixed_mut};
use varformer_nn::{Dropout, Linear, Module, QuantSite, QuantSpec};

use crate::config::{LinearSite, ModelConfig, SiteQuant};
use crate::feed_forward::residual_std;
use crate::registry::registry;
use crate::variants::{LinearLayer, LinearSpec, PositionEncoding, SoftmaxVariant};

/// The eight attention quantization sites, in pipeline order.
pub struct AttentionQuantSites {
    pub input: QuantSite,
    pub qk_input: QuantSite,
    pub qk_output: QuantSite,
    pub softmax_input: QuantSite,
    pub softmax_output: QuantSite,
    pub pv_input: QuantSite,
    pub pv_output: QuantSite,
    pub output: QuantSite,
}

impl AttentionQuantSites {
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let method = registry().quant_method(&config.quantization_method)?;
        let q = &config.attn_quant;
        let site = |name: &'static str, s: &SiteQuant| -> Result<QuantSite> {
            let (enabled, bits) = q.resolve(s);
            Ok(QuantSite::new(name, QuantSpec::new(enabled, bits, method)?))
        };
        Ok(Self {
            input: site("input", &q.input)?,
            qk_input: site("qk_input", &q.qk_input)?,
            qk_output: site("qk_output", &q.qk_output)?,
            softmax_input: site("softmax_input", &q.softmax_input)?,
            softmax_output: site("softmax_output", &q.softmax_output)?,
            pv_input: site("pv_input", &q.pv_input)?,
            pv_output: site("pv_output", &q.pv_output)?,
            output: site("output", &q.output)?,
        })
    }

    pub fn all(&self) -> [&QuantSite; 8] {
        [
            &self.input,
            &self.qk_input,
            &self.qk_output,
            &self.softmax_input,
            &self.softmax_output,
            &self.pv_input,
            &self.pv_output,
            &self.output,
        ]
    }

    pub fn any_active(&self) -> bool {
        self.all().iter().any(|s| s.is_active())
    }
}

/// Multiplicative `sigmoid(Linear(x))` gates on the projections.
enum Gates {
    None,
    /// One gate for q, k and v (only with one query set and as many key/value heads
    /// as query heads).
    Shared(Linear),
    Split { q: Linear, kv: Linear },
}

pub struct CausalSelfAttention {
    n_head: usize,
    n_kv: usize,
    n_query_sets: usize,
    head_dim: usize,
    q_proj: Box<dyn LinearLayer>,
    k_proj: Box<dyn LinearLayer>,
    v_proj: Box<dyn LinearLayer>,
    c_proj: Box<dyn LinearLayer>,
    gates: Gates,
    position: Box<dyn PositionEncoding>,
    softmax: Box<dyn SoftmaxVariant>,
    window: Option<usize>,
    fire: Option<FireBias>,
    sites: AttentionQuantSites,
    attn_dropout: Dropout,
    resid_dropout: Dropout,
    fused: bool,
}

impl CausalSelfAttention {
    pub fn new(config: &ModelConfig, rng: &mut dyn RngCore) -> Result<Self> {
        if config.n_embd % config.n_head != 0 {
            return Err(VarError::config(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                config.n_embd, config.n_head
            )));
        }
        if config.n_query_sets == 0 {
            return Err(VarError::config("n_query_sets must be >= 1"));
        }
        let reg = registry();
        let (n_head, n_kv, sets) = (config.n_head, config.kv_groups(), config.n_query_sets);
        let head_dim = config.n_embd / n_head;
        let c = config.n_embd;

        let proj = |site: LinearSite, out: usize, bias: bool, std: f32, rng: &mut dyn RngCore| {
            let spec = LinearSpec {
                in_features: if site == LinearSite::AttnProj { sets * n_head * head_dim } else { c },
                out_features: out,
                bias,
                std,
            };
            reg.linear(config.linear_variant_for(site), &spec, config, rng)
        };
        let qkv_bias = config.bias || config.qkv_bias;
        let q_proj = proj(LinearSite::Query, sets * n_head * head_dim, qkv_bias, INIT_STD, &mut *rng)?;
        let k_proj = proj(LinearSite::Key, n_kv * head_dim, qkv_bias, INIT_STD, &mut *rng)?;
        let v_proj = proj(LinearSite::Value, n_kv * head_dim, qkv_bias, INIT_STD, &mut *rng)?;
        let c_proj = proj(LinearSite::AttnProj, c, config.bias, residual_std(config), &mut *rng)?;

        let gates = match (config.use_gate, n_kv == n_head && sets == 1) {
            (false, _) => Gates::None,
            (true, true) => Gates::Shared(Linear::with_rng(c, c, true, INIT_STD, rng)),
            (true, false) => Gates::Split {
                q: Linear::with_rng(c, sets * n_head * head_dim, true, INIT_STD, rng),
                kv: Linear::with_rng(c, n_kv * head_dim, true, INIT_STD, rng),
            },
        };

        let fire = if config.use_fire_embeddings {
            Some(FireBias::new(
                n_head,
                config.fire_hidden,
                config.fire_init_c,
                config.fire_init_l,
                rng,
            )?)
        } else {
            None
        };

        let position = reg.position_encoding(config.position_variant(), config)?;
        let softmax = reg.softmax(&config.softmax_variant_attn, config)?;
        let sites = AttentionQuantSites::from_config(config)?;
        let fused = config.use_fused_attention
            && softmax.is_standard()
            && config.window_size.is_none()
            && n_kv == n_head
            && fire.is_none()
            && !sites.any_active();
        debug!(
            n_head,
            n_kv,
            query_sets = sets,
            head_dim,
            softmax = softmax.name(),
            position = position.name(),
            fused,
            "built attention"
        );

        Ok(Self {
            n_head,
            n_kv,
            n_query_sets: sets,
            head_dim,
            q_proj,
            k_proj,
            v_proj,
            c_proj,
            gates,
            position,
            softmax,
            window: config.window_size,
            fire,
            sites,
            attn_dropout: Dropout::with_seed(config.dropout, rng.next_u64())?,
            resid_dropout: Dropout::with_seed(config.dropout, rng.next_u64())?,
            fused,
        })
    }

    pub fn n_head(&self) -> usize {
        self.n_head
    }

    pub fn n_kv_groups(&self) -> usize {
        self.n_kv
    }

    pub fn n_query_sets(&self) -> usize {
        self.n_query_sets
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn sites(&self) -> &AttentionQuantSites {
        &self.sites
    }

    pub fn softmax_name(&self) -> &'static str {
        self.softmax.name()
    }

    pub fn position(&self) -> &dyn PositionEncoding {
        self.position.as_ref()
    }

    pub fn crop_positions(&mut self, positions: usize) {
        self.position.crop(positions);
    }

    /// Whether the next forward pass takes the fused kernel.
    pub fn uses_fused_path(&self) -> bool {
        self.fused && !self.attn_dropout.is_active()
    }

    /// `[B, T, n * D] -> [B, n, T, D]`
    fn split_heads(&self, x: &Tensor, heads: usize) -> Result<Tensor> {
        let (b, t) = (x.dims()[0] as isize, x.dims()[1] as isize);
        x.reshape(&[b, t, heads as isize, self.head_dim as isize])?
            .transpose(1, 2)
    }

    /// Repeat each key/value head for the query heads it serves.
    fn expand_kv(&self, x: &Tensor) -> Result<Tensor> {
        if self.n_kv == self.n_head {
            return Ok(x.clone());
        }
        let per_group = self.n_head / self.n_kv;
        let idx: Vec<usize> = (0..self.n_head).map(|h| h / per_group).collect();
        x.index_select(1, &idx)
    }

    fn scores_to_values(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let seq = q.dims()[2];
        let scale = 1.0 / (self.head_dim as f32).sqrt();
        let q = self.sites.qk_input.apply(q);
        let k = self.sites.qk_input.apply(k);
        let scores = q.matmul(&k.transpose(-2, -1)?)?.mul_scalar(scale)?;
        let scores = self.sites.qk_output.apply(&scores);

        let mask = match self.window {
            Some(w) => sliding_window_mask(seq, w),
            None => causal_mask(seq),
        };
        let mut scores = scores.masked_fill(&mask, f32::NEG_INFINITY)?;
        if let Some(fire) = &self.fire {
            scores = scores.add(&fire.bias(seq)?)?;
        }
        // quantization saturates -inf, so masked entries are restored afterwards
        let scores = self
            .sites
            .softmax_input
            .apply(&scores)
            .masked_fill(&mask, f32::NEG_INFINITY)?;

        let probs = self.softmax.forward(&scores)?;
        let probs = self.sites.softmax_output.apply(&probs);
        let probs = self.attn_dropout.forward(&probs)?;
        let y = self
            .sites
            .pv_input
            .apply(&probs)
            .matmul(&self.sites.pv_input.apply(v))?;
        Ok(self.sites.pv_output.apply(&y))
    }
}

impl Module for CausalSelfAttention {
    /// `[B, T, C] -> [B, T, C]`
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if x.ndim() != 3 {
            return Err(VarError::ShapeMismatch {
                expected: vec![0, 0, self.n_head * self.head_dim],
                got: x.dims().to_vec(),
            });
        }
        let (b, t) = (x.dims()[0], x.dims()[1]);
        let x = self.sites.input.apply(x);

        let mut q = self.q_proj.forward(&x)?;
        let mut k = self.k_proj.forward(&x)?;
        let mut v = self.v_proj.forward(&x)?;
        match &self.gates {
            Gates::None => {}
            Gates::Shared(g) => {
                let g = sigmoid(&g.forward(&x)?)?;
                q = q.mul(&g)?;
                k = k.mul(&g)?;
                v = v.mul(&g)?;
            }
            Gates::Split { q: gq, kv: gkv } => {
                q = q.mul(&sigmoid(&gq.forward(&x)?)?)?;
                let g = sigmoid(&gkv.forward(&x)?)?;
                k = k.mul(&g)?;
                v = v.mul(&g)?;
            }
        }

        let k = self.position.apply(&self.split_heads(&k, self.n_kv)?)?;
        let v = self.split_heads(&v, self.n_kv)?;
        let (k, v) = (self.expand_kv(&k)?, self.expand_kv(&v)?);

        let width = self.n_head * self.head_dim;
        let mut outputs = Vec::with_capacity(self.n_query_sets);
        for set in 0..self.n_query_sets {
            let q_set = if self.n_query_sets == 1 {
                q.clone()
            } else {
                q.narrow(2, set * width, width)?
            };
            let q_set = self.position.apply(&self.split_heads(&q_set, self.n_head)?)?;
            let y = if self.uses_fused_path() {
                fused_causal_attention(&q_set, &k, &v, 1.0 / (self.head_dim as f32).sqrt())?
            } else {
                self.scores_to_values(&q_set, &k, &v)?
            };
            outputs.push(y.transpose(1, 2)?.reshape(&[b as isize, t as isize, width as isize])?);
        }
        let y = match outputs.as_slice() {
            [single] => single.clone(),
            many => Tensor::cat(&many.iter().collect::<Vec<_>>(), -1)?,
        };
        let y = self.sites.output.apply(&self.c_proj.forward(&y)?);
        self.resid_dropout.forward(&y)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("q_proj", self.q_proj.named_parameters());
        params.extend(prefixed("k_proj", self.k_proj.named_parameters()));
        params.extend(prefixed("v_proj", self.v_proj.named_parameters()));
        match &self.gates {
            Gates::None => {}
            Gates::Shared(g) => params.extend(prefixed("gate", g.named_parameters())),
            Gates::Split { q, kv } => {
                params.extend(prefixed("gate_q", q.named_parameters()));
                params.extend(prefixed("gate_kv", kv.named_parameters()));
            }
        }
        if let Some(fire) = &self.fire {
            params.extend(prefixed("fire", fire.named_parameters()));
        }
        params.extend(prefixed("softmax", self.softmax.named_parameters()));
        params.extend(prefixed("c_proj", self.c_proj.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("q_proj", self.q_proj.named_parameters_mut());
        params.extend(prefixed_mut("k_proj", self.k_proj.named_parameters_mut()));
        params.extend(prefixed_mut("v_proj", self.v_proj.named_parameters_mut()));
        match &mut self.gates {
            Gates::None => {}
            Gates::Shared(g) => params.extend(prefixed_mut("gate", g.named_parameters_mut())),
            Gates::Split { q, kv } => {
                params.extend(prefixed_mut("gate_q", q.named_parameters_mut()));
                params.extend(prefixed_mut("gate_kv", kv.named_parameters_mut()));
            }
        }
        if let Some(fire) = &mut self.fire {
            params.extend(prefixed_mut("fire", fire.named_parameters_mut()));
        }
        params.extend(prefixed_mut("softmax", self.softmax.named_parameters_mut()));
        params.extend(prefixed_mut("c_proj", self.c_proj.named_parameters_mut()));
        params
    }

    fn train(&mut self, mode: bool) {
        self.attn_dropout.train(mode);
        self.resid_dropout.train(mode);
    }

    fn is_training(&self) -> bool {
        self.attn_dropout.is_training()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn cfg() -> ModelConfig {
        ModelConfig {
            n_embd: 16,
            n_head: 4,
            n_layer: 2,
            block_size: 8,
            vocab_size: 32,
            ..ModelConfig::default()
        }
    }

    fn build(config: &ModelConfig) -> CausalSelfAttention {
        CausalSelfAttention::new(config, &mut StdRng::seed_from_u64(3)).unwrap()
    }

    fn input() -> Tensor {
        Tensor::randn_with(&[2, 5, 16], 1.0, &mut StdRng::seed_from_u64(4))
    }

    #[test]
    fn test_fast_path_eligibility() {
        assert!(build(&cfg()).uses_fused_path());
        let blockers = [
            ModelConfig { window_size: Some(2), ..cfg() },
            ModelConfig { n_kv_group: Some(2), ..cfg() },
            ModelConfig { use_fire_embeddings: true, ..cfg() },
            ModelConfig { softmax_variant_attn: "softermax".into(), ..cfg() },
            ModelConfig { use_fused_attention: false, ..cfg() },
        ];
        for config in &blockers {
            assert!(!build(config).uses_fused_path());
        }
        let mut quant = cfg();
        quant.attn_quant.pv_output.enabled = true;
        assert!(!build(&quant).uses_fused_path());

        let dropout = ModelConfig { dropout: 0.1, ..cfg() };
        let mut attn = build(&dropout);
        assert!(!attn.uses_fused_path());
        attn.train(false);
        assert!(attn.uses_fused_path());
    }

    #[test]
    fn test_output_shape_and_causality() {
        let attn = build(&cfg());
        let x = input();
        let y = attn.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 5, 16]);

        // changing the last token must not change earlier outputs
        let mut x2 = x.detach();
        x2.update_data(|d| d[4 * 16..5 * 16].iter_mut().for_each(|v| *v += 1.0));
        let y2 = attn.forward(&x2).unwrap();
        let (a, b) = (y.to_vec(), y2.to_vec());
        for i in 0..4 * 16 {
            assert!((a[i] - b[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_window_of_one_attends_only_to_self() {
        let config = ModelConfig {
            window_size: Some(1),
            use_rotary_embeddings: false,
            ..cfg()
        };
        let attn = build(&config);
        // with a single visible key each output depends only on its own token
        let x = input();
        let y = attn.forward(&x).unwrap().to_vec();
        let solo = attn.forward(&x.narrow(1, 3, 1).unwrap()).unwrap().to_vec();
        for c in 0..16 {
            assert!((y[3 * 16 + c] - solo[c]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_gated_and_fire_parameters_train() {
        let config = ModelConfig {
            use_gate: true,
            n_kv_group: Some(2),
            use_fire_embeddings: true,
            fire_hidden: 4,
            softmax_variant_attn: "constantmax".into(),
            ..cfg()
        };
        let attn = build(&config);
        let names: Vec<String> = attn.named_parameters().into_iter().map(|(n, _)| n).collect();
        for expected in ["gate_q.weight", "gate_kv.bias", "fire.fc2.weight", "softmax.beta"] {
            assert!(names.iter().any(|n| n == expected), "{expected} missing from {names:?}");
        }
        attn.forward(&input()).unwrap().sum().unwrap().backward().unwrap();
        for (name, p) in attn.named_parameters() {
            assert!(p.grad().is_some(), "{name} has no gradient");
        }
    }

    #[test]
    fn test_query_sets_share_keys_and_values() {
        let config = ModelConfig {
            n_query_sets: 3,
            use_gate: true,
            ..cfg()
        };
        let attn = build(&config);
        assert_eq!(attn.n_query_sets(), 3);
        let shapes: HashMap<String, Vec<usize>> = attn
            .named_parameters()
            .into_iter()
            .map(|(n, p)| (n, p.dims().to_vec()))
            .collect();
        assert_eq!(shapes["q_proj.weight"], vec![48, 16]);
        assert_eq!(shapes["k_proj.weight"], vec![16, 16]);
        assert_eq!(shapes["gate_q.weight"], vec![48, 16]);
        assert_eq!(shapes["c_proj.weight"], vec![16, 48]);

        let y = attn.forward(&input()).unwrap();
        assert_eq!(y.dims(), &[2, 5, 16]);
        y.sum().unwrap().backward().unwrap();
        for (name, p) in attn.named_parameters() {
            assert!(p.grad().is_some(), "{name} has no gradient");
        }
    }

    #[test]
    fn test_single_query_set_matches_the_first_of_many() {
        // with the extra query rows and output columns zeroed, three sets reduce to one
        let one = build(&ModelConfig {
            use_rotary_embeddings: false,
            ..cfg()
        });
        let mut three = build(&ModelConfig {
            n_query_sets: 3,
            use_rotary_embeddings: false,
            ..cfg()
        });
        let src: HashMap<String, Vec<f32>> = one
            .named_parameters()
            .into_iter()
            .map(|(n, p)| (n, p.to_vec()))
            .collect();
        for (name, p) in three.named_parameters_mut() {
            let w = &src[&name];
            let data: Vec<f32> = match name.as_str() {
                "q_proj.weight" => w.iter().copied().chain(std::iter::repeat(0.0).take(2 * w.len())).collect(),
                "c_proj.weight" => w
                    .chunks(16)
                    .flat_map(|row| row.iter().copied().chain(std::iter::repeat(0.0).take(32)))
                    .collect(),
                _ => w.clone(),
            };
            let dims = p.dims().to_vec();
            p.copy_from(&Tensor::from_f32(&data, &dims)).unwrap();
        }
        let x = input();
        let a = one.forward(&x).unwrap().to_vec();
        let b = three.forward(&x).unwrap().to_vec();
        for (u, v) in a.iter().zip(&b) {
            assert!((u - v).abs() < 1e-5, "{u} vs {v}");
        }
    }

    #[test]
    fn test_quant_sites_record_stats() {
        let mut config = cfg();
        config.attn_quant.all = true;
        config.attn_quant.softmax_input.bits = Some(4);
        let attn = build(&config);
        assert!(attn.sites().all().iter().all(|s| s.is_active()));
        assert_eq!(attn.sites().softmax_input.spec().bits.get(), 4);
        let y = attn.forward(&input()).unwrap();
        assert!(y.to_vec().iter().all(|v| v.is_finite()));
        for site in attn.sites().all() {
            assert!(site.stats().calls >= 1, "{}", site.name());
        }
        assert_eq!(attn.sites().qk_input.stats().calls, 2);
    }
}
