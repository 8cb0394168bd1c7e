//! GPT-style decoder assembled from a [`ModelConfig`].
//!
//! GPT = wte (+ wpe) → N × (AttentionUnit, MlpUnit) → ln_f → wte^T

use std::collections::{HashMap, HashSet};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::Serialize;
use tracing::info;
use varformer_core::{NoGradGuard, Result, Tensor, VarError};
use varformer_nn::linear::{linear, INIT_STD};
use varformer_nn::loss::cross_entropy;
use varformer_nn::module::{prefixed, prefixed_mut};
use varformer_nn::{serialization, Dropout, Embedding, Module};

use crate::block::{AttentionUnit, MlpUnit};
use crate::config::ModelConfig;
use crate::registry::registry;
use crate::sharing::SharedLayout;
use crate::variants::{Normalization, SoftmaxVariant};

/// Peak bf16 throughput of an A100, the reference for MFU.
pub const PEAK_FLOPS: f64 = 312e12;

/// Optimizer partition: tensors with two or more dims get weight decay.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ParamGroups {
    pub decay: Vec<String>,
    pub no_decay: Vec<String>,
    pub num_decay_params: usize,
    pub num_no_decay_params: usize,
}

/// Resolved layout of one layer position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LayerSummary {
    pub layer: usize,
    pub attn_slot: usize,
    pub mlp_slot: usize,
    pub mlp_kind: &'static str,
    pub norm: &'static str,
    pub softmax: &'static str,
    pub position: &'static str,
    pub rotator: Option<&'static str>,
    pub n_kv_groups: usize,
    pub n_query_sets: usize,
    pub fused_attention: bool,
}

#[allow(clippy::upper_case_acronyms)]
pub struct GPT {
    config: ModelConfig,
    wte: Embedding,
    wpe: Option<Embedding>,
    drop: Dropout,
    attn_layout: SharedLayout,
    mlp_layout: SharedLayout,
    attn_units: Vec<AttentionUnit>,
    mlp_units: Vec<MlpUnit>,
    ln_f: Box<dyn Normalization>,
    output_softmax: Box<dyn SoftmaxVariant>,
    training: bool,
}

impl GPT {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let reg = registry();

        let wte = Embedding::with_rng(config.vocab_size, config.n_embd, INIT_STD, &mut rng);
        let wpe = config
            .use_abs_pos_embeddings
            .then(|| Embedding::with_rng(config.block_size, config.n_embd, INIT_STD, &mut rng));

        let attn_layout = SharedLayout::new(config.n_layer, config.shared_attn_size, config.shared_attn_sym)?;
        let mlp_layout = SharedLayout::new(config.n_layer, config.shared_mlp_size, config.shared_mlp_sym)?;
        let attn_units = (0..attn_layout.arena_len)
            .map(|_| AttentionUnit::new(&config, &mut rng))
            .collect::<Result<Vec<_>>>()?;
        let mlp_units = (0..mlp_layout.arena_len)
            .map(|slot| {
                let layer = mlp_layout.first_use(slot).unwrap_or(slot);
                MlpUnit::new(&config, config.is_moe_layer(layer), &mut rng)
            })
            .collect::<Result<Vec<_>>>()?;

        let model = Self {
            ln_f: reg.normalization(&config.norm_variant_output, config.n_embd, &config)?,
            output_softmax: reg.softmax(&config.softmax_variant_output, &config)?,
            drop: Dropout::with_seed(config.dropout, rng.next_u64())?,
            config,
            wte,
            wpe,
            attn_layout,
            mlp_layout,
            attn_units,
            mlp_units,
            training: true,
        };
        info!(
            n_layer = model.config.n_layer,
            n_embd = model.config.n_embd,
            attn_instances = model.attn_units.len(),
            mlp_instances = model.mlp_units.len(),
            params = model.num_params(true),
            "built GPT"
        );
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn attn_layout(&self) -> &SharedLayout {
        &self.attn_layout
    }

    pub fn mlp_layout(&self) -> &SharedLayout {
        &self.mlp_layout
    }

    pub fn attention_unit(&self, slot: usize) -> Option<&AttentionUnit> {
        self.attn_units.get(slot)
    }

    pub fn mlp_unit(&self, slot: usize) -> Option<&MlpUnit> {
        self.mlp_units.get(slot)
    }

    fn check_batch(&self, idx: &[Vec<usize>]) -> Result<(usize, usize)> {
        let b = idx.len();
        let t = idx.first().map_or(0, Vec::len);
        if b == 0 || t == 0 || idx.iter().any(|row| row.len() != t) {
            return Err(VarError::contract("token batch must be non-empty and rectangular"));
        }
        if t > self.config.block_size {
            return Err(VarError::contract(format!(
                "cannot forward sequence of length {t}, block size is only {}",
                self.config.block_size
            )));
        }
        Ok((b, t))
    }

    /// Final hidden states `[B, T, C]` plus the summed mixture balancing loss.
    fn hidden_states(&self, idx: &[Vec<usize>]) -> Result<(Tensor, Option<Tensor>)> {
        let (b, t) = self.check_batch(idx)?;
        let c = self.config.n_embd as isize;
        let flat: Vec<usize> = idx.iter().flatten().copied().collect();
        let mut x = self.wte.lookup(&flat)?.reshape(&[b as isize, t as isize, c])?;
        if let Some(wpe) = &self.wpe {
            let positions: Vec<usize> = (0..t).collect();
            x = x.add(&wpe.lookup(&positions)?)?;
        }
        x = self.drop.forward(&x)?;

        let post_ln = self.config.use_post_ln;
        let mut aux: Option<Tensor> = None;
        for layer in 0..self.config.n_layer {
            let attn = &self.attn_units[self.attn_layout.indices[layer]];
            x = attn.residual(&x, post_ln)?;
            let mlp = &self.mlp_units[self.mlp_layout.indices[layer]];
            let (y, layer_aux) = mlp.residual(&x, post_ln)?;
            x = y;
            if let Some(l) = layer_aux {
                aux = Some(match aux {
                    Some(total) => total.add(&l)?,
                    None => l,
                });
            }
        }
        Ok((self.ln_f.forward(&x)?, aux))
    }

    /// Tied output projection.
    fn lm_head(&self, x: &Tensor) -> Result<Tensor> {
        linear(x, self.wte.weight(), None)
    }

    /// Logits for every position plus the training loss when `targets` are given,
    /// otherwise logits `[B, 1, V]` for the last position only.
    pub fn forward(&self, idx: &[Vec<usize>], targets: Option<&[Vec<usize>]>) -> Result<(Tensor, Option<Tensor>)> {
        let (hidden, aux) = self.hidden_states(idx)?;
        let (b, t) = (idx.len(), idx[0].len());
        let Some(targets) = targets else {
            let last = hidden.narrow(1, t - 1, 1)?;
            return Ok((self.lm_head(&last)?, None));
        };
        if targets.len() != b || targets.iter().any(|row| row.len() != t) {
            return Err(VarError::contract("targets must have the same shape as the input tokens"));
        }
        let logits = self.lm_head(&hidden)?;
        let flat: Vec<usize> = targets.iter().flatten().copied().collect();
        let v = self.config.vocab_size as isize;
        let mut loss = cross_entropy(&logits.reshape(&[-1, v])?, &flat)?;
        if let Some(aux) = aux {
            loss = loss.add(&aux)?;
        }
        Ok((logits, Some(loss)))
    }

    /// Count of distinct parameter elements; shared and tied tensors count once.
    pub fn num_params(&self, non_embedding: bool) -> usize {
        let total = self.num_parameters();
        match (&self.wpe, non_embedding) {
            (Some(wpe), true) => total - wpe.weight().numel(),
            _ => total,
        }
    }

    pub fn param_groups(&self) -> ParamGroups {
        let mut groups = ParamGroups::default();
        for (name, p) in self.named_parameters() {
            if p.ndim() >= 2 {
                groups.num_decay_params += p.numel();
                groups.decay.push(name);
            } else {
                groups.num_no_decay_params += p.numel();
                groups.no_decay.push(name);
            }
        }
        groups
    }

    pub fn layer_summary(&self) -> Vec<LayerSummary> {
        (0..self.config.n_layer)
            .map(|layer| {
                let attn_slot = self.attn_layout.indices[layer];
                let mlp_slot = self.mlp_layout.indices[layer];
                let unit = &self.attn_units[attn_slot];
                let attn = unit.attention();
                LayerSummary {
                    layer,
                    attn_slot,
                    mlp_slot,
                    mlp_kind: self.mlp_units[mlp_slot].kind(),
                    norm: unit.norm_name(),
                    softmax: attn.softmax_name(),
                    position: attn.position().name(),
                    rotator: attn.position().rotator(),
                    n_kv_groups: attn.n_kv_groups(),
                    n_query_sets: attn.n_query_sets(),
                    fused_attention: attn.uses_fused_path(),
                }
            })
            .collect()
    }

    /// Apply a checkpoint. Names and shapes must match exactly.
    pub fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let expected: Vec<(String, Vec<usize>)> = self
            .named_parameters()
            .into_iter()
            .map(|(name, t)| (name, t.dims().to_vec()))
            .collect();
        let known: HashSet<&str> = expected.iter().map(|(n, _)| n.as_str()).collect();

        let mut problems = Vec::new();
        for (name, dims) in &expected {
            match state.get(name) {
                None => problems.push(format!("missing '{name}'")),
                Some(t) if t.dims() != dims.as_slice() => problems.push(format!(
                    "'{name}' has shape {:?}, expected {dims:?}",
                    t.dims()
                )),
                Some(_) => {}
            }
        }
        for name in state.keys().filter(|n| !known.contains(n.as_str())) {
            problems.push(format!("unexpected '{name}'"));
        }
        if !problems.is_empty() {
            problems.sort();
            return Err(VarError::Checkpoint(problems.join("; ")));
        }

        for (name, param) in self.named_parameters_mut() {
            if let Some(src) = state.get(&name) {
                param.copy_from(src)?;
            }
        }
        info!(tensors = expected.len(), "loaded state dict");
        Ok(())
    }

    pub fn load_safetensors(&mut self, path: &Path) -> Result<()> {
        let state = serialization::load_state_dict(path)?;
        self.load_state_dict(&state)
    }

    pub fn save_safetensors(&self, path: &Path) -> Result<()> {
        serialization::save_module(self, path)
    }

    /// Shrink the context window, e.g. to run a checkpoint with a smaller block size.
    pub fn crop_block_size(&mut self, block_size: usize) -> Result<()> {
        if block_size == 0 || block_size > self.config.block_size {
            return Err(VarError::config(format!(
                "block size can only shrink: {} -> {block_size}",
                self.config.block_size
            )));
        }
        self.config.block_size = block_size;
        if let Some(wpe) = &mut self.wpe {
            wpe.truncate(block_size)?;
        }
        for unit in &mut self.attn_units {
            unit.attention_mut().crop_positions(block_size);
        }
        info!(block_size, "cropped block size");
        Ok(())
    }

    /// Sample `max_new_tokens` continuations of every row.
    ///
    /// Logits are divided by `temperature`, optionally limited to the `top_k` largest,
    /// normalized by the output softmax variant and sampled. Dropout stays as set by
    /// [`Module::train`].
    pub fn generate<R: Rng + ?Sized>(
        &self,
        idx: &[Vec<usize>],
        max_new_tokens: usize,
        temperature: f32,
        top_k: Option<usize>,
        rng: &mut R,
    ) -> Result<Vec<Vec<usize>>> {
        if temperature <= 0.0 || !temperature.is_finite() {
            return Err(VarError::contract(format!("temperature must be positive, got {temperature}")));
        }
        let _guard = NoGradGuard::new();
        let vocab = self.config.vocab_size;
        let mut seqs = idx.to_vec();
        for _ in 0..max_new_tokens {
            let context: Vec<Vec<usize>> = seqs
                .iter()
                .map(|s| s[s.len().saturating_sub(self.config.block_size)..].to_vec())
                .collect();
            let (logits, _) = self.forward(&context, None)?;
            let mut logits = logits
                .reshape(&[seqs.len() as isize, vocab as isize])?
                .mul_scalar(1.0 / temperature)?;
            if let Some(k) = top_k {
                logits = keep_top_k(&logits, k.clamp(1, vocab))?;
            }
            let probs = self.output_softmax.forward(&logits)?;
            for (row, seq) in probs.as_f32_slice().chunks(vocab).zip(seqs.iter_mut()) {
                seq.push(sample(row, rng));
            }
        }
        Ok(seqs)
    }

    /// Model FLOPs utilization against [`PEAK_FLOPS`] (PaLM appendix B estimate).
    pub fn estimate_mfu(&self, fwdbwd_per_iter: usize, dt: f64) -> f64 {
        let n = self.num_params(true) as f64;
        let cfg = &self.config;
        let (l, h, q, t) = (
            cfg.n_layer as f64,
            (cfg.n_head * cfg.n_query_sets) as f64,
            cfg.head_dim() as f64,
            cfg.block_size as f64,
        );
        let flops_per_token = 6.0 * n + 12.0 * l * h * q * t;
        let flops_per_iter = flops_per_token * t * fwdbwd_per_iter as f64;
        flops_per_iter / dt / PEAK_FLOPS
    }
}

/// Mask everything below the `k`-th largest logit of each row with `-inf`.
fn keep_top_k(logits: &Tensor, k: usize) -> Result<Tensor> {
    let cols = logits.shape().last_dim();
    let data = logits.as_f32_slice();
    let mut mask = Vec::with_capacity(data.len());
    for (row, top) in data.chunks(cols).zip(logits.topk_last(k)?) {
        let kth = top.last().map_or(f32::NEG_INFINITY, |&i| row[i]);
        mask.extend(row.iter().map(|&v| if v < kth { 1.0 } else { 0.0 }));
    }
    logits.masked_fill(&Tensor::from_vec(mask, logits.dims())?, f32::NEG_INFINITY)
}

/// Draw an index proportionally to the non-negative weights in `row`.
fn sample<R: Rng + ?Sized>(row: &[f32], rng: &mut R) -> usize {
    let total: f32 = row.iter().filter(|p| p.is_finite() && **p > 0.0).sum();
    if total <= 0.0 || !total.is_finite() {
        return row
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
            .0;
    }
    let mut r = rng.gen::<f32>() * total;
    let mut last = 0;
    for (i, &p) in row.iter().enumerate() {
        if !(p.is_finite() && p > 0.0) {
            continue;
        }
        last = i;
        if r < p {
            return i;
        }
        r -= p;
    }
    last
}

impl Module for GPT {
    /// Token ids stored as floats `[B, T]` to logits `[B, T, V]`.
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if input.ndim() != 2 {
            return Err(VarError::ShapeMismatch {
                expected: vec![0, 0],
                got: input.dims().to_vec(),
            });
        }
        let t = input.dims()[1];
        let idx: Vec<Vec<usize>> = input
            .as_f32_slice()
            .chunks(t.max(1))
            .map(|row| row.iter().map(|&v| v as usize).collect())
            .collect();
        let (hidden, _) = self.hidden_states(&idx)?;
        self.lm_head(&hidden)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("wte", self.wte.named_parameters());
        if let Some(wpe) = &self.wpe {
            params.extend(prefixed("wpe", wpe.named_parameters()));
        }
        for (j, unit) in self.attn_units.iter().enumerate() {
            params.extend(prefixed(&format!("attn.{j}"), unit.named_parameters()));
        }
        for (j, unit) in self.mlp_units.iter().enumerate() {
            params.extend(prefixed(&format!("mlp.{j}"), unit.named_parameters()));
        }
        params.extend(prefixed("ln_f", self.ln_f.named_parameters()));
        params.extend(prefixed("output_softmax", self.output_softmax.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("wte", self.wte.named_parameters_mut());
        if let Some(wpe) = &mut self.wpe {
            params.extend(prefixed_mut("wpe", wpe.named_parameters_mut()));
        }
        for (j, unit) in self.attn_units.iter_mut().enumerate() {
            params.extend(prefixed_mut(&format!("attn.{j}"), unit.named_parameters_mut()));
        }
        for (j, unit) in self.mlp_units.iter_mut().enumerate() {
            params.extend(prefixed_mut(&format!("mlp.{j}"), unit.named_parameters_mut()));
        }
        params.extend(prefixed_mut("ln_f", self.ln_f.named_parameters_mut()));
        params.extend(prefixed_mut("output_softmax", self.output_softmax.named_parameters_mut()));
        params
    }

    fn train(&mut self, mode: bool) {
        self.training = mode;
        self.drop.train(mode);
        self.attn_units.iter_mut().for_each(|u| u.train(mode));
        self.mlp_units.iter_mut().for_each(|u| u.train(mode));
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> ModelConfig {
        ModelConfig {
            n_embd: 16,
            n_head: 2,
            n_layer: 2,
            block_size: 8,
            vocab_size: 20,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_forward_shapes_and_loss() {
        let model = GPT::new(tiny()).unwrap();
        let idx = vec![vec![1, 2, 3], vec![4, 5, 6]];
        let (logits, loss) = model.forward(&idx, None).unwrap();
        assert_eq!(logits.dims(), &[2, 1, 20]);
        assert!(loss.is_none());

        let targets = vec![vec![2, 3, 4], vec![5, 6, 7]];
        let (logits, loss) = model.forward(&idx, Some(&targets)).unwrap();
        assert_eq!(logits.dims(), &[2, 3, 20]);
        // untrained model is close to uniform
        let loss = loss.unwrap().item().unwrap();
        assert!((loss - 20f32.ln()).abs() < 0.5, "{loss}");
    }

    #[test]
    fn test_rejects_bad_batches() {
        let model = GPT::new(tiny()).unwrap();
        assert!(model.forward(&[vec![1; 9]], None).is_err());
        assert!(model.forward(&[vec![1, 2], vec![3]], None).is_err());
        assert!(model.forward(&[vec![25]], None).is_err());
        assert!(model.forward(&[vec![1, 2]], Some(&[vec![1]])).is_err());
    }

    #[test]
    fn test_weight_tying_and_param_counts() {
        let config = ModelConfig {
            use_abs_pos_embeddings: true,
            ..tiny()
        };
        let model = GPT::new(config).unwrap();
        let names: Vec<String> = model.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert!(!names.iter().any(|n| n.contains("lm_head")));
        assert_eq!(model.num_params(false) - model.num_params(true), 8 * 16);

        let groups = model.param_groups();
        assert!(groups.decay.contains(&"wte.weight".to_string()));
        assert!(groups.no_decay.contains(&"ln_f.weight".to_string()));
        assert_eq!(groups.num_decay_params + groups.num_no_decay_params, model.num_params(false));
    }

    #[test]
    fn test_residual_projections_use_scaled_init() {
        let config = ModelConfig {
            n_embd: 64,
            n_layer: 8,
            ..tiny()
        };
        let model = GPT::new(config).unwrap();
        let std = |name: &str| {
            let (_, t) = model
                .named_parameters()
                .into_iter()
                .find(|(n, _)| n == name)
                .unwrap();
            let v = t.to_vec();
            (v.iter().map(|x| x * x).sum::<f32>() / v.len() as f32).sqrt()
        };
        assert!((std("attn.0.q_proj.weight") - 0.02).abs() < 0.003);
        assert!((std("attn.0.c_proj.weight") - 0.005).abs() < 0.001);
        assert!((std("mlp.0.c_proj.weight") - 0.005).abs() < 0.001);
    }

    #[test]
    fn test_generate_extends_and_crops() {
        let mut model = GPT::new(tiny()).unwrap();
        model.train(false);
        let mut rng = StdRng::seed_from_u64(0);
        let out = model.generate(&[vec![1, 2]], 10, 0.8, Some(3), &mut rng).unwrap();
        assert_eq!(out[0].len(), 12);
        assert_eq!(&out[0][..2], &[1, 2]);
        assert!(out[0].iter().all(|&t| t < 20));
        assert!(model.generate(&[vec![1]], 1, 0.0, None, &mut rng).is_err());

        model.crop_block_size(4).unwrap();
        assert_eq!(model.config().block_size, 4);
        assert!(model.forward(&[vec![1; 5]], None).is_err());
        assert!(model.forward(&[vec![1; 4]], None).is_ok());
        assert!(model.crop_block_size(6).is_err());
    }

    #[test]
    fn test_top_k_masks_all_but_k() {
        let logits = Tensor::from_f32(&[1.0, 5.0, 3.0, 2.0], &[1, 4]);
        let kept = keep_top_k(&logits, 2).unwrap().to_vec();
        assert_eq!(kept[1], 5.0);
        assert_eq!(kept[2], 3.0);
        assert!(kept[0].is_infinite() && kept[3].is_infinite());
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            assert!(matches!(sample(&[0.0, 0.5, 0.5, 0.0], &mut rng), 1 | 2));
        }
        assert_eq!(sample(&[0.0, 0.0], &mut rng), 0);
    }

    #[test]
    fn test_mfu_scales_inversely_with_time() {
        let model = GPT::new(tiny()).unwrap();
        let a = model.estimate_mfu(4, 1.0);
        let b = model.estimate_mfu(4, 2.0);
        assert!(a > 0.0 && (a / b - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_layer_summary_reports_sharing() {
        let config = ModelConfig {
            n_layer: 4,
            shared_attn_size: 2,
            shared_mlp_sym: true,
            use_moe: true,
            n_experts: 2,
            moe_top_k: 1,
            moe_layer_freq: 2,
            ..tiny()
        };
        let model = GPT::new(config).unwrap();
        let summary = model.layer_summary();
        let attn: Vec<usize> = summary.iter().map(|s| s.attn_slot).collect();
        let mlp: Vec<usize> = summary.iter().map(|s| s.mlp_slot).collect();
        assert_eq!(attn, vec![0, 0, 1, 1]);
        assert_eq!(mlp, vec![0, 1, 1, 0]);
        let kinds: Vec<&str> = summary.iter().map(|s| s.mlp_kind).collect();
        assert_eq!(kinds, vec!["moe", "dense", "dense", "moe"]);
        assert_eq!(summary[0].position, "rope");
    }
}
