//! Mixture-of-experts MLP: a linear router picks `k` experts per token, each expert
//! runs only on the tokens that chose it, and the gated outputs are summed back.

use parking_lot::Mutex;
use rand::RngCore;
use tracing::debug;
use varformer_core::{Result, Tensor, VarError};
use varformer_nn::linear::INIT_STD;
use varformer_nn::module::{prefixed, prefixed_mut};
use varformer_nn::{Linear, Module};

use crate::config::ModelConfig;
use crate::feed_forward::Mlp;
use crate::registry::registry;
use crate::variants::Router;

/// Routing result for `N` tokens.
#[derive(Debug)]
pub struct RouterDecision {
    /// Per token, ranked `(expert, slot)` pairs; `slot` indexes `weights`.
    pub selections: Vec<Vec<(usize, usize)>>,
    /// Gate weight per slot, flat.
    pub weights: Tensor,
    /// Full router distribution `[N, E]`, used by the balancing loss.
    pub probs: Tensor,
}

impl RouterDecision {
    pub fn num_tokens(&self) -> usize {
        self.selections.len()
    }

    /// Tokens routed to `expert` and the slots carrying their gates.
    pub fn expert_tokens(&self, expert: usize) -> (Vec<usize>, Vec<usize>) {
        let mut tokens = Vec::new();
        let mut slots = Vec::new();
        for (t, picks) in self.selections.iter().enumerate() {
            for &(e, slot) in picks {
                if e == expert {
                    tokens.push(t);
                    slots.push(slot);
                }
            }
        }
        (tokens, slots)
    }

    /// Number of routed slots per expert.
    pub fn load(&self, n_experts: usize) -> Vec<usize> {
        let mut counts = vec![0; n_experts];
        for &(e, _) in self.selections.iter().flatten() {
            if e < n_experts {
                counts[e] += 1;
            }
        }
        counts
    }
}

/// `out[t] = sum over (e, slot) in selections[t] of weights[slot] * experts[e](x[t])`.
///
/// `x` is `[N, C]`; each expert must map `[n, C] -> [n, C]`. Tokens without a
/// selection get a zero row.
pub fn dispatch<E: Module>(x: &Tensor, decision: &RouterDecision, experts: &[E]) -> Result<Tensor> {
    if x.ndim() != 2 || x.dims()[0] != decision.num_tokens() {
        return Err(VarError::contract(format!(
            "dispatch expects [{}, C] tokens, got {:?}",
            decision.num_tokens(),
            x.dims()
        )));
    }
    if let Some(&(bad, _)) = decision.selections.iter().flatten().find(|(e, _)| *e >= experts.len()) {
        return Err(VarError::IndexOutOfRange {
            index: bad,
            size: experts.len(),
        });
    }
    let mut out = Tensor::zeros(x.dims());
    for (e, expert) in experts.iter().enumerate() {
        let (tokens, slots) = decision.expert_tokens(e);
        if tokens.is_empty() {
            continue;
        }
        let gates = decision
            .weights
            .index_select(0, &slots)?
            .reshape(&[tokens.len() as isize, 1])?;
        let y = expert.forward(&x.index_select(0, &tokens)?)?.mul(&gates)?;
        out = out.index_add(0, &tokens, &y)?;
    }
    Ok(out)
}

/// Load-balancing loss `coef * E * sum_e f_e * P_e`.
///
/// `f_e` is the fraction of routed slots that went to expert `e` (no gradient) and
/// `P_e` the mean router probability of `e` over tokens.
pub fn aux_loss(decision: &RouterDecision, coef: f32) -> Result<Tensor> {
    let (n, e) = (decision.probs.dims()[0], decision.probs.dims()[1]);
    let load = decision.load(e);
    let total: usize = load.iter().sum();
    if n == 0 || total == 0 {
        return Ok(Tensor::scalar(0.0));
    }
    let fraction: Vec<f32> = load.iter().map(|&c| c as f32 / total as f32).collect();
    let mean_prob = Tensor::full(&[1, n], 1.0 / n as f32).matmul(&decision.probs)?;
    mean_prob
        .mul(&Tensor::from_f32(&fraction, &[e]))?
        .sum()?
        .mul_scalar(coef * e as f32)
}

pub struct MoeLayer {
    router_proj: Linear,
    router: Box<dyn Router>,
    experts: Vec<Mlp>,
    top_k: usize,
    aux_loss_coef: f32,
    load: Mutex<Vec<u64>>,
}

impl MoeLayer {
    pub fn new(config: &ModelConfig, rng: &mut dyn RngCore) -> Result<Self> {
        let router = registry().router(&config.moe_router_scheme)?;
        let experts = (0..config.n_experts)
            .map(|_| Mlp::new(config, rng))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            experts = config.n_experts,
            top_k = config.moe_top_k,
            router = router.name(),
            "built mixture of experts"
        );
        Ok(Self {
            router_proj: Linear::with_rng(config.n_embd, config.n_experts, false, INIT_STD, rng),
            router,
            experts,
            top_k: config.moe_top_k,
            aux_loss_coef: config.moe_aux_loss_coef,
            load: Mutex::new(vec![0; config.n_experts]),
        })
    }

    pub fn n_experts(&self) -> usize {
        self.experts.len()
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn router_name(&self) -> &'static str {
        self.router.name()
    }

    pub fn experts(&self) -> &[Mlp] {
        &self.experts
    }

    /// Tokens routed to each expert since construction.
    pub fn expert_load(&self) -> Vec<u64> {
        self.load.lock().clone()
    }

    pub fn route(&self, tokens: &Tensor) -> Result<RouterDecision> {
        let logits = self.router_proj.forward(tokens)?;
        self.router.route(&logits, self.top_k)
    }

    /// Output with the same shape as `x: [.., C]`, plus the balancing loss.
    pub fn forward_with_aux(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let width = x.shape().last_dim() as isize;
        let tokens = x.reshape(&[-1, width])?;
        let decision = self.route(&tokens)?;
        {
            let mut load = self.load.lock();
            for (slot, n) in load.iter_mut().zip(decision.load(self.experts.len())) {
                *slot += n as u64;
            }
        }
        let y = dispatch(&tokens, &decision, &self.experts)?;
        let aux = aux_loss(&decision, self.aux_loss_coef)?;
        let dims: Vec<isize> = x.dims().iter().map(|&d| d as isize).collect();
        Ok((y.reshape(&dims)?, aux))
    }
}

impl Module for MoeLayer {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.forward_with_aux(x)?.0)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("router", self.router_proj.named_parameters());
        for (e, expert) in self.experts.iter().enumerate() {
            params.extend(prefixed(&format!("experts.{e}"), expert.named_parameters()));
        }
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("router", self.router_proj.named_parameters_mut());
        for (e, expert) in self.experts.iter_mut().enumerate() {
            params.extend(prefixed_mut(&format!("experts.{e}"), expert.named_parameters_mut()));
        }
        params
    }

    fn train(&mut self, mode: bool) {
        self.experts.iter_mut().for_each(|e| e.train(mode));
    }

    fn is_training(&self) -> bool {
        self.experts.first().is_some_and(|e| e.is_training())
    }
}
