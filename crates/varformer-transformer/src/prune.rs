//! Global magnitude pruning of weight tensors.

use serde::Serialize;
use tracing::info;
use varformer_core::{Result, VarError};
use varformer_nn::Module;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PruneReport {
    pub threshold: f32,
    pub pruned: usize,
    pub total: usize,
    pub tensors: usize,
}

impl PruneReport {
    pub fn sparsity(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.pruned as f32 / self.total as f32
        }
    }
}

/// `q`-th percentile (0..=100) with linear interpolation between closest ranks.
fn percentile(sorted: &[f32], q: f32) -> f32 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = q / 100.0 * (n - 1) as f32;
            let lo = rank.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            let frac = rank - lo as f32;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

/// Zero every weight whose magnitude falls below the `rate`-th percentile of
/// |w| taken over all parameters with "weight" in their name.
pub fn magnitude_prune(module: &mut dyn Module, rate: f32) -> Result<PruneReport> {
    if !(0.0..=100.0).contains(&rate) {
        return Err(VarError::config(format!("prune rate must be in [0, 100], got {rate}")));
    }
    let mut magnitudes: Vec<f32> = module
        .named_parameters()
        .into_iter()
        .filter(|(name, _)| name.contains("weight"))
        .flat_map(|(_, t)| t.as_f32_slice().iter().map(|v| v.abs()).collect::<Vec<_>>())
        .collect();
    magnitudes.sort_by(f32::total_cmp);
    let threshold = percentile(&magnitudes, rate);

    let mut report = PruneReport {
        threshold,
        pruned: 0,
        total: magnitudes.len(),
        tensors: 0,
    };
    for (_, param) in module
        .named_parameters_mut()
        .into_iter()
        .filter(|(name, _)| name.contains("weight"))
    {
        let mut pruned = 0;
        param.update_data(|data| {
            for v in data.iter_mut().filter(|v| v.abs() < threshold) {
                *v = 0.0;
                pruned += 1;
            }
        });
        report.pruned += pruned;
        report.tensors += 1;
    }
    info!(threshold, pruned = report.pruned, total = report.total, "magnitude prune");
    Ok(report)
}
