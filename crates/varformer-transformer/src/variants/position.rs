use varformer_attention::RotaryEmbedding;
use varformer_core::{Result, Tensor};

use crate::config::ModelConfig;
use crate::registry::registry;

/// Position information applied to per-head queries and keys `[B, H, T, D]`.
pub trait PositionEncoding: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, x: &Tensor) -> Result<Tensor>;

    /// Drop positions at or beyond `positions`.
    fn crop(&mut self, _positions: usize) {}

    /// Rotator behind the encoding, if any.
    fn rotator(&self) -> Option<&'static str> {
        None
    }
}

/// Leaves queries and keys untouched.
pub struct NoPositionEncoding;

impl PositionEncoding for NoPositionEncoding {
    fn name(&self) -> &'static str {
        "none"
    }

    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.clone())
    }
}

impl PositionEncoding for RotaryEmbedding {
    fn name(&self) -> &'static str {
        if self.max_positions().is_some() {
            "rope"
        } else {
            "shortrope"
        }
    }

    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        RotaryEmbedding::apply(self, x)
    }

    fn crop(&mut self, positions: usize) {
        RotaryEmbedding::crop(self, positions);
    }

    fn rotator(&self) -> Option<&'static str> {
        Some(self.rotator_name())
    }
}

pub(crate) fn none(_: &ModelConfig) -> Result<Box<dyn PositionEncoding>> {
    Ok(Box::new(NoPositionEncoding))
}

pub(crate) fn rope(config: &ModelConfig) -> Result<Box<dyn PositionEncoding>> {
    let rotator = registry().rotator(&config.rotator_variant, config)?;
    Ok(Box::new(RotaryEmbedding::new(
        config.head_dim(),
        config.block_size,
        config.rope_base,
        rotator.as_ref(),
    )?))
}

pub(crate) fn shortrope(config: &ModelConfig) -> Result<Box<dyn PositionEncoding>> {
    let rotator = registry().rotator(&config.rotator_variant, config)?;
    Ok(Box::new(RotaryEmbedding::short(
        config.head_dim(),
        config.shortrope_length,
        config.rope_base,
        rotator.as_ref(),
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ModelConfig {
        ModelConfig {
            n_embd: 16,
            n_head: 2,
            block_size: 6,
            rotator_variant: "cordic".into(),
            shortrope_length: 4,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_rope_names_and_rotator() {
        let r = rope(&cfg()).unwrap();
        assert_eq!(r.name(), "rope");
        assert_eq!(r.rotator(), Some("cordic"));
        assert_eq!(shortrope(&cfg()).unwrap().name(), "shortrope");
        assert_eq!(none(&cfg()).unwrap().rotator(), None);
    }

    #[test]
    fn test_crop_limits_positions() {
        let mut r = rope(&cfg()).unwrap();
        let x = Tensor::ones(&[1, 2, 5, 8]);
        assert_eq!(r.apply(&x).unwrap().dims(), &[1, 2, 5, 8]);
        r.crop(4);
        assert!(r.apply(&x).is_err());
        // periodic variant has no upper bound
        let s = shortrope(&cfg()).unwrap();
        assert!(s.apply(&Tensor::ones(&[1, 1, 9, 8])).is_ok());
    }
}
