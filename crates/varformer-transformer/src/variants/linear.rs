use rand::RngCore;
use varformer_core::Result;
use varformer_nn::quantize::Bits;
use varformer_nn::{BitLinear, Linear, Module, QuantizedLinear};

use crate::config::ModelConfig;
use crate::registry::registry;

/// A projection `[.., in] -> [.., out]` with `weight` (and optional `bias`) parameters.
pub trait LinearLayer: Module {
    fn name(&self) -> &'static str;
    fn in_features(&self) -> usize;
    fn out_features(&self) -> usize;
}

/// Shape and initialization of one projection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearSpec {
    pub in_features: usize,
    pub out_features: usize,
    pub bias: bool,
    pub std: f32,
}

impl LinearLayer for Linear {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn in_features(&self) -> usize {
        Linear::in_features(self)
    }

    fn out_features(&self) -> usize {
        Linear::out_features(self)
    }
}

impl LinearLayer for QuantizedLinear {
    fn name(&self) -> &'static str {
        "quantized"
    }

    fn in_features(&self) -> usize {
        self.weight().dims()[1]
    }

    fn out_features(&self) -> usize {
        self.weight().dims()[0]
    }
}

impl LinearLayer for BitLinear {
    fn name(&self) -> &'static str {
        "bitlinear"
    }

    fn in_features(&self) -> usize {
        self.weight().dims()[1]
    }

    fn out_features(&self) -> usize {
        self.weight().dims()[0]
    }
}

pub(crate) fn dense(spec: &LinearSpec, _: &ModelConfig, rng: &mut dyn RngCore) -> Result<Box<dyn LinearLayer>> {
    Ok(Box::new(Linear::with_rng(
        spec.in_features,
        spec.out_features,
        spec.bias,
        spec.std,
        rng,
    )))
}

pub(crate) fn quantized(spec: &LinearSpec, config: &ModelConfig, rng: &mut dyn RngCore) -> Result<Box<dyn LinearLayer>> {
    let bits = Bits::new(config.linear_quant_bits)?;
    let method = registry().quant_method(&config.quantization_method)?;
    let mut layer = QuantizedLinear::with_rng(spec.in_features, spec.out_features, spec.bias, bits, spec.std, rng)
        .with_method(method);
    if let Some(bits) = config.linear_quant_activation_bits {
        layer = layer.with_activation_bits(Bits::new(bits)?);
    }
    Ok(Box::new(layer))
}

pub(crate) fn bitlinear(spec: &LinearSpec, _: &ModelConfig, rng: &mut dyn RngCore) -> Result<Box<dyn LinearLayer>> {
    Ok(Box::new(BitLinear::with_rng(
        spec.in_features,
        spec.out_features,
        spec.bias,
        spec.std,
        rng,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use varformer_core::Tensor;
    use varformer_nn::quantize::{fake_quantize_with, QuantMethod};

    #[test]
    fn test_every_variant_projects_and_trains() {
        let spec = LinearSpec {
            in_features: 6,
            out_features: 3,
            bias: true,
            std: 0.2,
        };
        let cfg = ModelConfig::default();
        let mut rng = StdRng::seed_from_u64(8);
        for ctor in [dense, quantized, bitlinear] {
            let layer = ctor(&spec, &cfg, &mut rng).unwrap();
            assert_eq!((layer.in_features(), layer.out_features()), (6, 3));
            let y = layer.forward(&Tensor::ones(&[2, 4, 6])).unwrap();
            assert_eq!(y.dims(), &[2, 4, 3]);
            y.sum().unwrap().backward().unwrap();
            assert!(layer.parameters().iter().all(|p| p.grad().is_some()), "{}", layer.name());
        }
    }

    #[test]
    fn test_activation_bits_reach_the_quantized_layer() {
        let spec = LinearSpec {
            in_features: 6,
            out_features: 3,
            bias: false,
            std: 0.2,
        };
        let plain_cfg = ModelConfig {
            quantization_method: "nearest".into(),
            ..ModelConfig::default()
        };
        let act_cfg = ModelConfig {
            linear_quant_activation_bits: Some(2),
            ..plain_cfg.clone()
        };
        let plain = quantized(&spec, &plain_cfg, &mut StdRng::seed_from_u64(9)).unwrap();
        let with_act = quantized(&spec, &act_cfg, &mut StdRng::seed_from_u64(9)).unwrap();

        let x = Tensor::from_f32(&[0.9, -0.33, 0.1, 0.57, -0.71, 0.05], &[1, 6]);
        let (xq, _) = fake_quantize_with(&x, Bits::new(2).unwrap(), QuantMethod::Nearest, &mut StdRng::seed_from_u64(0));
        assert_ne!(xq.to_vec(), x.to_vec());
        assert_eq!(with_act.forward(&x).unwrap().to_vec(), plain.forward(&xq).unwrap().to_vec());
        assert_ne!(with_act.forward(&x).unwrap().to_vec(), plain.forward(&x).unwrap().to_vec());
    }
}
