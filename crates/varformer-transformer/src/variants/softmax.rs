//! Normalizers for attention scores and output logits.
//!
//! All variants work on the last axis and map `-inf` (masked) entries to zero.
//! Only `softmax`, `softermax` and `strongermax` produce rows that sum to one;
//! the sampler renormalizes the others.

use std::f32::consts::LN_2;

use varformer_core::{Result, Tensor, VarError};
use varformer_nn::activations::sigmoid;
use varformer_nn::quantize::{fake_quantize_with, Bits, QuantMethod};
use varformer_nn::Module;

use crate::config::ModelConfig;
use crate::registry::registry;

pub trait SoftmaxVariant: Module {
    fn name(&self) -> &'static str;

    /// Plain exponential softmax, eligible for the fused attention kernel.
    fn is_standard(&self) -> bool {
        false
    }
}

macro_rules! stateless {
    ($ty:ident) => {
        impl Module for $ty {
            fn forward(&self, input: &Tensor) -> Result<Tensor> {
                self.normalize(input)
            }

            fn named_parameters(&self) -> Vec<(String, &Tensor)> {
                Vec::new()
            }

            fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
                Vec::new()
            }
        }
    };
}

pub struct Softmax;

impl Softmax {
    fn normalize(&self, x: &Tensor) -> Result<Tensor> {
        x.softmax()
    }
}

stateless!(Softmax);

impl SoftmaxVariant for Softmax {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn is_standard(&self) -> bool {
        true
    }
}

/// Base-2 softmax.
pub struct Softermax {
    use_xmax: bool,
}

impl Softermax {
    fn normalize(&self, x: &Tensor) -> Result<Tensor> {
        let scaled = x.mul_scalar(LN_2)?;
        if self.use_xmax {
            scaled.softmax()
        } else {
            let num = scaled.exp()?;
            num.div(&num.sum_last_keepdim()?)
        }
    }
}

stateless!(Softermax);

impl SoftmaxVariant for Softermax {
    fn name(&self) -> &'static str {
        "softermax"
    }
}

/// `base^(x - beta) / gamma` with learnable scalars.
///
/// The quantized form fake-quantizes the exponent `x - beta` before raising the
/// base; masked (`-inf`) entries stay masked.
pub struct Constantmax {
    beta: Tensor,
    gamma: Tensor,
    ln_base: f32,
    exponent_quant: Option<(Bits, QuantMethod)>,
}

impl Constantmax {
    pub fn new(beta: f32, gamma: f32, base: Option<f32>) -> Result<Self> {
        if gamma == 0.0 {
            return Err(VarError::config("constantmax gamma must be non-zero"));
        }
        let ln_base = match base {
            Some(b) if b <= 0.0 || b == 1.0 => {
                return Err(VarError::config(format!("constantmax base must be positive and != 1, got {b}")))
            }
            Some(b) => b.ln(),
            None => 1.0,
        };
        Ok(Self {
            beta: Tensor::from_f32(&[beta], &[1]).with_requires_grad(),
            gamma: Tensor::from_f32(&[gamma], &[1]).with_requires_grad(),
            ln_base,
            exponent_quant: None,
        })
    }

    pub fn with_exponent_quantization(mut self, bits: Bits, method: QuantMethod) -> Self {
        self.exponent_quant = Some((bits, method));
        self
    }

    pub fn beta(&self) -> &Tensor {
        &self.beta
    }

    pub fn gamma(&self) -> &Tensor {
        &self.gamma
    }
}

impl Constantmax {
    fn quantize_exponent(&self, shifted: Tensor) -> Result<Tensor> {
        let Some((bits, method)) = self.exponent_quant else {
            return Ok(shifted);
        };
        let masked: Vec<f32> = shifted
            .as_f32_slice()
            .iter()
            .map(|&v| if v == f32::NEG_INFINITY { 1.0 } else { 0.0 })
            .collect();
        let mask = Tensor::from_f32(&masked, shifted.dims());
        let (q, _) = fake_quantize_with(&shifted, bits, method, &mut rand::thread_rng());
        q.masked_fill(&mask, f32::NEG_INFINITY)
    }
}

impl Module for Constantmax {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.quantize_exponent(x.sub(&self.beta)?)?
            .mul_scalar(self.ln_base)?
            .exp()?
            .div(&self.gamma)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        vec![("beta".into(), &self.beta), ("gamma".into(), &self.gamma)]
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        vec![("beta".into(), &mut self.beta), ("gamma".into(), &mut self.gamma)]
    }
}

impl SoftmaxVariant for Constantmax {
    fn name(&self) -> &'static str {
        if self.exponent_quant.is_some() {
            "constantmax_quan"
        } else {
            "constantmax"
        }
    }
}

/// Softmax with `strength` in place of `e`.
pub struct Strongermax {
    ln_strength: f32,
}

impl Strongermax {
    fn normalize(&self, x: &Tensor) -> Result<Tensor> {
        x.mul_scalar(self.ln_strength)?.softmax()
    }
}

stateless!(Strongermax);

impl SoftmaxVariant for Strongermax {
    fn name(&self) -> &'static str {
        "strongermax"
    }
}

/// Piecewise polynomial: flat, then linear, then `x^power`.
pub struct Polymax {
    x_intercept: f32,
    y_intercept: f32,
    power: f32,
    divisor: f32,
}

impl Polymax {
    pub fn new(x_intercept: f32, y_intercept: f32, power: f32, divisor: f32) -> Result<Self> {
        if x_intercept >= 0.0 || divisor == 0.0 {
            return Err(VarError::config(format!(
                "polymax needs x_intercept < 0 and a non-zero divisor (got {x_intercept}, {divisor})"
            )));
        }
        Ok(Self {
            x_intercept,
            y_intercept,
            power,
            divisor,
        })
    }

    fn normalize(&self, x: &Tensor) -> Result<Tensor> {
        let Self {
            x_intercept: xi,
            y_intercept: yi,
            power: p,
            divisor: d,
        } = *self;
        let slope = yi / -xi;
        x.map_with_derivative(
            "PolymaxBackward",
            move |v| {
                let y = if v < xi {
                    0.0
                } else if v <= 0.0 {
                    slope * (v - xi)
                } else {
                    v.powf(p) + yi
                };
                y / d
            },
            move |v, _| {
                let dy = if v < xi {
                    0.0
                } else if v <= 0.0 {
                    slope
                } else {
                    p * v.powf(p - 1.0)
                };
                dy / d
            },
        )
    }
}

stateless!(Polymax);

impl SoftmaxVariant for Polymax {
    fn name(&self) -> &'static str {
        "polymax"
    }
}

/// `b^x * sigmoid(x)`, normalized per row.
pub struct SigSoftmax {
    ln_base: f32,
}

impl SigSoftmax {
    fn normalize(&self, x: &Tensor) -> Result<Tensor> {
        // shifting by the row max leaves the ratio unchanged
        let shift = x.max_last_keepdim();
        let num = x
            .sub(&shift)?
            .mul_scalar(self.ln_base)?
            .exp()?
            .mul(&sigmoid(x)?)?;
        num.div(&num.sum_last_keepdim()?)
    }
}

stateless!(SigSoftmax);

impl SoftmaxVariant for SigSoftmax {
    fn name(&self) -> &'static str {
        "sigsoftmax"
    }
}

fn positive_ln(what: &str, base: f32) -> Result<f32> {
    if base <= 0.0 || base == 1.0 {
        return Err(VarError::config(format!("{what} must be positive and != 1, got {base}")));
    }
    Ok(base.ln())
}

pub(crate) fn softmax(_: &ModelConfig) -> Result<Box<dyn SoftmaxVariant>> {
    Ok(Box::new(Softmax))
}

pub(crate) fn softermax(config: &ModelConfig) -> Result<Box<dyn SoftmaxVariant>> {
    Ok(Box::new(Softermax {
        use_xmax: config.softermax_use_xmax,
    }))
}

pub(crate) fn constantmax(config: &ModelConfig) -> Result<Box<dyn SoftmaxVariant>> {
    let base = (!config.constantmax_use_euler_base).then_some(config.constantmax_base);
    Ok(Box::new(Constantmax::new(
        config.constantmax_initial_beta,
        config.constantmax_initial_gamma,
        base,
    )?))
}

pub(crate) fn constantmax_quan(config: &ModelConfig) -> Result<Box<dyn SoftmaxVariant>> {
    let base = (!config.constantmax_use_euler_base).then_some(config.constantmax_base);
    let method = registry().quant_method(&config.quantization_method)?;
    let layer = Constantmax::new(
        config.constantmax_initial_beta,
        config.constantmax_initial_gamma,
        base,
    )?
    .with_exponent_quantization(Bits::new(config.constantmax_quant_bits)?, method);
    Ok(Box::new(layer))
}

pub(crate) fn strongermax(config: &ModelConfig) -> Result<Box<dyn SoftmaxVariant>> {
    Ok(Box::new(Strongermax {
        ln_strength: positive_ln("strongermax_strength", config.strongermax_strength)?,
    }))
}

pub(crate) fn polymax(config: &ModelConfig) -> Result<Box<dyn SoftmaxVariant>> {
    Ok(Box::new(Polymax::new(
        config.polymax_x_intercept,
        config.polymax_y_intercept,
        config.polymax_power,
        config.polymax_divisor,
    )?))
}

pub(crate) fn sigsoftmax(config: &ModelConfig) -> Result<Box<dyn SoftmaxVariant>> {
    let ln_base = if config.sigsoftmax_use_euler_base {
        1.0
    } else {
        positive_ln("sigsoftmax_base", config.sigsoftmax_base)?
    };
    Ok(Box::new(SigSoftmax { ln_base }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use varformer_core::gradcheck::assert_gradient;

    impl std::fmt::Debug for dyn SoftmaxVariant {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.name())
        }
    }

    fn row() -> Tensor {
        Tensor::from_f32(&[0.5, -1.0, 2.0, f32::NEG_INFINITY], &[1, 4])
    }

    fn all(cfg: &ModelConfig) -> Vec<Box<dyn SoftmaxVariant>> {
        vec![
            softmax(cfg).unwrap(),
            softermax(cfg).unwrap(),
            constantmax(cfg).unwrap(),
            constantmax_quan(cfg).unwrap(),
            strongermax(cfg).unwrap(),
            polymax(cfg).unwrap(),
            sigsoftmax(cfg).unwrap(),
        ]
    }

    #[test]
    fn test_masked_entries_become_zero() {
        for v in all(&ModelConfig::default()) {
            let out = v.forward(&row()).unwrap().to_vec();
            assert_eq!(out[3], 0.0, "{}", v.name());
            assert!(out.iter().all(|p| p.is_finite() && *p >= 0.0), "{}: {out:?}", v.name());
        }
    }

    #[test]
    fn test_normalized_variants_sum_to_one() {
        let cfg = ModelConfig {
            softermax_use_xmax: false,
            ..ModelConfig::default()
        };
        for v in all(&cfg) {
            if matches!(v.name(), "constantmax" | "constantmax_quan" | "polymax") {
                continue;
            }
            let sum: f32 = v.forward(&row()).unwrap().to_vec().iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "{} sums to {sum}", v.name());
        }
    }

    #[test]
    fn test_known_values() {
        let x = Tensor::from_f32(&[0.0, 1.0], &[1, 2]);
        let soft = Softermax { use_xmax: true }.forward(&x).unwrap().to_vec();
        assert!((soft[0] - 1.0 / 3.0).abs() < 1e-6);

        let strong = Strongermax { ln_strength: 3f32.ln() }.forward(&x).unwrap().to_vec();
        assert!((strong[1] - 0.75).abs() < 1e-6);

        let poly = Polymax::new(-4.0, 1.0, 2.0, 2.0).unwrap();
        let y = poly.forward(&Tensor::from_f32(&[-5.0, -2.0, 0.0, 3.0], &[4])).unwrap().to_vec();
        assert_eq!(y, vec![0.0, 0.25, 0.5, 5.0]);

        let cm = Constantmax::new(1.0, 2.0, Some(2.0)).unwrap();
        let y = cm.forward(&Tensor::from_f32(&[3.0], &[1])).unwrap().to_vec();
        assert!((y[0] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_constantmax_scalars_are_trainable() {
        let cm = Constantmax::new(0.0, 1.0, None).unwrap();
        cm.forward(&row()).unwrap().sum().unwrap().backward().unwrap();
        assert!(cm.beta().grad().is_some());
        assert!(cm.gamma().grad().is_some());
        assert_eq!(cm.num_parameters(), 2);
    }

    #[test]
    fn test_quantized_constantmax_snaps_the_exponent() {
        let cfg = ModelConfig {
            constantmax_quant_bits: 2,
            quantization_method: "nearest".into(),
            ..ModelConfig::default()
        };
        let cm = constantmax_quan(&cfg).unwrap();
        assert_eq!(cm.name(), "constantmax_quan");
        // exponents 3, 1.4, -inf: scale 1, 1.4 rounds to 1
        let x = Tensor::from_f32(&[3.0, 1.4, f32::NEG_INFINITY], &[1, 3]);
        let y = cm.forward(&x).unwrap().to_vec();
        assert!((y[0] - 3f32.exp()).abs() < 1e-4, "{y:?}");
        assert!((y[1] - 1f32.exp()).abs() < 1e-5, "{y:?}");
        assert_eq!(y[2], 0.0);

        cm.forward(&x).unwrap().sum().unwrap().backward().unwrap();
        for (name, p) in cm.named_parameters() {
            assert!(p.grad().is_some(), "{name}");
        }
    }

    #[test]
    fn test_gradients() {
        let x0 = Tensor::from_f32(&[0.3, -0.7, 1.1, 0.2, -0.4, 0.9], &[2, 3]);
        let w = Tensor::from_f32(&[1.0, -2.0, 0.5, 0.7, 1.5, -1.0], &[2, 3]);
        let poly = Polymax::new(-2.0, 1.0, 2.0, 3.0).unwrap();
        assert_gradient(&|x| poly.forward(x)?.mul(&w)?.sum(), &x0, 0.02, "polymax").unwrap();
        let sig = SigSoftmax { ln_base: 1.0 };
        assert_gradient(&|x| sig.forward(x)?.mul(&w)?.sum(), &x0, 0.02, "sigsoftmax").unwrap();
        let soft = Softermax { use_xmax: false };
        assert_gradient(&|x| soft.forward(x)?.mul(&w)?.sum(), &x0, 0.02, "softermax").unwrap();
    }

    #[test]
    fn test_bad_parameters_are_config_errors() {
        assert!(Polymax::new(1.0, 1.0, 2.0, 1.0).is_err());
        assert!(Constantmax::new(0.0, 0.0, None).is_err());
        let cfg = ModelConfig {
            strongermax_strength: 1.0,
            ..ModelConfig::default()
        };
        assert!(strongermax(&cfg).unwrap_err().is_config_error());
    }
}
