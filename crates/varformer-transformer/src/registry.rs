//! Named-variant lookup tables.
//!
//! One table per namespace maps a variant name to a constructor. The process-wide
//! registry is built on first use and never changes afterwards; every lookup of an
//! unknown name fails with [`VarError::UnknownVariant`].

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use rand::RngCore;
use tracing::debug;
use varformer_attention::rotator::{
    CordicRotator, DoubleFirstOrderRotator, ExactRotator, FirstOrderRotator,
    RefinedDoubleFirstOrderRotator, Rotator,
};
use varformer_core::{Result, Tensor, VarError};
use varformer_nn::QuantMethod;

use crate::config::ModelConfig;
use crate::variants::{
    activation, linear, norm, position, softmax, Activation, LinearLayer, LinearSpec, Normalization,
    PositionEncoding, Router, SoftmaxTopK, SoftmaxVariant, TopKSoftmax,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    Normalization,
    Activation,
    Softmax,
    Linear,
    PositionEncoding,
    Rotator,
    Router,
    QuantizationMethod,
}

impl Namespace {
    pub const ALL: [Namespace; 8] = [
        Namespace::Normalization,
        Namespace::Activation,
        Namespace::Softmax,
        Namespace::Linear,
        Namespace::PositionEncoding,
        Namespace::Rotator,
        Namespace::Router,
        Namespace::QuantizationMethod,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Normalization => "normalization",
            Namespace::Activation => "activation",
            Namespace::Softmax => "softmax",
            Namespace::Linear => "linear",
            Namespace::PositionEncoding => "position_encoding",
            Namespace::Rotator => "rotator",
            Namespace::Router => "router",
            Namespace::QuantizationMethod => "quantization_method",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

pub type NormCtor = fn(usize, &ModelConfig) -> Box<dyn Normalization>;
pub type ActivationFn = fn(&Tensor) -> Result<Tensor>;
pub type SoftmaxCtor = fn(&ModelConfig) -> Result<Box<dyn SoftmaxVariant>>;
pub type LinearCtor = fn(&LinearSpec, &ModelConfig, &mut dyn RngCore) -> Result<Box<dyn LinearLayer>>;
pub type PositionCtor = fn(&ModelConfig) -> Result<Box<dyn PositionEncoding>>;
pub type RotatorCtor = fn(&ModelConfig) -> Box<dyn Rotator>;
pub type RouterCtor = fn() -> Box<dyn Router>;

type Table<T> = BTreeMap<&'static str, T>;

pub struct Registry {
    normalization: Table<NormCtor>,
    activation: Table<ActivationFn>,
    softmax: Table<SoftmaxCtor>,
    linear: Table<LinearCtor>,
    position_encoding: Table<PositionCtor>,
    rotator: Table<RotatorCtor>,
    router: Table<RouterCtor>,
    quantization_method: Table<QuantMethod>,
}

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::builtin);

/// The process-wide registry of built-in variants.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

fn lookup<'a, T>(table: &'a Table<T>, ns: Namespace, name: &str) -> Result<(&'static str, &'a T)> {
    let (key, value) = table.get_key_value(name).ok_or_else(|| VarError::UnknownVariant {
        namespace: ns.as_str(),
        name: name.to_string(),
    })?;
    debug!(namespace = ns.as_str(), variant = *key, "resolved variant");
    Ok((*key, value))
}

impl Registry {
    pub fn builtin() -> Self {
        let mut normalization: Table<NormCtor> = BTreeMap::new();
        normalization.insert("layernorm", norm::layernorm);
        normalization.insert("rmsnorm", norm::rmsnorm);

        let activation: Table<ActivationFn> = activation::BUILTIN.into_iter().collect();

        let mut softmax: Table<SoftmaxCtor> = BTreeMap::new();
        softmax.insert("softmax", softmax::softmax);
        softmax.insert("softermax", softmax::softermax);
        softmax.insert("constantmax", softmax::constantmax);
        softmax.insert("constantmax_quan", softmax::constantmax_quan);
        softmax.insert("strongermax", softmax::strongermax);
        softmax.insert("polymax", softmax::polymax);
        softmax.insert("sigsoftmax", softmax::sigsoftmax);

        let mut linear: Table<LinearCtor> = BTreeMap::new();
        linear.insert("linear", linear::dense);
        linear.insert("quantized", linear::quantized);
        linear.insert("bitlinear", linear::bitlinear);

        let mut position_encoding: Table<PositionCtor> = BTreeMap::new();
        position_encoding.insert("none", position::none);
        position_encoding.insert("rope", position::rope);
        position_encoding.insert("shortrope", position::shortrope);

        let mut rotator: Table<RotatorCtor> = BTreeMap::new();
        rotator.insert("exact", |_| Box::new(ExactRotator));
        rotator.insert("cordic", |c| Box::new(CordicRotator::new(c.cordic_stages)));
        rotator.insert("first_order", |_| Box::new(FirstOrderRotator));
        rotator.insert("double_first_order", |_| Box::new(DoubleFirstOrderRotator));
        rotator.insert("double_first_order_refined", |_| Box::new(RefinedDoubleFirstOrderRotator));

        let mut router: Table<RouterCtor> = BTreeMap::new();
        router.insert("topk_softmax", || Box::new(TopKSoftmax));
        router.insert("softmax_topk", || Box::new(SoftmaxTopK));

        let quantization_method = [QuantMethod::Stochastic, QuantMethod::Nearest]
            .into_iter()
            .map(|m| (m.name(), m))
            .collect();

        Self {
            normalization,
            activation,
            softmax,
            linear,
            position_encoding,
            rotator,
            router,
            quantization_method,
        }
    }

    /// Registered names in `ns`, sorted.
    pub fn names(&self, ns: Namespace) -> Vec<&'static str> {
        match ns {
            Namespace::Normalization => self.normalization.keys().copied().collect(),
            Namespace::Activation => self.activation.keys().copied().collect(),
            Namespace::Softmax => self.softmax.keys().copied().collect(),
            Namespace::Linear => self.linear.keys().copied().collect(),
            Namespace::PositionEncoding => self.position_encoding.keys().copied().collect(),
            Namespace::Rotator => self.rotator.keys().copied().collect(),
            Namespace::Router => self.router.keys().copied().collect(),
            Namespace::QuantizationMethod => self.quantization_method.keys().copied().collect(),
        }
    }

    pub fn contains(&self, ns: Namespace, name: &str) -> bool {
        self.names(ns).iter().any(|n| *n == name)
    }

    pub fn check(&self, ns: Namespace, name: &str) -> Result<()> {
        if self.contains(ns, name) {
            Ok(())
        } else {
            Err(VarError::UnknownVariant {
                namespace: ns.as_str(),
                name: name.to_string(),
            })
        }
    }

    pub fn normalization(&self, name: &str, dim: usize, config: &ModelConfig) -> Result<Box<dyn Normalization>> {
        let (_, ctor) = lookup(&self.normalization, Namespace::Normalization, name)?;
        Ok(ctor(dim, config))
    }

    pub fn activation(&self, name: &str) -> Result<Box<dyn Activation>> {
        let (key, f) = lookup(&self.activation, Namespace::Activation, name)?;
        Ok(activation::elementwise(key, *f))
    }

    pub fn softmax(&self, name: &str, config: &ModelConfig) -> Result<Box<dyn SoftmaxVariant>> {
        let (_, ctor) = lookup(&self.softmax, Namespace::Softmax, name)?;
        ctor(config)
    }

    pub fn linear(
        &self,
        name: &str,
        spec: &LinearSpec,
        config: &ModelConfig,
        rng: &mut dyn RngCore,
    ) -> Result<Box<dyn LinearLayer>> {
        let (_, ctor) = lookup(&self.linear, Namespace::Linear, name)?;
        ctor(spec, config, rng)
    }

    pub fn position_encoding(&self, name: &str, config: &ModelConfig) -> Result<Box<dyn PositionEncoding>> {
        let (_, ctor) = lookup(&self.position_encoding, Namespace::PositionEncoding, name)?;
        ctor(config)
    }

    pub fn rotator(&self, name: &str, config: &ModelConfig) -> Result<Box<dyn Rotator>> {
        let (_, ctor) = lookup(&self.rotator, Namespace::Rotator, name)?;
        Ok(ctor(config))
    }

    pub fn router(&self, name: &str) -> Result<Box<dyn Router>> {
        let (_, ctor) = lookup(&self.router, Namespace::Router, name)?;
        Ok(ctor())
    }

    pub fn quant_method(&self, name: &str) -> Result<QuantMethod> {
        let (_, method) = lookup(&self.quantization_method, Namespace::QuantizationMethod, name)?;
        Ok(*method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_namespace_is_populated() {
        let reg = registry();
        let expected = [
            (Namespace::Normalization, 2),
            (Namespace::Activation, 6),
            (Namespace::Softmax, 7),
            (Namespace::Linear, 3),
            (Namespace::PositionEncoding, 3),
            (Namespace::Rotator, 5),
            (Namespace::Router, 2),
            (Namespace::QuantizationMethod, 2),
        ];
        for (ns, n) in expected {
            assert_eq!(reg.names(ns).len(), n, "{ns}");
        }
        assert_eq!(Namespace::ALL.len(), expected.len());
    }

    #[test]
    fn test_unknown_names_fail_without_fallback() {
        let reg = registry();
        let cfg = ModelConfig::default();
        match reg.rotator("taylor", &cfg) {
            Err(VarError::UnknownVariant { namespace, name }) => {
                assert_eq!((namespace, name.as_str()), ("rotator", "taylor"));
            }
            _ => panic!("expected unknown variant"),
        }
        assert!(reg.normalization("batchnorm", 4, &cfg).is_err());
        assert!(reg.activation("GELU").is_err());
        assert!(reg.router("hash").is_err());
        assert!(reg.check(Namespace::QuantizationMethod, "floor").is_err());
    }

    #[test]
    fn test_resolution_builds_named_instances() {
        let reg = registry();
        let cfg = ModelConfig {
            cordic_stages: 9,
            ..ModelConfig::default()
        };
        assert_eq!(reg.activation("squared_relu").unwrap().name(), "squared_relu");
        assert_eq!(reg.softmax("polymax", &cfg).unwrap().name(), "polymax");
        assert_eq!(reg.rotator("cordic", &cfg).unwrap().name(), "cordic");
        assert_eq!(reg.normalization("layernorm", 4, &cfg).unwrap().name(), "layernorm");
        assert_eq!(reg.quant_method("nearest").unwrap(), QuantMethod::Nearest);
        assert_eq!(reg.router("softmax_topk").unwrap().name(), "softmax_topk");
    }
}
