//! Fake quantization: symmetric max-abs scaling to signed integer codes.
//!
//! `quantize` maps a tensor to `(scale, codes)` with `s = 2^bits - 1` levels per sign,
//! `scale = max|t| / s`. Magnitudes are rounded stochastically by default, so the
//! rounding is unbiased in expectation. `fake_quantize` round-trips through the codes
//! inside a forward pass and passes gradients straight through.
//!
//! NaN has no integer code: `quantize` stores it as 0 and `fake_quantize` hands the
//! NaN back unchanged.

use parking_lot::Mutex;
use rand::Rng;
use varformer_core::{GradFn, Result, Shape, Tensor, VarError};

/// Widest supported code width.
pub const MAX_BITS: u32 = 16;

/// A validated bit width in `1..=16`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Bits(u32);

impl Bits {
    pub fn new(bits: u32) -> Result<Self> {
        if bits == 0 || bits > MAX_BITS {
            return Err(VarError::config(format!(
                "quantization bit width must be in 1..={MAX_BITS}, got {bits}"
            )));
        }
        Ok(Self(bits))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of positive levels, `2^bits - 1`.
    pub fn levels(self) -> f32 {
        ((1u32 << self.0) - 1) as f32
    }
}

/// How a scaled magnitude is rounded to an integer level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum QuantMethod {
    /// Round up with probability equal to the fractional part.
    #[default]
    Stochastic,
    /// Round half away from zero.
    Nearest,
}

impl QuantMethod {
    pub fn name(self) -> &'static str {
        match self {
            QuantMethod::Stochastic => "stochastic",
            QuantMethod::Nearest => "nearest",
        }
    }

    fn round<R: Rng + ?Sized>(self, level: f32, rng: &mut R) -> f32 {
        match self {
            QuantMethod::Stochastic => {
                let floor = level.floor();
                let frac = level - floor;
                if frac > 0.0 && rng.gen::<f32>() < frac {
                    floor + 1.0
                } else {
                    floor
                }
            }
            QuantMethod::Nearest => level.round(),
        }
    }
}

/// Integer codes plus the scale that maps them back to floats.
#[derive(Clone, Debug, PartialEq)]
pub struct Quantized {
    pub scale: f32,
    pub codes: Vec<i32>,
    pub shape: Shape,
}

impl Quantized {
    pub fn dequantize(&self) -> Tensor {
        dequantize(self.scale, &self.codes, &self.shape)
    }
}

/// Stochastic quantization using the thread RNG.
pub fn quantize(tensor: &Tensor, bits: Bits) -> Quantized {
    quantize_with(tensor, bits, QuantMethod::Stochastic, &mut rand::thread_rng())
}

pub fn quantize_with<R: Rng + ?Sized>(
    tensor: &Tensor,
    bits: Bits,
    method: QuantMethod,
    rng: &mut R,
) -> Quantized {
    let norm = tensor
        .as_f32_slice()
        .iter()
        .filter(|x| x.is_finite())
        .fold(0.0f32, |m, x| m.max(x.abs()));
    let levels = bits.levels();
    let shape = tensor.shape().clone();
    if norm == 0.0 {
        return Quantized {
            scale: 0.0,
            codes: vec![0; tensor.numel()],
            shape,
        };
    }

    let codes = tensor
        .as_f32_slice()
        .iter()
        .map(|&x| {
            if x.is_nan() {
                return 0;
            }
            // infinities saturate to the outermost code
            let level = (x.abs() / norm * levels).min(levels);
            let magnitude = method.round(level, rng) as i32;
            if x < 0.0 {
                -magnitude
            } else {
                magnitude
            }
        })
        .collect();

    Quantized {
        scale: norm / levels,
        codes,
        shape,
    }
}

pub fn dequantize(scale: f32, codes: &[i32], shape: &Shape) -> Tensor {
    let data: Vec<f32> = codes.iter().map(|&c| c as f32 * scale).collect();
    Tensor::from_f32(&data, shape.dims())
}

/// Identity backward for an op whose forward is not differentiable.
pub struct StraightThroughBackward;

impl GradFn for StraightThroughBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.detach())])
    }
    fn name(&self) -> &str {
        "StraightThroughBackward"
    }
}

/// Quantize-dequantize round trip with a straight-through gradient.
pub fn fake_quantize(tensor: &Tensor, bits: Bits) -> Tensor {
    fake_quantize_with(tensor, bits, QuantMethod::Stochastic, &mut rand::thread_rng()).0
}

/// Round trip with an explicit method and RNG; also returns the scale used.
pub fn fake_quantize_with<R: Rng + ?Sized>(
    tensor: &Tensor,
    bits: Bits,
    method: QuantMethod,
    rng: &mut R,
) -> (Tensor, f32) {
    let q = quantize_with(tensor, bits, method, rng);
    let input = tensor.as_f32_slice();
    let data: Vec<f32> = q
        .codes
        .iter()
        .zip(input)
        .map(|(&c, &x)| if x.is_nan() { x } else { c as f32 * q.scale })
        .collect();
    let out = Tensor::from_f32(&data, q.shape.dims()).attach_grad_fn(StraightThroughBackward, &[tensor]);
    (out, q.scale)
}

/// Resolved quantization settings for one tensor site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuantSpec {
    pub enabled: bool,
    pub bits: Bits,
    pub method: QuantMethod,
}

impl QuantSpec {
    /// Validates `bits` even when the site is disabled.
    pub fn new(enabled: bool, bits: u32, method: QuantMethod) -> Result<Self> {
        Ok(Self {
            enabled,
            bits: Bits::new(bits)?,
            method,
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            bits: Bits(8),
            method: QuantMethod::Stochastic,
        }
    }
}

/// Observations recorded each time an enabled site quantizes a tensor.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct QuantStats {
    pub calls: u64,
    pub last_scale: Option<f32>,
    pub max_abs: f32,
}

/// A tensor boundary where fake quantization may be injected.
///
/// The statistics slot exists for every site, enabled or not.
pub struct QuantSite {
    name: &'static str,
    spec: QuantSpec,
    stats: Mutex<QuantStats>,
}

impl QuantSite {
    pub fn new(name: &'static str, spec: QuantSpec) -> Self {
        Self {
            name,
            spec,
            stats: Mutex::new(QuantStats::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn spec(&self) -> QuantSpec {
        self.spec
    }

    pub fn is_active(&self) -> bool {
        self.spec.enabled
    }

    pub fn stats(&self) -> QuantStats {
        *self.stats.lock()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = QuantStats::default();
    }

    /// Fake-quantize `tensor` if the site is enabled, otherwise pass it through.
    pub fn apply(&self, tensor: &Tensor) -> Tensor {
        if !self.spec.enabled {
            return tensor.clone();
        }
        let max_abs = tensor.max_abs();
        let (out, scale) =
            fake_quantize_with(tensor, self.spec.bits, self.spec.method, &mut rand::thread_rng());
        let mut stats = self.stats.lock();
        stats.calls += 1;
        stats.last_scale = Some(scale);
        stats.max_abs = stats.max_abs.max(max_abs);
        out
    }
}

impl std::fmt::Debug for QuantSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantSite")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .finish()
    }
}
