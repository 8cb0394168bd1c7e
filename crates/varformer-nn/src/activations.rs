//! Element-wise activation functions with autograd support.

use varformer_core::{Result, Tensor};

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEFF: f32 = 0.044_715;

fn sigmoid_scalar(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// GELU, tanh approximation: `0.5 x (1 + tanh(sqrt(2/pi) (x + 0.044715 x^3)))`.
pub fn gelu(input: &Tensor) -> Result<Tensor> {
    input.map_with_derivative(
        "GeluBackward",
        |x| {
            let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
            0.5 * x * (1.0 + inner.tanh())
        },
        |x, _| {
            let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
            let t = inner.tanh();
            let d_inner = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * x * x);
            0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
        },
    )
}

pub fn relu(input: &Tensor) -> Result<Tensor> {
    input.map_with_derivative(
        "ReluBackward",
        |x| x.max(0.0),
        |x, _| if x > 0.0 { 1.0 } else { 0.0 },
    )
}

/// `relu(x)^2`
pub fn squared_relu(input: &Tensor) -> Result<Tensor> {
    input.map_with_derivative(
        "SquaredReluBackward",
        |x| {
            let r = x.max(0.0);
            r * r
        },
        |x, _| 2.0 * x.max(0.0),
    )
}

/// SiLU (swish): `x * sigmoid(x)`.
pub fn silu(input: &Tensor) -> Result<Tensor> {
    input.map_with_derivative(
        "SiluBackward",
        |x| x * sigmoid_scalar(x),
        |x, _| {
            let s = sigmoid_scalar(x);
            s * (1.0 + x * (1.0 - s))
        },
    )
}

pub fn sigmoid(input: &Tensor) -> Result<Tensor> {
    input.map_with_derivative("SigmoidBackward", sigmoid_scalar, |_, y| y * (1.0 - y))
}

pub fn tanh(input: &Tensor) -> Result<Tensor> {
    input.map_with_derivative("TanhBackward", f32::tanh, |_, y| 1.0 - y * y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use varformer_core::gradcheck::assert_gradient;

    fn probe() -> Tensor {
        Tensor::from_f32(&[-2.0, -0.7, -0.1, 0.15, 0.9, 2.5], &[6])
    }

    #[test]
    fn test_known_values() {
        let x = Tensor::from_f32(&[-1.0, 0.0, 2.0], &[3]);
        assert_eq!(relu(&x).unwrap().to_vec(), vec![0.0, 0.0, 2.0]);
        assert_eq!(squared_relu(&x).unwrap().to_vec(), vec![0.0, 0.0, 4.0]);
        assert_eq!(sigmoid(&x).unwrap().to_vec()[1], 0.5);
        assert_eq!(gelu(&x).unwrap().to_vec()[1], 0.0);
        assert!((gelu(&x).unwrap().to_vec()[2] - 1.9546).abs() < 1e-3);
        assert!((silu(&x).unwrap().to_vec()[0] + 0.2689).abs() < 1e-3);
    }

    #[test]
    fn test_activation_gradients() {
        let x0 = probe();
        assert_gradient(&|x| gelu(x)?.sum(), &x0, 0.02, "gelu").unwrap();
        assert_gradient(&|x| silu(x)?.sum(), &x0, 0.02, "silu").unwrap();
        assert_gradient(&|x| sigmoid(x)?.sum(), &x0, 0.02, "sigmoid").unwrap();
        assert_gradient(&|x| tanh(x)?.sum(), &x0, 0.02, "tanh").unwrap();
        assert_gradient(&|x| squared_relu(x)?.sum(), &x0, 0.05, "squared_relu").unwrap();
    }
}
