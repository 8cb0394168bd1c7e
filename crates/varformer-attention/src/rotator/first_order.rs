//! Piecewise-linear estimates of the rotation matrix.

use super::Rotator;

fn sign(theta: f64) -> f64 {
    if theta > 0.0 {
        1.0
    } else {
        -1.0
    }
}

/// `sin(theta) ~ theta`, `cos(theta) ~ 1 - |theta| / 4`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstOrderRotator;

impl Rotator for FirstOrderRotator {
    fn name(&self) -> &'static str {
        "first_order"
    }

    fn rotate_reduced(&self, theta: f64, v: [f64; 2]) -> [f64; 2] {
        let s = theta;
        let c = 1.0 - theta.abs() / 4.0;
        [c * v[0] - s * v[1], s * v[0] + c * v[1]]
    }
}

/// Computes the second output component first from shift-friendly terms, then
/// derives the first component from it.
#[derive(Clone, Copy, Debug, Default)]
pub struct DoubleFirstOrderRotator;

impl Rotator for DoubleFirstOrderRotator {
    fn name(&self) -> &'static str {
        "double_first_order"
    }

    fn rotate_reduced(&self, theta: f64, v: [f64; 2]) -> [f64; 2] {
        let sg = sign(theta);
        let [x, y] = v;
        let partial = x + sg * y / 4.0;
        let z2 = partial * theta + y;
        let z1 = partial + sg * y / 8.0 - sg * (z2 / 4.0 + z2 / 8.0);
        [z1, z2]
    }
}

/// Two-piece sine and cosine estimates that add `|theta| / 8` and `|theta| / 16`
/// corrections for `|theta| > 0.6`.
///
/// Like [`DoubleFirstOrderRotator`] the second component is computed first; the first
/// is then recovered from it through the inverse rotation `x = c * z1 + s * z2`,
/// with `1 / c` replaced by its own shift-friendly estimate.
#[derive(Clone, Copy, Debug, Default)]
pub struct RefinedDoubleFirstOrderRotator;

const REFINE_THRESHOLD: f64 = 0.6;

impl Rotator for RefinedDoubleFirstOrderRotator {
    fn name(&self) -> &'static str {
        "double_first_order_refined"
    }

    fn rotate_reduced(&self, theta: f64, v: [f64; 2]) -> [f64; 2] {
        let a = theta.abs();
        let refine = a > REFINE_THRESHOLD;
        let s = theta - if refine { theta * a / 8.0 } else { 0.0 };
        let c = 1.0 - a / 4.0 - if refine { a / 16.0 } else { 0.0 };
        let inv_c = 1.0 + a / 4.0 + if refine { a / 8.0 } else { 0.0 };
        let [x, y] = v;
        let z2 = x * s + y * c;
        let z1 = (x - s * z2) * inv_c;
        [z1, z2]
    }
}
