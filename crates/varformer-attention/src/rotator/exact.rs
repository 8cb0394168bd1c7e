use super::Rotator;

/// Rotation by the trigonometric rotation matrix.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExactRotator;

impl Rotator for ExactRotator {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn rotate_reduced(&self, theta: f64, v: [f64; 2]) -> [f64; 2] {
        let (s, c) = theta.sin_cos();
        [c * v[0] - s * v[1], s * v[0] + c * v[1]]
    }
}
