use super::Rotator;

pub const DEFAULT_CORDIC_STAGES: usize = 5;

/// Stages used to evaluate the converged gain; later factors are 1.0 in `f64`.
const GAIN_STAGES: i32 = 64;

/// Classic shift-and-add CORDIC rotation.
///
/// Stage `i` rotates by `+-atan(2^-i)` towards the target angle using only
/// multiplications by powers of two. The accumulated stretch is corrected once at
/// the end with the converged gain `K = prod cos(atan(2^-i))`, so the scale error
/// shrinks towards zero as stages are added.
#[derive(Clone, Debug)]
pub struct CordicRotator {
    stages: usize,
    angles: Vec<f64>,
    gain: f64,
}

impl CordicRotator {
    pub fn new(stages: usize) -> Self {
        let gain = (0..GAIN_STAGES)
            .map(|i| 2f64.powi(-i).atan().cos())
            .product();
        Self {
            stages,
            angles: stage_angles(stages),
            gain,
        }
    }

    pub fn stages(&self) -> usize {
        self.stages
    }

    pub fn set_stages(&mut self, stages: usize) {
        self.stages = stages;
        self.angles = stage_angles(stages);
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }
}

impl Default for CordicRotator {
    fn default() -> Self {
        Self::new(DEFAULT_CORDIC_STAGES)
    }
}

fn stage_angles(stages: usize) -> Vec<f64> {
    (0..stages).map(|i| 2f64.powi(-(i as i32)).atan()).collect()
}

impl Rotator for CordicRotator {
    fn name(&self) -> &'static str {
        "cordic"
    }

    fn rotate_reduced(&self, theta: f64, v: [f64; 2]) -> [f64; 2] {
        let [mut x, mut y] = v;
        let mut current = 0.0;
        for (i, &angle) in self.angles.iter().enumerate() {
            let t = 2f64.powi(-(i as i32));
            if current > theta {
                (x, y) = (x + t * y, y - t * x);
                current -= angle;
            } else {
                (x, y) = (x - t * y, y + t * x);
                current += angle;
            }
        }
        [x * self.gain, y * self.gain]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_constant() {
        assert!((CordicRotator::default().gain() - 0.607_252_935).abs() < 1e-8);
    }

    #[test]
    fn test_zero_stages_only_scales() {
        let out = CordicRotator::new(0).rotate_reduced(0.5, [2.0, 1.0]);
        let k = CordicRotator::new(0).gain();
        assert_eq!(out, [2.0 * k, 1.0 * k]);
    }

    #[test]
    fn test_set_stages_changes_accuracy() {
        let mut r = CordicRotator::new(2);
        let coarse = r.rotate(0.3, [1.0, 0.0]);
        r.set_stages(24);
        let fine = r.rotate(0.3, [1.0, 0.0]);
        let exact = [0.3f64.cos(), 0.3f64.sin()];
        let err = |v: [f64; 2]| (v[0] - exact[0]).hypot(v[1] - exact[1]);
        assert!(err(fine) < err(coarse));
        assert!(err(fine) < 1e-6);
    }
}
