//! Worst-case error of a rotator over a grid of angles and input vectors.

use rayon::prelude::*;

use super::{ExactRotator, Rotator};

/// Angles and vector components to sweep.
#[derive(Clone, Debug)]
pub struct ErrorGrid {
    pub thetas: Vec<f64>,
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
}

impl ErrorGrid {
    pub fn new(thetas: Vec<f64>, xs: Vec<f64>, ys: Vec<f64>) -> Self {
        Self { thetas, xs, ys }
    }
}

fn arange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    let n = ((stop - start) / step).ceil().max(0.0) as usize;
    (0..n).map(|i| start + i as f64 * step).collect()
}

impl Default for ErrorGrid {
    /// `theta` in `[-pi/4, pi/4)` by 0.04 and `x, y` in `-128, -122, ..., 124`.
    fn default() -> Self {
        let quarter = std::f64::consts::FRAC_PI_4;
        let components = arange(-128.0, 127.0, 6.0);
        Self {
            thetas: arange(-quarter, quarter, 0.04),
            xs: components.clone(),
            ys: components,
        }
    }
}

fn max_over_grid(grid: &ErrorGrid, f: impl Fn(f64, [f64; 2]) -> Option<f64> + Sync) -> f64 {
    grid.xs
        .par_iter()
        .map(|&x| {
            let mut worst = 0.0f64;
            for &y in &grid.ys {
                for &theta in &grid.thetas {
                    if let Some(e) = f(theta, [x, y]) {
                        worst = worst.max(e);
                    }
                }
            }
            worst
        })
        .reduce(|| 0.0, f64::max)
}

/// Largest percent deviation of the output norm from the input norm.
pub fn scale_error(rotator: &dyn Rotator, grid: &ErrorGrid) -> f64 {
    max_over_grid(grid, |theta, v| {
        let norm = v[0].hypot(v[1]);
        if norm == 0.0 {
            return None;
        }
        let out = rotator.rotate(theta, v);
        Some(100.0 * (out[0].hypot(out[1]) - norm).abs() / norm)
    })
}

/// Largest angular deviation, in degrees, from the exact rotation.
pub fn angle_error(rotator: &dyn Rotator, grid: &ErrorGrid) -> f64 {
    max_over_grid(grid, |theta, v| {
        if v == [0.0, 0.0] {
            return None;
        }
        let reference = ExactRotator.rotate(theta, v);
        let out = rotator.rotate(theta, v);
        let mut diff = out[1].atan2(out[0]) - reference[1].atan2(reference[0]);
        diff = diff.rem_euclid(std::f64::consts::TAU);
        if diff > std::f64::consts::PI {
            diff -= std::f64::consts::TAU;
        }
        Some(diff.abs().to_degrees())
    })
}

/// One row of a rotator comparison table.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorReport {
    pub name: &'static str,
    pub scale_error_pct: f64,
    pub angle_error_deg: f64,
}

pub fn error_report(rotator: &dyn Rotator, grid: &ErrorGrid) -> ErrorReport {
    ErrorReport {
        name: rotator.name(),
        scale_error_pct: scale_error(rotator, grid),
        angle_error_deg: angle_error(rotator, grid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grid_extent() {
        let grid = ErrorGrid::default();
        assert_eq!(grid.thetas.len(), 40);
        assert_eq!(grid.xs.len(), 43);
        assert_eq!(grid.xs[0], -128.0);
        assert_eq!(*grid.xs.last().unwrap(), 124.0);
        assert!(*grid.thetas.last().unwrap() < std::f64::consts::FRAC_PI_4);
    }

    #[test]
    fn test_exact_has_no_error() {
        let grid = ErrorGrid::default();
        assert!(scale_error(&ExactRotator, &grid) < 1e-9);
        assert!(angle_error(&ExactRotator, &grid) < 1e-9);
    }
}
