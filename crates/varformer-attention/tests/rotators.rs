use std::f64::consts::FRAC_PI_4;

use varformer_attention::rotator::metrics::{angle_error, error_report, scale_error, ErrorGrid};
use varformer_attention::rotator::{
    CachedRotator, CordicRotator, DoubleFirstOrderRotator, ExactRotator, FirstOrderRotator,
    RefinedDoubleFirstOrderRotator, Rotator,
};

fn small_grid() -> ErrorGrid {
    let thetas = (0..20).map(|i| -FRAC_PI_4 + i as f64 * 0.08).collect();
    let comps: Vec<f64> = (-4..=4).map(|i| i as f64 * 7.5).collect();
    ErrorGrid::new(thetas, comps.clone(), comps)
}

#[test]
fn exact_rotator_preserves_norm_for_any_angle() {
    for k in -50..50 {
        let theta = k as f64 * 0.173;
        for v in [[1.0, 0.0], [-3.5, 2.25], [100.0, -7.0], [0.0, -1e-3]] {
            let out = ExactRotator.rotate(theta, v);
            let before = v[0].hypot(v[1]);
            let after = out[0].hypot(out[1]);
            assert!((before - after).abs() <= 1e-12 * before.max(1.0));
        }
    }
}

#[test]
fn cordic_scale_error_shrinks_with_stages() {
    let grid = small_grid();
    let errors: Vec<f64> = (0..16)
        .map(|stages| scale_error(&CordicRotator::new(stages), &grid))
        .collect();
    for pair in errors.windows(2) {
        assert!(pair[1] < pair[0], "scale error did not shrink: {errors:?}");
    }
    assert!(errors[15] < 1e-3);
}

#[test]
fn cordic_angle_error_converges() {
    let grid = small_grid();
    let coarse = angle_error(&CordicRotator::new(3), &grid);
    let fine = angle_error(&CordicRotator::new(20), &grid);
    assert!(fine < coarse);
    assert!(fine < 1e-3, "{fine}");
}

#[test]
fn quarter_turns_are_lossless_for_every_rotator() {
    let rotators: Vec<Box<dyn Rotator>> = vec![
        Box::new(ExactRotator),
        Box::new(CordicRotator::default()),
        Box::new(FirstOrderRotator),
        Box::new(DoubleFirstOrderRotator),
        Box::new(RefinedDoubleFirstOrderRotator),
    ];
    for r in &rotators {
        if r.name() == "cordic" {
            continue;
        }
        let out = r.rotate(std::f64::consts::FRAC_PI_2, [2.0, 1.0]);
        assert!((out[0] + 1.0).abs() < 1e-12 && (out[1] - 2.0).abs() < 1e-12, "{}", r.name());
    }
}

#[test]
fn approximate_rotators_have_bounded_error_on_default_grid() {
    let grid = ErrorGrid::default();
    for r in [
        &FirstOrderRotator as &dyn Rotator,
        &RefinedDoubleFirstOrderRotator,
        &CordicRotator::default(),
    ] {
        let report = error_report(r, &grid);
        assert!(report.scale_error_pct.is_finite() && report.scale_error_pct < 25.0, "{report:?}");
        assert!(report.angle_error_deg < 10.0, "{report:?}");
    }
}

#[test]
fn refined_double_estimate_tightens_the_norm() {
    let grid = ErrorGrid::default();
    let single = error_report(&FirstOrderRotator, &grid);
    let refined = error_report(&RefinedDoubleFirstOrderRotator, &grid);
    assert!(refined.scale_error_pct < single.scale_error_pct, "{refined:?} vs {single:?}");
    assert!(refined.scale_error_pct < 8.0 && refined.angle_error_deg < 5.0, "{refined:?}");

    let v = [3.0, -2.0];
    let a = RefinedDoubleFirstOrderRotator.rotate(0.7, v);
    let b = FirstOrderRotator.rotate(0.7, v);
    assert!((a[0] - b[0]).abs() > 1e-3 || (a[1] - b[1]).abs() > 1e-3);
}

#[test]
fn cached_rotator_agrees_with_inner() {
    let cached = CachedRotator::new(CordicRotator::new(7));
    let plain = CordicRotator::new(7);
    for k in 0..30 {
        let theta = k as f64 * 0.41 - 6.0;
        assert_eq!(cached.rotate(theta, [3.0, -1.0]), plain.rotate(theta, [3.0, -1.0]));
        assert_eq!(cached.rotate(theta, [3.0, -1.0]), plain.rotate(theta, [3.0, -1.0]));
    }
    assert_eq!(cached.name(), "cordic");
}
