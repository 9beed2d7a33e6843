//! Moment Calculator Tests

use crate::detection::config::MomentConfig;
use crate::detection::error::{DetectionError, ValidationError};
use crate::detection::moments::{MomentCalculator, MomentName, MomentValue};
use crate::detection::panel::{PricePanel, POOLED_ENVIRONMENT};
use crate::detection::synthetic::{CoordinationProfile, SyntheticMarket, REGIME_COLUMN};

fn calculator() -> MomentCalculator {
    MomentCalculator::new(MomentConfig::default()).unwrap()
}

fn market(n_steps: usize) -> SyntheticMarket {
    SyntheticMarket {
        n_steps,
        ..SyntheticMarket::default()
    }
}

fn validation(err: DetectionError) -> ValidationError {
    match err {
        DetectionError::Validation(v) => v,
        other => panic!("expected validation error, got {:?}", other),
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

#[test]
fn test_single_venue_rejected() {
    let m = market(100);
    let panel = m.competitive().unwrap();
    let err = calculator()
        .compute(&panel, &["venue_0".to_string()], None)
        .unwrap_err();
    assert_eq!(
        validation(err),
        ValidationError::InsufficientColumns { required: 2, found: 1 }
    );
}

#[test]
fn test_missing_venue_rejected() {
    let m = market(100);
    let panel = m.competitive().unwrap();
    let err = calculator()
        .compute(&panel, &["venue_0".to_string(), "nope".to_string()], None)
        .unwrap_err();
    assert_eq!(
        validation(err),
        ValidationError::MissingColumns { missing: vec!["nope".to_string()] }
    );
}

#[test]
fn test_too_few_rows_rejected() {
    let m = market(10);
    let panel = m.competitive().unwrap();
    let err = calculator().compute(&panel, &m.venue_names(), None).unwrap_err();
    assert_eq!(
        validation(err),
        ValidationError::InsufficientRows { required: 15, found: 10 }
    );
}

#[test]
fn test_missing_environment_column_rejected() {
    let m = market(100);
    let panel = m.competitive().unwrap();
    let err = calculator()
        .compute(&panel, &m.venue_names(), Some("session"))
        .unwrap_err();
    assert_eq!(
        validation(err),
        ValidationError::MissingColumns { missing: vec!["session".to_string()] }
    );
}

#[test]
fn test_non_positive_price_rejected() {
    let panel = PricePanel::new(
        (0..20).collect(),
        vec![
            ("a".to_string(), (0..20).map(|i| 100.0 + i as f64).collect()),
            ("b".to_string(), (0..20).map(|i| if i == 7 { 0.0 } else { 50.0 }).collect()),
        ],
    )
    .unwrap();
    let err = calculator()
        .compute(&panel, &["a".to_string(), "b".to_string()], None)
        .unwrap_err();
    assert!(matches!(
        validation(err),
        ValidationError::NonPositivePrice { row: 7, .. }
    ));
}

// =============================================================================
// FORMULAS AND BOUNDS
// =============================================================================

#[test]
fn test_pooled_report_has_zero_invariance() {
    let m = market(400);
    let panel = m.competitive().unwrap();
    let report = calculator().compute(&panel, &m.venue_names(), None).unwrap();

    assert_eq!(report.per_environment.len(), 1);
    assert_eq!(report.per_environment[0].environment, POOLED_ENVIRONMENT);
    assert_eq!(report.per_environment[0].n_observations, 399);
    assert_eq!(report.invariance.len(), 5);
    assert!(report.invariance.values().all(|&v| v == 0.0));
    assert_eq!(report.array_invariance[&MomentName::VenueVolatility], vec![0.0; 4]);
    assert_eq!(report.array_invariance[&MomentName::PairwiseCorrelation], vec![0.0; 6]);
}

#[test]
fn test_moments_are_bounded() {
    let m = market(600);
    let panels = vec![
        m.competitive().unwrap(),
        m.coordinated(&CoordinationProfile::default()).unwrap(),
        m.coordinated(&CoordinationProfile { strength: 1.0, ..Default::default() }).unwrap(),
    ];
    for panel in &panels {
        let report = calculator()
            .compute(panel, &m.venue_names(), Some(REGIME_COLUMN))
            .unwrap();
        for env in &report.per_environment {
            for v in env.scalars() {
                assert!((0.0..=1.0).contains(&v), "scalar moment out of range: {}", v);
            }
            assert_eq!(env.venue_volatility.len(), 4);
            assert_eq!(env.pairwise_correlation.len(), 6);
            assert!(env
                .venue_volatility
                .iter()
                .chain(&env.pairwise_correlation)
                .all(|v| (0.0..=1.0).contains(v)));
        }
    }
}

#[test]
fn test_constant_drift_dwell_and_arbitrage() {
    let n = 50;
    let prices: Vec<f64> = (0..n).map(|t| 100.0 * (0.001 * t as f64).exp()).collect();
    let panel = PricePanel::new(
        (0..n as i64).collect(),
        vec![("a".to_string(), prices.clone()), ("b".to_string(), prices)],
    )
    .unwrap();
    let report = calculator()
        .compute(&panel, &["a".to_string(), "b".to_string()], None)
        .unwrap();
    let m = &report.per_environment[0];
    // mean |r| == price_change_scale
    assert!((m.spread_floor_dwell - 0.5).abs() < 1e-9);
    assert!(m.arbitrage_timing < 1e-9);
}

#[test]
fn test_mirroring_rises_under_coordination() {
    let m = market(1000);
    let venues = m.venue_names();
    let competitive = calculator().compute(&m.competitive().unwrap(), &venues, None).unwrap();
    let coordinated = calculator()
        .compute(&m.coordinated(&CoordinationProfile::default()).unwrap(), &venues, None)
        .unwrap();

    let base = competitive.per_environment[0].mirroring_similarity;
    let mirrored = coordinated.per_environment[0].mirroring_similarity;
    assert!(mirrored > base + 0.1, "mirroring {} vs {}", mirrored, base);
}

#[test]
fn test_environment_dependent_coordination_breaks_invariance() {
    let m = market(1000);
    let profile = CoordinationProfile {
        environment_dependent: true,
        ..Default::default()
    };
    let report = calculator()
        .compute(&m.coordinated(&profile).unwrap(), &m.venue_names(), Some(REGIME_COLUMN))
        .unwrap();

    assert_eq!(report.per_environment.len(), 2);
    let calm = report.environment("regime_0").unwrap().mirroring_similarity;
    let mirrored = report.environment("regime_1").unwrap().mirroring_similarity;
    assert!(mirrored > calm);
    assert!(report.invariance[&MomentName::MirroringSimilarity] > 0.0);

    let pairs = &report.array_invariance[&MomentName::PairwiseCorrelation];
    assert_eq!(pairs.len(), 6);
    assert!(pairs.iter().all(|v| v.is_finite() && *v >= 0.0));
    assert!(pairs.iter().any(|&v| v > 0.0));
    assert_eq!(report.array_invariance[&MomentName::VenueVolatility].len(), 4);
}

#[test]
fn test_vectors_and_series_shapes() {
    let m = market(300);
    let report = calculator()
        .compute(&m.competitive().unwrap(), &m.venue_names(), Some(REGIME_COLUMN))
        .unwrap();

    let vectors = report.vectors();
    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[0].values.len(), 7);
    assert!(matches!(
        vectors[0].values[&MomentName::VenueVolatility],
        MomentValue::Array(ref v) if v.len() == 4
    ));
    assert!(vectors[0].values[&MomentName::SpreadFloorDwell].as_scalar().is_some());

    let series = report.as_series();
    assert_eq!(series.len(), 5);
    assert!(series.values().all(|v| v.len() == 2));
    assert!(series.contains_key("undercut_concentration"));
}

// =============================================================================
// MOMENT MATRIX
// =============================================================================

#[test]
fn test_moment_matrix_shape() {
    let m = market(500);
    let panel = m.competitive().unwrap();
    let matrix = calculator()
        .moment_matrix(&panel, &m.venue_names(), Some(REGIME_COLUMN))
        .unwrap();

    assert_eq!(matrix.n_rows(), 480);
    assert_eq!(matrix.n_components(), 5);
    assert_eq!(matrix.timestamps.len(), 480);
    assert_eq!(matrix.timestamps[0], panel.timestamps()[20]);
    assert_eq!(matrix.environments.first().map(String::as_str), Some("regime_0"));
    assert_eq!(matrix.environments.last().map(String::as_str), Some("regime_1"));
    assert!(matrix.rows.iter().all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn test_moment_matrix_needs_a_full_window() {
    let m = market(18);
    let panel = m.competitive().unwrap();
    let err = calculator()
        .moment_matrix(&panel, &m.venue_names(), None)
        .unwrap_err();
    assert_eq!(
        validation(err),
        ValidationError::InsufficientRows { required: 21, found: 18 }
    );
}
