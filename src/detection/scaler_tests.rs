//! Global Scaler Tests

use std::collections::BTreeMap;

use crate::detection::config::ScalerMethod;
use crate::detection::error::ScalerError;
use crate::detection::scaler::GlobalScaler;

fn series(pairs: &[(&str, &[f64])]) -> BTreeMap<String, Vec<f64>> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_vec())).collect()
}

#[test]
fn test_transform_before_fit_fails() {
    let scaler = GlobalScaler::new(ScalerMethod::ZScore);
    assert!(!scaler.is_fitted());
    let err = scaler.transform(&series(&[("a", &[1.0])])).unwrap_err();
    assert_eq!(err, ScalerError::NotFitted);
}

#[test]
fn test_min_max_maps_reference_to_unit_range() {
    let mut scaler = GlobalScaler::new(ScalerMethod::MinMax);
    let reference = series(&[("mirroring", &[0.25, 0.5, 0.75])]);
    scaler.fit(&reference).unwrap();
    let out = scaler.transform(&reference).unwrap();
    assert_eq!(out["mirroring"], vec![0.0, 0.5, 1.0]);
}

#[test]
fn test_frozen_transform_is_not_refitted() {
    let mut scaler = GlobalScaler::new(ScalerMethod::MinMax);
    scaler.fit(&series(&[("m", &[0.0, 1.0])])).unwrap();

    // A dataset on its own narrow range keeps the reference scaling.
    let out = scaler.transform(&series(&[("m", &[0.40, 0.45])])).unwrap();
    assert!((out["m"][0] - 0.40).abs() < 1e-12);
    assert!((out["m"][1] - 0.45).abs() < 1e-12);
}

#[test]
fn test_z_score() {
    let mut scaler = GlobalScaler::new(ScalerMethod::ZScore);
    scaler.fit(&series(&[("m", &[1.0, 2.0, 3.0])])).unwrap();
    let out = scaler.transform(&series(&[("m", &[2.0, 4.0])])).unwrap();
    assert!((out["m"][0]).abs() < 1e-12);
    assert!((out["m"][1] - 2.0).abs() < 1e-12);
}

#[test]
fn test_robust_uses_median_and_iqr() {
    let mut scaler = GlobalScaler::new(ScalerMethod::Robust);
    let params = scaler.fit(&series(&[("m", &[1.0, 2.0, 3.0, 4.0, 100.0])])).unwrap();
    let scale = params.moments["m"];
    assert_eq!(scale.center, 3.0);
    assert_eq!(scale.scale, 2.0);
}

#[test]
fn test_degenerate_scale_yields_zeros() {
    for method in [ScalerMethod::MinMax, ScalerMethod::ZScore, ScalerMethod::Robust] {
        let mut scaler = GlobalScaler::new(method);
        scaler.fit(&series(&[("flat", &[0.3, 0.3, 0.3])])).unwrap();
        let out = scaler.transform(&series(&[("flat", &[0.1, 0.3, 0.9])])).unwrap();
        assert_eq!(out["flat"], vec![0.0, 0.0, 0.0], "{:?}", method);
    }
}

#[test]
fn test_unknown_and_empty_moments() {
    let mut scaler = GlobalScaler::new(ScalerMethod::ZScore);
    assert_eq!(
        scaler.fit(&series(&[("a", &[])])).unwrap_err(),
        ScalerError::EmptySeries("a".to_string())
    );
    scaler.fit(&series(&[("a", &[1.0, 2.0])])).unwrap();
    assert_eq!(
        scaler.transform(&series(&[("b", &[1.0])])).unwrap_err(),
        ScalerError::UnknownMoment("b".to_string())
    );
}

#[test]
fn test_params_round_trip_through_json() {
    let mut scaler = GlobalScaler::new(ScalerMethod::ZScore);
    scaler.fit(&series(&[("m", &[0.1, 0.25, 0.7])])).unwrap();
    let json = serde_json::to_string(scaler.params().unwrap()).unwrap();
    let restored = GlobalScaler::from_params(serde_json::from_str(&json).unwrap());

    let sample = series(&[("m", &[0.33, 0.9])]);
    assert_eq!(
        scaler.transform(&sample).unwrap(),
        restored.transform(&sample).unwrap()
    );
    assert_eq!(restored.method(), ScalerMethod::ZScore);
}
