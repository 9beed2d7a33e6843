//! Stabilization Tests
//!
//! Retained columns must leave the pipeline with unit-scale variance, and
//! degenerate columns must be dropped and enumerated.

use nalgebra::DMatrix;

use crate::detection::config::{MomentConfig, StabilizerConfig};
use crate::detection::moments::{MomentCalculator, MomentMatrix, MomentName};
use crate::detection::stabilizer::Stabilizer;
use crate::detection::stats::sample_std;
use crate::detection::synthetic::{CoordinationProfile, SyntheticMarket, REGIME_COLUMN};

fn matrix_from_columns(columns: &[Vec<f64>]) -> MomentMatrix {
    let n = columns[0].len();
    MomentMatrix {
        components: MomentName::SCALARS[..columns.len()].to_vec(),
        timestamps: (0..n as i64).collect(),
        environments: vec!["all".to_string(); n],
        rows: DMatrix::from_fn(n, columns.len(), |r, c| columns[c][r]),
    }
}

fn stabilizer() -> Stabilizer {
    Stabilizer::new(StabilizerConfig::default())
}

#[test]
fn test_constant_column_is_dropped() {
    let varying: Vec<f64> = (0..200).map(|i| (i as f64 * 0.37).sin()).collect();
    let matrix = matrix_from_columns(&[varying, vec![0.42; 200]]);

    let params = stabilizer().fit(&matrix);
    assert_eq!(params.valid_components, vec![0]);
    assert_eq!(params.dropped_components, vec![1]);
    assert_eq!(params.dropped_names(), vec!["mirroring_similarity".to_string()]);

    let stabilized = Stabilizer::apply(&params, &matrix);
    assert_eq!(stabilized.n_components(), 1);
    assert_eq!(stabilized.component_names, vec!["arbitrage_timing".to_string()]);
}

#[test]
fn test_retained_columns_have_unit_std() {
    let m = SyntheticMarket { n_steps: 800, ..SyntheticMarket::default() };
    let calculator = MomentCalculator::new(MomentConfig::default()).unwrap();
    let panels = [
        m.competitive().unwrap(),
        m.coordinated(&CoordinationProfile::default()).unwrap(),
    ];
    for panel in &panels {
        let matrix = calculator
            .moment_matrix(panel, &m.venue_names(), Some(REGIME_COLUMN))
            .unwrap();
        let params = stabilizer().fit(&matrix);
        let stabilized = Stabilizer::apply(&params, &matrix);

        assert_eq!(
            params.valid_components.len() + params.dropped_components.len(),
            5
        );
        for c in 0..stabilized.n_components() {
            let column: Vec<f64> = stabilized.data.column(c).iter().copied().collect();
            let sd = sample_std(&column);
            assert!((0.9..=1.1).contains(&sd), "column {} std {}", c, sd);
        }
    }
}

#[test]
fn test_outliers_are_winsorized() {
    let mut values: Vec<f64> = (0..100).map(|i| i as f64 / 100.0).collect();
    values[50] = 1_000.0;
    let matrix = matrix_from_columns(&[values]);
    let params = Stabilizer::new(StabilizerConfig {
        lower_percentile: 5.0,
        upper_percentile: 95.0,
        min_std: 1e-3,
    })
    .fit(&matrix);

    assert!(params.upper_bounds[0] < 1.0);
    assert!(params.lower_bounds[0] >= 0.0);
    assert_eq!(params.valid_components, vec![0]);

    let stabilized = Stabilizer::apply(&params, &matrix);
    let max = stabilized.data.column(0).max();
    assert!(max < 3.0, "outlier survived winsorization: {}", max);
}

#[test]
fn test_frozen_params_apply_to_new_data() {
    let reference: Vec<f64> = (0..100).map(|i| i as f64).collect();
    let params = stabilizer().fit(&matrix_from_columns(&[reference]));

    let shifted = matrix_from_columns(&[(0..100).map(|i| 500.0 + i as f64).collect()]);
    let stabilized = Stabilizer::apply(&params, &shifted);
    // everything clips to the reference upper bound
    let expected = (params.upper_bounds[0] - params.means[0]) / params.stds[0];
    assert!(stabilized.data.iter().all(|v| (v - expected).abs() < 1e-12));
}

#[test]
fn test_slice_rows_keeps_labels_aligned() {
    let matrix = MomentMatrix {
        environments: vec!["a".into(), "a".into(), "b".into(), "b".into()],
        ..matrix_from_columns(&[vec![1.0, 2.0, 3.0, 4.0]])
    };
    let params = stabilizer().fit(&matrix);
    let stabilized = Stabilizer::apply(&params, &matrix);
    let tail = stabilized.slice_rows(2, 10);
    assert_eq!(tail.n_rows(), 2);
    assert_eq!(tail.environments, vec!["b".to_string(), "b".to_string()]);
}
