//! Moment stabilization
//!
//! ```text
//! raw column ──► winsorize [p_lo, p_hi] ──► - mean ──► / std ──► retained
//!                                                       │
//!                                           std < min_std ──► dropped
//! ```
//!
//! Bounds, means and standard deviations are fitted once on the reference
//! matrix and frozen in `StabilizerParams`; later matrices are transformed
//! with the frozen values.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::detection::config::StabilizerConfig;
use crate::detection::moments::MomentMatrix;
use crate::detection::stats::{mean, percentile, sample_std};

/// Frozen per-component stabilization, indexed by original component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilizerParams {
    pub component_names: Vec<String>,
    pub lower_bounds: Vec<f64>,
    pub upper_bounds: Vec<f64>,
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
    /// Original indices kept, ascending.
    pub valid_components: Vec<usize>,
    /// Original indices dropped as degenerate, ascending.
    pub dropped_components: Vec<usize>,
}

impl StabilizerParams {
    pub fn valid_names(&self) -> Vec<String> {
        self.valid_components
            .iter()
            .map(|&j| self.component_names[j].clone())
            .collect()
    }

    pub fn dropped_names(&self) -> Vec<String> {
        self.dropped_components
            .iter()
            .map(|&j| self.component_names[j].clone())
            .collect()
    }
}

/// Observations x retained components.
#[derive(Debug, Clone, PartialEq)]
pub struct StabilizedMomentMatrix {
    pub data: DMatrix<f64>,
    pub valid_components: Vec<usize>,
    pub dropped_components: Vec<usize>,
    /// Names of the retained columns, in column order.
    pub component_names: Vec<String>,
    pub environments: Vec<String>,
}

impl StabilizedMomentMatrix {
    pub fn n_rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_components(&self) -> usize {
        self.data.ncols()
    }

    /// Contiguous row range `[start, end)`.
    pub fn slice_rows(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.n_rows());
        let start = start.min(end);
        let rows: Vec<usize> = (start..end).collect();
        self.select_rows(&rows)
    }

    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            data: self.data.select_rows(rows.iter()),
            valid_components: self.valid_components.clone(),
            dropped_components: self.dropped_components.clone(),
            component_names: self.component_names.clone(),
            environments: rows.iter().map(|&r| self.environments[r].clone()).collect(),
        }
    }
}

pub struct Stabilizer {
    config: StabilizerConfig,
}

impl Stabilizer {
    pub fn new(config: StabilizerConfig) -> Self {
        Self { config }
    }

    /// Fit bounds, centers and scales on `matrix`.
    pub fn fit(&self, matrix: &MomentMatrix) -> StabilizerParams {
        let k = matrix.n_components();
        let mut params = StabilizerParams {
            component_names: matrix.component_names(),
            lower_bounds: Vec::with_capacity(k),
            upper_bounds: Vec::with_capacity(k),
            means: Vec::with_capacity(k),
            stds: Vec::with_capacity(k),
            valid_components: Vec::new(),
            dropped_components: Vec::new(),
        };

        for j in 0..k {
            let column = matrix.column(j);
            let lo = percentile(&column, self.config.lower_percentile);
            let hi = percentile(&column, self.config.upper_percentile);
            let clipped: Vec<f64> = column.iter().map(|v| v.clamp(lo, hi)).collect();
            let mu = mean(&clipped);
            let sd = sample_std(&clipped);

            params.lower_bounds.push(lo);
            params.upper_bounds.push(hi);
            params.means.push(mu);
            params.stds.push(sd);
            if sd.is_finite() && sd >= self.config.min_std {
                params.valid_components.push(j);
            } else {
                params.dropped_components.push(j);
            }
        }

        if !params.dropped_components.is_empty() {
            tracing::info!(
                dropped = ?params.dropped_names(),
                min_std = self.config.min_std,
                "dropping degenerate moment components"
            );
        }
        params
    }

    /// Transform `matrix` with frozen parameters, keeping retained columns only.
    pub fn apply(params: &StabilizerParams, matrix: &MomentMatrix) -> StabilizedMomentMatrix {
        let n = matrix.n_rows();
        let data = DMatrix::from_fn(n, params.valid_components.len(), |r, c| {
            let j = params.valid_components[c];
            let clipped = matrix.rows[(r, j)].clamp(params.lower_bounds[j], params.upper_bounds[j]);
            (clipped - params.means[j]) / params.stds[j]
        });

        StabilizedMomentMatrix {
            data,
            valid_components: params.valid_components.clone(),
            dropped_components: params.dropped_components.clone(),
            component_names: params.valid_names(),
            environments: matrix.environments.clone(),
        }
    }
}
