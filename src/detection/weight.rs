//! HAC weight matrix
//!
//! Newey-West covariance of the moment-condition series with Bartlett
//! weights, inverted through its eigenbasis. When the covariance is
//! ill-conditioned a ridge `lambda * I` is added, starting from
//! `max(lambda_max, 1e-12) * 1e-9` and doubling until the condition number
//! is within bounds.

use nalgebra::{DMatrix, SymmetricEigen};
use serde::{Deserialize, Serialize};

/// Hard stop for the ridge doubling search.
const MAX_RIDGE_DOUBLINGS: usize = 256;

/// `floor(4 (n / 100)^(2/9))`.
pub fn default_hac_lag(n: usize) -> usize {
    (4.0 * (n as f64 / 100.0).powf(2.0 / 9.0)).floor() as usize
}

/// Newey-West long-run covariance of the rows of `series` (T x q), centered
/// by column means.
pub fn hac_covariance(series: &DMatrix<f64>, lag: usize) -> DMatrix<f64> {
    let t = series.nrows();
    let q = series.ncols();
    if t == 0 {
        return DMatrix::zeros(q, q);
    }

    let means = series.row_mean();
    let centered = DMatrix::from_fn(t, q, |r, c| series[(r, c)] - means[c]);

    let tf = t as f64;
    let mut s = centered.transpose() * &centered / tf;
    let lag = lag.min(t.saturating_sub(1));
    for l in 1..=lag {
        let lead = centered.rows(l, t - l);
        let lagged = centered.rows(0, t - l);
        let gamma = lead.transpose() * lagged / tf;
        let w = 1.0 - l as f64 / (lag as f64 + 1.0);
        s += (&gamma + gamma.transpose()) * w;
    }
    (&s + s.transpose()) * 0.5
}

/// Dimensions and remediation applied to a weight matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightMatrixMeta {
    /// Rows of the condition series.
    pub n_observations: usize,
    /// Retained moment components.
    pub k: usize,
    pub n_conditions: usize,
    pub hac_lag: usize,
    /// 0 unless ridge regularization was required.
    pub ridge_lambda: f64,
    /// Condition number after any ridge adjustment.
    pub condition_number: f64,
    pub ridge_applied: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightMatrix {
    pub matrix: DMatrix<f64>,
    pub meta: WeightMatrixMeta,
}

impl WeightMatrix {
    /// Estimate `W = (S + lambda I)^-1` from condition rows.
    pub fn estimate(
        conditions: &DMatrix<f64>,
        n_components: usize,
        lag: usize,
        max_condition: f64,
    ) -> Self {
        let q = conditions.ncols();
        let s = hac_covariance(conditions, lag);
        let eig = SymmetricEigen::new(s);
        let eigenvalues: Vec<f64> = eig.eigenvalues.iter().map(|e| e.max(0.0)).collect();
        let lambda_max = eigenvalues.iter().copied().fold(0.0, f64::max);
        let lambda_min = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);

        let cond_at = |ridge: f64| {
            let denom = lambda_min + ridge;
            if denom > 0.0 {
                (lambda_max + ridge) / denom
            } else {
                f64::INFINITY
            }
        };

        let mut ridge = 0.0;
        let mut condition_number = cond_at(0.0);
        if !(condition_number <= max_condition) {
            ridge = lambda_max.max(1e-12) * 1e-9;
            condition_number = cond_at(ridge);
            let mut doublings = 0;
            while condition_number > max_condition && doublings < MAX_RIDGE_DOUBLINGS {
                ridge *= 2.0;
                condition_number = cond_at(ridge);
                doublings += 1;
            }
            tracing::debug!(
                ridge_lambda = ridge,
                condition_number,
                doublings,
                "ridge-regularized HAC covariance"
            );
        }

        let inv_diag = DMatrix::from_diagonal(&nalgebra::DVector::from_iterator(
            q,
            eigenvalues.iter().map(|e| 1.0 / (e + ridge)),
        ));
        let v = &eig.eigenvectors;
        let w = v * inv_diag * v.transpose();
        let matrix = (&w + w.transpose()) * 0.5;

        Self {
            matrix,
            meta: WeightMatrixMeta {
                n_observations: conditions.nrows(),
                k: n_components,
                n_conditions: q,
                hac_lag: lag,
                ridge_lambda: ridge,
                condition_number,
                ridge_applied: ridge > 0.0,
            },
        }
    }

    pub fn to_row_major(&self) -> Vec<f64> {
        let q = self.matrix.nrows();
        (0..q)
            .flat_map(|r| (0..q).map(move |c| (r, c)))
            .map(|(r, c)| self.matrix[(r, c)])
            .collect()
    }

    /// Rebuild from stored values; `None` when the length does not match
    /// `meta.n_conditions`.
    pub fn from_row_major(meta: WeightMatrixMeta, values: &[f64]) -> Option<Self> {
        let q = meta.n_conditions;
        if values.len() != q * q {
            return None;
        }
        Some(Self {
            matrix: DMatrix::from_row_slice(q, q, values),
            meta,
        })
    }

    /// Principal submatrix over the given condition indices.
    pub fn submatrix(&self, indices: &[usize]) -> DMatrix<f64> {
        self.matrix.select_rows(indices.iter()).select_columns(indices.iter())
    }
}
