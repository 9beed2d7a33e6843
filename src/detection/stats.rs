//! Statistical primitives shared by the engines
//!
//! - Two-sample Kolmogorov-Smirnov test (tie-aware)
//! - Percentiles and bootstrap percentile intervals
//! - OLS via SVD, with R-squared
//! - Residual diagnostics (Jarque-Bera, Breusch-Pagan)

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};
use statrs::function::erf::erfc;
use statrs::statistics::Statistics;

/// Arithmetic mean; 0 for an empty slice.
pub fn mean(x: &[f64]) -> f64 {
    if x.is_empty() {
        0.0
    } else {
        x.iter().mean()
    }
}

/// Sample variance (n - 1); 0 for fewer than two values.
pub fn sample_variance(x: &[f64]) -> f64 {
    if x.len() < 2 {
        0.0
    } else {
        x.iter().variance()
    }
}

pub fn sample_std(x: &[f64]) -> f64 {
    sample_variance(x).max(0.0).sqrt()
}

/// Population variance (n); 0 for an empty slice.
pub fn population_variance(x: &[f64]) -> f64 {
    if x.is_empty() {
        0.0
    } else {
        x.iter().population_variance()
    }
}

/// Pearson correlation; 0 when either side has no variance.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let ma = mean(&a[..n]);
    let mb = mean(&b[..n]);
    let mut sab = 0.0;
    let mut saa = 0.0;
    let mut sbb = 0.0;
    for i in 0..n {
        let da = a[i] - ma;
        let db = b[i] - mb;
        sab += da * db;
        saa += da * da;
        sbb += db * db;
    }
    if saa <= 0.0 || sbb <= 0.0 {
        return 0.0;
    }
    (sab / (saa * sbb).sqrt()).clamp(-1.0, 1.0)
}

/// Linear-interpolation percentile of an already sorted slice (`pct` in 0-100).
pub fn percentile_sorted(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = (pct.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

/// Percentile of an unsorted slice.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    percentile_sorted(&sorted, pct)
}

/// Standard normal CDF.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Standard normal quantile.
pub fn normal_quantile(p: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(n) => n.inverse_cdf(p.clamp(1e-15, 1.0 - 1e-15)),
        Err(_) => f64::NAN,
    }
}

/// Upper-tail probability of a chi-squared variate. `df == 0` returns 1.
pub fn chi_squared_sf(x: f64, df: usize) -> f64 {
    if df == 0 || !(x > 0.0) {
        return 1.0;
    }
    if !x.is_finite() {
        return 0.0;
    }
    match ChiSquared::new(df as f64) {
        Ok(dist) => (1.0 - dist.cdf(x)).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}

// =============================================================================
// KOLMOGOROV-SMIRNOV
// =============================================================================

/// Outcome of a two-sample KS test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KsOutcome {
    /// Maximum distance between the empirical CDFs.
    pub statistic: f64,
    /// Asymptotic p-value.
    pub p_value: f64,
    pub n_a: usize,
    pub n_b: usize,
}

/// Two-sample Kolmogorov-Smirnov test.
///
/// Ties are stepped over together so the CDFs are compared only at distinct
/// values. The p-value uses the Kolmogorov series with Stephens' effective
/// sample-size correction.
pub fn ks_two_sample(sample_a: &[f64], sample_b: &[f64]) -> KsOutcome {
    if sample_a.is_empty() || sample_b.is_empty() {
        return KsOutcome {
            statistic: 0.0,
            p_value: 1.0,
            n_a: sample_a.len(),
            n_b: sample_b.len(),
        };
    }

    let mut a = sample_a.to_vec();
    let mut b = sample_b.to_vec();
    a.sort_by(|x, y| x.total_cmp(y));
    b.sort_by(|x, y| x.total_cmp(y));

    let n_a = a.len() as f64;
    let n_b = b.len() as f64;
    let mut d_max: f64 = 0.0;
    let mut i = 0usize;
    let mut j = 0usize;

    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        d_max = d_max.max((i as f64 / n_a - j as f64 / n_b).abs());
    }

    let n_eff = (n_a * n_b) / (n_a + n_b);
    let lambda = (n_eff.sqrt() + 0.12 + 0.11 / n_eff.sqrt()) * d_max;

    KsOutcome {
        statistic: d_max,
        p_value: kolmogorov_sf(lambda),
        n_a: a.len(),
        n_b: b.len(),
    }
}

/// Survival function of the Kolmogorov distribution.
fn kolmogorov_sf(lambda: f64) -> f64 {
    if lambda < 0.2 {
        return 1.0;
    }
    let mut sum = 0.0;
    let mut sign = 1.0;
    for k in 1..=100 {
        let kf = k as f64;
        let term = (-2.0 * kf * kf * lambda * lambda).exp();
        sum += sign * term;
        if term < 1e-16 {
            break;
        }
        sign = -sign;
    }
    (2.0 * sum).clamp(0.0, 1.0)
}

// =============================================================================
// BOOTSTRAP INTERVALS
// =============================================================================

/// Percentile interval `[q(alpha/2), q(1 - alpha/2)]` of bootstrap replicates.
/// Returns `None` when there are no replicates.
pub fn percentile_interval(replicates: &[f64], confidence: f64) -> Option<(f64, f64)> {
    if replicates.is_empty() {
        return None;
    }
    let mut sorted = replicates.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let alpha = 1.0 - confidence;
    let lower = percentile_sorted(&sorted, 100.0 * alpha / 2.0);
    let upper = percentile_sorted(&sorted, 100.0 * (1.0 - alpha / 2.0));
    Some((lower.min(upper), upper.max(lower)))
}

// =============================================================================
// OLS
// =============================================================================

/// Ordinary least squares fit with intercept.
#[derive(Debug, Clone)]
pub struct OlsFit {
    /// Intercept first, then one coefficient per regressor column.
    pub coefficients: Vec<f64>,
    pub residuals: Vec<f64>,
    pub r_squared: f64,
}

fn design_matrix(regressors: &[Vec<f64>]) -> DMatrix<f64> {
    let n = regressors.len();
    let p = regressors.first().map(|r| r.len()).unwrap_or(0);
    DMatrix::from_fn(n, p + 1, |r, c| if c == 0 { 1.0 } else { regressors[r][c - 1] })
}

/// Fit `y = a + X b` by SVD least squares. Near-collinear regressors are
/// handled by the SVD's singular-value cutoff.
pub fn ols(y: &[f64], regressors: &[Vec<f64>]) -> OlsFit {
    let n = y.len();
    let x = design_matrix(regressors);
    let yv = DVector::from_column_slice(y);

    let coefficients = x
        .clone()
        .svd(true, true)
        .solve(&yv, 1e-12)
        .unwrap_or_else(|_| DVector::zeros(x.ncols()));

    let fitted = &x * &coefficients;
    let residuals: Vec<f64> = (0..n).map(|i| y[i] - fitted[i]).collect();

    let y_mean = mean(y);
    let sst: f64 = y.iter().map(|v| (v - y_mean).powi(2)).sum();
    let ssr: f64 = residuals.iter().map(|e| e * e).sum();
    let r_squared = if sst > 0.0 {
        (1.0 - ssr / sst).clamp(0.0, 1.0)
    } else {
        0.0
    };

    OlsFit {
        coefficients: coefficients.iter().copied().collect(),
        residuals,
        r_squared,
    }
}

/// Jarque-Bera normality test p-value.
pub fn jarque_bera_p(residuals: &[f64]) -> f64 {
    let n = residuals.len();
    if n < 3 {
        return 1.0;
    }
    let m = mean(residuals);
    let nf = n as f64;
    let m2 = residuals.iter().map(|e| (e - m).powi(2)).sum::<f64>() / nf;
    if m2 <= 0.0 {
        return 1.0;
    }
    let m3 = residuals.iter().map(|e| (e - m).powi(3)).sum::<f64>() / nf;
    let m4 = residuals.iter().map(|e| (e - m).powi(4)).sum::<f64>() / nf;
    let skew = m3 / m2.powf(1.5);
    let kurt = m4 / (m2 * m2);
    let jb = nf / 6.0 * (skew * skew + (kurt - 3.0).powi(2) / 4.0);
    chi_squared_sf(jb, 2)
}

/// Breusch-Pagan heteroscedasticity test p-value (`n * R^2` of the squared
/// residuals regressed on the original regressors).
pub fn breusch_pagan_p(residuals: &[f64], regressors: &[Vec<f64>]) -> f64 {
    let df = regressors.first().map(|r| r.len()).unwrap_or(0);
    if residuals.len() <= df + 1 || df == 0 {
        return 1.0;
    }
    let squared: Vec<f64> = residuals.iter().map(|e| e * e).collect();
    let aux = ols(&squared, regressors);
    chi_squared_sf(residuals.len() as f64 * aux.r_squared, df)
}
