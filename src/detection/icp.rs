//! Invariant Causal Prediction engine
//!
//! H0: the distribution of the target venue given the other venues is the
//! same in every environment.
//!
//! ```text
//! panel ──► log returns ──► partition by environment ──► drop small envs
//!                                   │
//!               ┌───────────────────┴───────────────────┐
//!               ▼                                       ▼
//!     per-env OLS residuals               per-env chunked pairwise correlations
//!               │                                       │
//!               └────► KS for every environment pair ◄──┘
//!                                   │
//!                 max D, min p  ──► Bonferroni ──► reject_h0
//! ```
//!
//! Effect size, power, a DKW band on D and a seeded bootstrap interval are
//! reported alongside. Benjamini-Hochberg adjusts the p-values produced in
//! one call.

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::detection::config::IcpConfig;
use crate::detection::error::{DetectionResult, ValidationError};
use crate::detection::fdr::benjamini_hochberg;
use crate::detection::panel::{Observations, PricePanel};
use crate::detection::seed::{DeterministicSeed, SeededRng};
use crate::detection::stats::{
    breusch_pagan_p, jarque_bera_p, ks_two_sample, mean, normal_cdf, normal_quantile, ols,
    pearson, percentile_interval, sample_variance,
};

/// Which distribution a KS comparison was run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonFamily {
    /// Chunked pairwise venue correlations.
    Correlation,
    /// OLS residuals of the target venue.
    Residual,
}

/// One KS test between two environments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairComparison {
    pub environment_a: String,
    pub environment_b: String,
    pub family: ComparisonFamily,
    pub statistic: f64,
    pub p_value: f64,
    pub n_a: usize,
    pub n_b: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BootstrapInterval {
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
    pub n_requested: usize,
    /// Resamples that passed validation; 0 yields the trivial [0, 1].
    pub n_successful: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IcpDiagnostics {
    /// Pooled OLS R-squared.
    pub r_squared: f64,
    /// Jarque-Bera p-value of the pooled residuals.
    pub residual_normality_p: f64,
    /// Breusch-Pagan p-value of the pooled residuals.
    pub heteroscedasticity_p: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcpResult {
    pub target_venue: String,
    /// Maximum KS statistic across all comparisons.
    pub test_statistic: f64,
    /// Bonferroni-corrected minimum p-value.
    pub p_value: f64,
    /// Minimum p-value before correction.
    pub raw_p_value: f64,
    pub n_comparisons: usize,
    pub reject_h0: bool,
    pub effect_size: f64,
    pub power: f64,
    /// Samples per environment for `target_power` at `min_detectable_effect`.
    pub required_sample_size: usize,
    pub n_environments: usize,
    pub environment_sizes: BTreeMap<String, usize>,
    pub confidence_interval: ConfidenceInterval,
    pub bootstrap_ci: Option<BootstrapInterval>,
    pub fdr_adjusted_p_value: f64,
    pub fdr_controlled: bool,
    pub diagnostics: IcpDiagnostics,
    pub comparisons: Vec<PairComparison>,
}

/// KS outcome over all environment pairs for one observation set.
struct InvarianceTest {
    statistic: f64,
    raw_p_value: f64,
    p_value: f64,
    /// Sizes of the samples behind the maximum statistic.
    max_pair: (usize, usize),
    comparisons: Vec<PairComparison>,
    groups: BTreeMap<String, Vec<usize>>,
}

pub struct IcpEngine {
    config: IcpConfig,
}

impl IcpEngine {
    pub fn new(config: IcpConfig) -> DetectionResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &IcpConfig {
        &self.config
    }

    /// Test invariance of the configured (or first) target venue.
    pub fn analyze_invariance(
        &self,
        panel: &PricePanel,
        venues: &[String],
        seed: u64,
    ) -> DetectionResult<IcpResult> {
        let target = match &self.config.target_venue {
            Some(t) => t.clone(),
            None => venues.first().cloned().unwrap_or_default(),
        };
        self.analyze_target(panel, venues, &target, seed)
    }

    /// One invariance test per target. The FDR fields are recomputed with
    /// Benjamini-Hochberg across the whole set.
    pub fn analyze_targets(
        &self,
        panel: &PricePanel,
        venues: &[String],
        targets: &[String],
        seed: u64,
    ) -> DetectionResult<Vec<IcpResult>> {
        let mut results = targets
            .iter()
            .map(|t| self.analyze_target(panel, venues, t, seed))
            .collect::<DetectionResult<Vec<_>>>()?;

        let p_values: Vec<f64> = results.iter().map(|r| r.p_value).collect();
        for (result, adjusted) in results.iter_mut().zip(benjamini_hochberg(&p_values)) {
            result.fdr_adjusted_p_value = adjusted;
            result.fdr_controlled = adjusted < self.config.fdr_level;
        }
        Ok(results)
    }

    /// Two-sided power of a two-sample test at effect size `d` with `n_avg`
    /// samples per group, clamped to [0.01, 0.99].
    pub fn statistical_power(&self, effect_size: f64, n_avg: f64) -> f64 {
        let z = normal_quantile(1.0 - self.config.significance_level / 2.0);
        let delta = effect_size.abs() * (n_avg.max(0.0) / 2.0).sqrt();
        let power = normal_cdf(delta - z) + normal_cdf(-delta - z);
        if power.is_finite() {
            power.clamp(0.01, 0.99)
        } else {
            0.01
        }
    }

    /// Samples per group needed to reach `target_power` at effect `mde`.
    pub fn required_sample_size(&self, min_detectable_effect: f64, target_power: f64) -> usize {
        let z_alpha = normal_quantile(1.0 - self.config.significance_level / 2.0);
        let z_power = normal_quantile(target_power);
        let n = 2.0 * ((z_alpha + z_power) / min_detectable_effect).powi(2);
        if n.is_finite() {
            n.ceil().max(2.0) as usize
        } else {
            usize::MAX
        }
    }

    fn analyze_target(
        &self,
        panel: &PricePanel,
        venues: &[String],
        target: &str,
        seed: u64,
    ) -> DetectionResult<IcpResult> {
        let indices = panel.venue_indices(venues)?;
        let target_col = venues.iter().position(|v| v == target).ok_or_else(|| {
            ValidationError::MissingColumns {
                missing: vec![target.to_string()],
            }
        })?;

        let obs = Observations::from_panel(
            panel,
            &indices,
            &self.config.environment_columns,
            self.config.price_transform,
        )?;
        let test = self.invariance_test(&obs, target_col)?;

        let kept_rows: Vec<usize> = test.groups.values().flatten().copied().collect();
        let (effect_size, diagnostics) = self.pooled_fit(&obs, &test.groups, &kept_rows, target_col);

        let environment_sizes: BTreeMap<String, usize> =
            test.groups.iter().map(|(k, rows)| (k.clone(), rows.len())).collect();
        let n_avg = kept_rows.len() as f64 / test.groups.len() as f64;
        let power = self.statistical_power(effect_size, n_avg);

        let (n_a, n_b) = test.max_pair;
        let confidence_interval = self.dkw_interval(test.statistic, n_a, n_b);
        let bootstrap_ci = self.bootstrap_interval(&obs, target_col, seed);

        let within_call: Vec<f64> = test.comparisons.iter().map(|c| c.p_value).collect();
        let fdr_adjusted_p_value = benjamini_hochberg(&within_call)
            .into_iter()
            .fold(1.0, f64::min);

        let reject_h0 = test.p_value < self.config.significance_level;
        tracing::info!(
            target = target,
            environments = test.groups.len(),
            statistic = test.statistic,
            p_value = test.p_value,
            reject_h0,
            "ICP invariance test"
        );

        Ok(IcpResult {
            target_venue: target.to_string(),
            test_statistic: test.statistic,
            p_value: test.p_value,
            raw_p_value: test.raw_p_value,
            n_comparisons: test.comparisons.len(),
            reject_h0,
            effect_size,
            power,
            required_sample_size: self.required_sample_size(
                self.config.min_detectable_effect,
                self.config.target_power,
            ),
            n_environments: test.groups.len(),
            environment_sizes,
            confidence_interval,
            bootstrap_ci,
            fdr_adjusted_p_value,
            fdr_controlled: fdr_adjusted_p_value < self.config.fdr_level,
            diagnostics,
            comparisons: test.comparisons,
        })
    }

    fn invariance_test(
        &self,
        obs: &Observations,
        target_col: usize,
    ) -> Result<InvarianceTest, ValidationError> {
        let groups = obs.partition(self.config.min_samples_per_env)?;

        let mut residuals: Vec<(&String, Vec<f64>)> = Vec::with_capacity(groups.len());
        let mut correlations: Vec<Vec<f64>> = Vec::with_capacity(groups.len());
        for (key, rows) in &groups {
            let (y, x) = split_target(obs, rows, target_col);
            residuals.push((key, ols(&y, &x).residuals));
            correlations.push(self.chunk_correlations(obs, rows));
        }

        let mut comparisons = Vec::new();
        for a in 0..residuals.len() {
            for b in a + 1..residuals.len() {
                let (env_a, res_a) = &residuals[a];
                let (env_b, res_b) = &residuals[b];
                if !correlations[a].is_empty() && !correlations[b].is_empty() {
                    let ks = ks_two_sample(&correlations[a], &correlations[b]);
                    comparisons.push(PairComparison {
                        environment_a: env_a.to_string(),
                        environment_b: env_b.to_string(),
                        family: ComparisonFamily::Correlation,
                        statistic: ks.statistic,
                        p_value: ks.p_value,
                        n_a: ks.n_a,
                        n_b: ks.n_b,
                    });
                }
                let ks = ks_two_sample(res_a, res_b);
                comparisons.push(PairComparison {
                    environment_a: env_a.to_string(),
                    environment_b: env_b.to_string(),
                    family: ComparisonFamily::Residual,
                    statistic: ks.statistic,
                    p_value: ks.p_value,
                    n_a: ks.n_a,
                    n_b: ks.n_b,
                });
            }
        }

        let mut statistic = 0.0;
        let mut max_pair = (0, 0);
        let mut raw_p_value: f64 = 1.0;
        for c in &comparisons {
            if c.statistic > statistic {
                statistic = c.statistic;
                max_pair = (c.n_a, c.n_b);
            }
            raw_p_value = raw_p_value.min(c.p_value);
        }
        let p_value = (raw_p_value * comparisons.len() as f64).clamp(0.0, 1.0);

        Ok(InvarianceTest {
            statistic,
            raw_p_value,
            p_value,
            max_pair,
            comparisons,
            groups,
        })
    }

    /// Signed pairwise correlations over consecutive, non-overlapping chunks
    /// of the environment's rows. A trailing partial chunk is ignored.
    fn chunk_correlations(&self, obs: &Observations, rows: &[usize]) -> Vec<f64> {
        let n_venues = obs.values.first().map(|r| r.len()).unwrap_or(0);
        let mut out = Vec::new();
        for chunk in rows.chunks_exact(self.config.correlation_window) {
            let columns: Vec<Vec<f64>> = (0..n_venues)
                .map(|i| chunk.iter().map(|&r| obs.values[r][i]).collect())
                .collect();
            for a in 0..n_venues {
                for b in a + 1..n_venues {
                    out.push(pearson(&columns[a], &columns[b]));
                }
            }
        }
        out
    }

    /// Pooled fit over all kept rows: effect size from per-environment
    /// residual means, plus residual diagnostics.
    fn pooled_fit(
        &self,
        obs: &Observations,
        groups: &BTreeMap<String, Vec<usize>>,
        kept_rows: &[usize],
        target_col: usize,
    ) -> (f64, IcpDiagnostics) {
        let (y, x) = split_target(obs, kept_rows, target_col);
        let fit = ols(&y, &x);

        let mut position = 0;
        let mut means = Vec::with_capacity(groups.len());
        let mut pooled_ss = 0.0;
        let mut pooled_df = 0.0;
        // kept_rows is the concatenation of the groups in key order
        for rows in groups.values() {
            let slice = &fit.residuals[position..position + rows.len()];
            position += rows.len();
            means.push(mean(slice));
            if slice.len() > 1 {
                pooled_ss += sample_variance(slice) * (slice.len() - 1) as f64;
                pooled_df += (slice.len() - 1) as f64;
            }
        }

        let pooled_sd = if pooled_df > 0.0 { (pooled_ss / pooled_df).sqrt() } else { 0.0 };
        let spread = means.iter().copied().fold(f64::NEG_INFINITY, f64::max)
            - means.iter().copied().fold(f64::INFINITY, f64::min);
        let effect_size = if pooled_sd > 0.0 && spread.is_finite() {
            (spread / pooled_sd).max(0.0)
        } else {
            0.0
        };

        let diagnostics = IcpDiagnostics {
            r_squared: fit.r_squared,
            residual_normality_p: jarque_bera_p(&fit.residuals),
            heteroscedasticity_p: breusch_pagan_p(&fit.residuals, &x),
        };
        (effect_size, diagnostics)
    }

    /// Dvoretzky-Kiefer-Wolfowitz band around a two-sample KS statistic.
    fn dkw_interval(&self, statistic: f64, n_a: usize, n_b: usize) -> ConfidenceInterval {
        let level = self.config.confidence_level;
        if n_a == 0 || n_b == 0 {
            return ConfidenceInterval { lower: 0.0, upper: 1.0, level };
        }
        let (n, m) = (n_a as f64, n_b as f64);
        let eps = ((2.0 / (1.0 - level)).ln() / 2.0 * (n + m) / (n * m)).sqrt();
        ConfidenceInterval {
            lower: (statistic - eps).clamp(0.0, 1.0),
            upper: (statistic + eps).clamp(0.0, 1.0),
            level,
        }
    }

    /// Percentile interval of the test statistic over seeded resamples of
    /// the rows. Resample `i` is seeded from `(seed, i)` only, so the result
    /// does not depend on thread scheduling.
    fn bootstrap_interval(
        &self,
        obs: &Observations,
        target_col: usize,
        seed: u64,
    ) -> Option<BootstrapInterval> {
        let n_requested = self.config.n_bootstrap;
        if n_requested == 0 {
            return None;
        }
        let stream = DeterministicSeed::new(seed).bootstrap;
        let n = obs.len();

        let replicates: Vec<Option<f64>> = (0..n_requested)
            .into_par_iter()
            .map(|i| {
                if n == 0 {
                    return None;
                }
                let mut rng = SeededRng::new(DeterministicSeed::indexed(stream, i as u64));
                let rows: Vec<usize> = (0..n).map(|_| rng.rng().gen_range(0..n)).collect();
                let resampled = obs.resample(&rows);
                self.invariance_test(&resampled, target_col)
                    .ok()
                    .map(|t| t.statistic)
            })
            .collect();

        Some(summarize_replicates(replicates, self.config.confidence_level))
    }
}

/// Percentile interval over the successful replicates; `[0, 1]` when none
/// succeeded.
fn summarize_replicates(replicates: Vec<Option<f64>>, level: f64) -> BootstrapInterval {
    let n_requested = replicates.len();
    let successful: Vec<f64> = replicates.into_iter().flatten().collect();
    let skipped = n_requested - successful.len();
    if skipped > 0 {
        tracing::debug!(skipped, n_requested, "bootstrap resamples failed validation");
    }

    let (lower, upper) = percentile_interval(&successful, level).unwrap_or((0.0, 1.0));
    BootstrapInterval {
        lower: lower.clamp(0.0, 1.0),
        upper: upper.clamp(0.0, 1.0),
        level,
        n_requested,
        n_successful: successful.len(),
    }
}

/// Target column and remaining regressors for the given rows.
fn split_target(obs: &Observations, rows: &[usize], target_col: usize) -> (Vec<f64>, Vec<Vec<f64>>) {
    let y = rows.iter().map(|&r| obs.values[r][target_col]).collect();
    let x = rows
        .iter()
        .map(|&r| {
            obs.values[r]
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != target_col)
                .map(|(_, v)| *v)
                .collect()
        })
        .collect();
    (y, x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_successful_resamples_gives_unit_interval() {
        let ci = summarize_replicates(vec![None; 25], 0.95);
        assert_eq!(ci.n_requested, 25);
        assert_eq!(ci.n_successful, 0);
        assert_eq!((ci.lower, ci.upper), (0.0, 1.0));
        assert_eq!(ci.level, 0.95);
    }

    #[test]
    fn test_failed_resamples_are_skipped() {
        let replicates = vec![Some(0.2), None, Some(0.4), None, Some(0.3)];
        let ci = summarize_replicates(replicates, 0.9);
        assert_eq!(ci.n_requested, 5);
        assert_eq!(ci.n_successful, 3);
        assert!(ci.lower >= 0.2 && ci.upper <= 0.4);
        assert!(ci.lower <= ci.upper);
    }

    #[test]
    fn test_interval_is_clamped_to_unit_range() {
        let ci = summarize_replicates(vec![Some(-0.5), Some(1.5)], 0.95);
        assert!(ci.lower >= 0.0 && ci.upper <= 1.0);
    }
}
