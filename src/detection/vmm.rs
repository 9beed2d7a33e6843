//! VMM engine
//!
//! Stabilized method-of-moments estimation of the coordination structure.
//!
//! ```text
//!  ┌─────────┐   ┌───────────┐   ┌──────────────┐   ┌──────────┐   ┌──────────┐
//!  │ collect │──►│ stabilize │──►│ HAC weight W │──►│ optimize │──►│ diagnose │
//!  └─────────┘   └───────────┘   └──────────────┘   └──────────┘   └──────────┘
//!       ▲              │                 │                               │
//!       │              └──── frozen in ProvenanceRecord (per seed) ◄─────┘
//!  rolling moments
//! ```
//!
//! # Moment conditions
//!
//! For each timestep `t >= 1`, stabilized components `m[t][j]` and
//! environment shares `pi_e`:
//!
//! ```text
//! mean   (e, j):  1[e_t = e] * m[t][j] / pi_e  - beta
//! var    (j):     m[t][j]^2                    - sigma_j
//! autocov(j):     m[t][j] * m[t-1][j]          - rho_j * sigma_j
//! ```
//!
//! `theta = (beta, sigma_1..sigma_k, rho_1..rho_k)`. The variance and
//! autocovariance blocks are exactly identified, so the over-identification
//! degrees of freedom are `E * k - 1`. `beta` is the common level every
//! environment's moments must share; coordination that shifts moments in
//! some environments, or away from the reference, inflates `J = T * Q`.
//!
//! The condition series `h[t]` does not depend on `theta`, so the HAC
//! covariance, and therefore `W`, is fitted once on the reference data and
//! reused.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::detection::config::{MomentConfig, VmmConfig};
use crate::detection::error::{DetectionResult, ProvenanceError, ValidationError};
use crate::detection::moments::{MomentCalculator, MomentMatrix};
use crate::detection::panel::PricePanel;
use crate::detection::provenance::{
    ProvenanceRecord, ProvenanceStore, ReplayContext, PROVENANCE_VERSION,
};
use crate::detection::seed::{DeterministicSeed, SeededRng};
use crate::detection::stabilizer::{StabilizedMomentMatrix, Stabilizer};
use crate::detection::stats::{chi_squared_sf, mean, population_variance, sample_std};
use crate::detection::weight::{default_hac_lag, WeightMatrix, WeightMatrixMeta};

/// Smallest step fraction tried by the line search.
const MIN_STEP: f64 = 1e-10;
/// Levenberg damping relative to the Gauss-Newton diagonal.
const DAMPING: f64 = 1e-9;
/// Sub-windows and sub-samples shorter than this are not refitted.
const MIN_REFIT_ROWS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    Converged,
    MaxIterations,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralParameters {
    /// Common coordination level.
    pub beta: f64,
    /// Per retained component variance.
    pub sigma: Vec<f64>,
    /// Per retained component first-order persistence.
    pub rho: Vec<f64>,
}

impl StructuralParameters {
    fn from_theta(theta: &DVector<f64>, k: usize) -> Self {
        Self {
            beta: theta[0],
            sigma: (0..k).map(|j| theta[1 + j]).collect(),
            rho: (0..k).map(|j| theta[1 + k + j]).collect(),
        }
    }
}

/// Stabilization applied to this run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilizationSummary {
    pub valid_components: Vec<usize>,
    pub component_names: Vec<String>,
    pub dropped_components: Vec<String>,
}

/// How the provenance record was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceUse {
    pub seed: u64,
    /// True when this call fitted and stored the record.
    pub created: bool,
    /// Fingerprint of the dataset the record was fitted on.
    pub reference_fingerprint: String,
    /// True when the current panel is the reference panel.
    pub reference_dataset: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmmOutput {
    pub convergence_status: ConvergenceStatus,
    pub iterations: usize,
    pub final_loss: f64,
    pub parameters: StructuralParameters,
    pub structural_stability: f64,
    pub regime_confidence: f64,
    pub j_statistic: f64,
    pub j_p_value: f64,
    pub degrees_of_freedom: usize,
    /// Timesteps contributing moment conditions.
    pub n_observations: usize,
    pub stabilization: StabilizationSummary,
    pub weight: WeightMatrixMeta,
    pub provenance: ProvenanceUse,
}

// =============================================================================
// CONDITIONS
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Condition {
    Mean,
    Variance(usize),
    Autocovariance(usize),
}

/// Index layout of the `E * k + 2k` conditions.
struct ConditionLayout<'a> {
    environments: &'a [String],
    k: usize,
}

impl<'a> ConditionLayout<'a> {
    fn n_conditions(&self) -> usize {
        self.environments.len() * self.k + 2 * self.k
    }

    fn kind(&self, index: usize) -> Condition {
        let n_mean = self.environments.len() * self.k;
        if index < n_mean {
            Condition::Mean
        } else if index < n_mean + self.k {
            Condition::Variance(index - n_mean)
        } else {
            Condition::Autocovariance(index - n_mean - self.k)
        }
    }

    fn env_index(&self, key: &str) -> Option<usize> {
        self.environments.iter().position(|e| e == key)
    }

    /// Condition rows for `t = 1..n` of `data` using environment `shares`.
    fn rows(&self, data: &StabilizedMomentMatrix, shares: &[f64]) -> DMatrix<f64> {
        let n = data.n_rows();
        let k = self.k;
        let n_mean = self.environments.len() * k;
        let mut h = DMatrix::zeros(n.saturating_sub(1), self.n_conditions());
        for t in 1..n {
            let row = t - 1;
            if let Some(e) = self.env_index(&data.environments[t]) {
                if shares[e] > 0.0 {
                    for j in 0..k {
                        h[(row, e * k + j)] = data.data[(t, j)] / shares[e];
                    }
                }
            }
            for j in 0..k {
                let m = data.data[(t, j)];
                h[(row, n_mean + j)] = m * m;
                h[(row, n_mean + k + j)] = m * data.data[(t - 1, j)];
            }
        }
        h
    }

    /// Share of timesteps `1..n` in each environment.
    fn shares(&self, data: &StabilizedMomentMatrix) -> Vec<f64> {
        let mut counts = vec![0usize; self.environments.len()];
        for env in data.environments.iter().skip(1) {
            if let Some(e) = self.env_index(env) {
                counts[e] += 1;
            }
        }
        let total = data.n_rows().saturating_sub(1).max(1) as f64;
        counts.iter().map(|&c| c as f64 / total).collect()
    }

    /// Conditions that carry information for the given shares: mean
    /// conditions of absent environments are masked.
    fn active(&self, shares: &[f64]) -> Vec<usize> {
        (0..self.n_conditions())
            .filter(|&i| match self.kind(i) {
                Condition::Mean => shares[i / self.k] > 0.0,
                _ => true,
            })
            .collect()
    }
}

/// Sorted distinct environment keys of timesteps `1..n`.
fn environment_set(environments: &[String]) -> Vec<String> {
    let mut keys: Vec<String> = environments.iter().skip(1).cloned().collect();
    keys.sort();
    keys.dedup();
    keys
}

// =============================================================================
// OPTIMIZER
// =============================================================================

/// Quadratic moment-distance problem over a subset of conditions.
struct Objective<'a> {
    layout: &'a ConditionLayout<'a>,
    active: Vec<usize>,
    h_bar: DVector<f64>,
    weight: DMatrix<f64>,
}

struct Fit {
    theta: DVector<f64>,
    loss: f64,
    iterations: usize,
    status: ConvergenceStatus,
}

impl<'a> Objective<'a> {
    fn new(layout: &'a ConditionLayout<'a>, h: &DMatrix<f64>, active: Vec<usize>, weight: DMatrix<f64>) -> Self {
        let h_bar = DVector::from_iterator(
            active.len(),
            active.iter().map(|&i| h.column(i).mean()),
        );
        Self { layout, active, h_bar, weight }
    }

    fn residual(&self, theta: &DVector<f64>) -> DVector<f64> {
        let k = self.layout.k;
        DVector::from_iterator(
            self.active.len(),
            self.active.iter().enumerate().map(|(a, &i)| {
                let implied = match self.layout.kind(i) {
                    Condition::Mean => theta[0],
                    Condition::Variance(j) => theta[1 + j],
                    Condition::Autocovariance(j) => theta[1 + k + j] * theta[1 + j],
                };
                self.h_bar[a] - implied
            }),
        )
    }

    fn loss(&self, theta: &DVector<f64>) -> f64 {
        let r = self.residual(theta);
        (r.transpose() * &self.weight * &r)[(0, 0)]
    }

    /// Jacobian of the implied moments with respect to theta.
    fn jacobian(&self, theta: &DVector<f64>) -> DMatrix<f64> {
        let k = self.layout.k;
        let mut jac = DMatrix::zeros(self.active.len(), 1 + 2 * k);
        for (a, &i) in self.active.iter().enumerate() {
            match self.layout.kind(i) {
                Condition::Mean => jac[(a, 0)] = 1.0,
                Condition::Variance(j) => jac[(a, 1 + j)] = 1.0,
                Condition::Autocovariance(j) => {
                    jac[(a, 1 + j)] = theta[1 + k + j];
                    jac[(a, 1 + k + j)] = theta[1 + j];
                }
            }
        }
        jac
    }

    /// Damped Gauss-Newton with backtracking.
    fn minimize(&self, init: DVector<f64>, max_iterations: usize, tolerance: f64) -> Fit {
        let mut theta = init;
        let mut loss = self.loss(&theta);
        if !loss.is_finite() {
            return Fit { theta, loss, iterations: 0, status: ConvergenceStatus::MaxIterations };
        }

        let mut status = ConvergenceStatus::MaxIterations;
        let mut iterations = 0;
        for iter in 1..=max_iterations {
            iterations = iter;
            let jac = self.jacobian(&theta);
            let r = self.residual(&theta);
            let jtw = jac.transpose() * &self.weight;
            let mut normal = &jtw * &jac;
            let scale = normal.diagonal().max().max(1e-12);
            for d in 0..normal.nrows() {
                normal[(d, d)] += DAMPING * scale;
            }
            let gradient = &jtw * &r;
            let step = match normal.lu().solve(&gradient) {
                Some(s) => s,
                None => break,
            };

            let mut alpha = 1.0;
            let mut accepted = None;
            let mut diverged = false;
            while alpha >= MIN_STEP {
                let candidate = &theta + &step * alpha;
                let candidate_loss = self.loss(&candidate);
                if !candidate_loss.is_finite() {
                    diverged = true;
                } else if candidate_loss < loss {
                    accepted = Some((candidate, candidate_loss));
                    break;
                }
                alpha *= 0.5;
            }

            match accepted {
                Some((candidate, candidate_loss)) => {
                    let improvement = loss - candidate_loss;
                    theta = candidate;
                    loss = candidate_loss;
                    if improvement < tolerance {
                        status = ConvergenceStatus::Converged;
                        break;
                    }
                }
                None if diverged => {
                    tracing::warn!(iteration = iter, "non-finite loss; keeping last finite estimate");
                    break;
                }
                None => {
                    // no descent direction left: stationary point
                    status = ConvergenceStatus::Converged;
                    break;
                }
            }
        }

        Fit { theta, loss, iterations, status }
    }
}

fn initial_theta(k: usize, rng: &mut SeededRng) -> DVector<f64> {
    let mut theta = DVector::zeros(1 + 2 * k);
    theta[0] = rng.rng().gen_range(-0.1..0.1);
    for j in 0..k {
        theta[1 + j] = 1.0 + rng.rng().gen_range(-0.1..0.1);
        theta[1 + k + j] = 0.5 + rng.rng().gen_range(-0.1..0.1);
    }
    theta
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct VmmEngine {
    config: VmmConfig,
    calculator: MomentCalculator,
}

impl VmmEngine {
    pub fn new(config: VmmConfig, moments: MomentConfig) -> DetectionResult<Self> {
        config.validate()?;
        let calculator = MomentCalculator::new(moments)?;
        Ok(Self { config, calculator })
    }

    pub fn config(&self) -> &VmmConfig {
        &self.config
    }

    /// Load the record for `seed`, or fit and store it, then estimate with
    /// the stored record. A writer that loses a race replays the winner.
    pub fn estimate(
        &self,
        panel: &PricePanel,
        venues: &[String],
        seed: u64,
        store: &dyn ProvenanceStore,
    ) -> DetectionResult<VmmOutput> {
        let (record, created) = match store.load(seed)? {
            Some(record) => {
                tracing::info!(seed, "reusing provenance record");
                (record, false)
            }
            None => {
                let fitted = self.fit_provenance(panel, venues, seed)?;
                let stored = store.create_if_absent(&fitted)?;
                let created = stored == fitted;
                (stored, created)
            }
        };
        let mut output = self.estimate_with_provenance(panel, venues, &record)?;
        output.provenance.created = created;
        Ok(output)
    }

    /// Fit and estimate without persisting anything.
    pub fn estimate_fresh(
        &self,
        panel: &PricePanel,
        venues: &[String],
        seed: u64,
    ) -> DetectionResult<VmmOutput> {
        let record = self.fit_provenance(panel, venues, seed)?;
        let mut output = self.estimate_with_provenance(panel, venues, &record)?;
        output.provenance.created = true;
        Ok(output)
    }

    /// Collect moments, fit the stabilizer and the weight matrix.
    pub fn fit_provenance(
        &self,
        panel: &PricePanel,
        venues: &[String],
        seed: u64,
    ) -> DetectionResult<ProvenanceRecord> {
        let matrix = self.collect(panel, venues)?;
        let stabilizer = Stabilizer::new(self.config.stabilizer.clone()).fit(&matrix);
        if stabilizer.valid_components.is_empty() {
            return Err(ValidationError::NoUsableMoments {
                dropped: stabilizer.dropped_names(),
            }
            .into());
        }
        let stabilized = Stabilizer::apply(&stabilizer, &matrix);

        let environments = environment_set(&stabilized.environments);
        let layout = ConditionLayout {
            environments: &environments,
            k: stabilized.n_components(),
        };
        let shares = layout.shares(&stabilized);
        let h = layout.rows(&stabilized, &shares);
        let lag = self.config.hac_lag.unwrap_or_else(|| default_hac_lag(h.nrows()));
        let weight = WeightMatrix::estimate(&h, layout.k, lag, self.config.max_condition_number);

        tracing::info!(
            seed,
            k = layout.k,
            environments = environments.len(),
            hac_lag = lag,
            ridge_lambda = weight.meta.ridge_lambda,
            condition_number = weight.meta.condition_number,
            "fitted provenance"
        );

        Ok(ProvenanceRecord {
            version: PROVENANCE_VERSION,
            seed,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            dataset_fingerprint: panel.fingerprint(),
            config_fingerprint: self.config_fingerprint(seed)?,
            venues: venues.to_vec(),
            environment_column: self.config.environment_column.clone(),
            environments,
            environment_shares: shares,
            stabilizer,
            weight_meta: weight.meta.clone(),
            weight_matrix: weight.to_row_major(),
            moment_scaler: None,
        })
    }

    /// Estimate with frozen stabilization and weights from `record`.
    pub fn estimate_with_provenance(
        &self,
        panel: &PricePanel,
        venues: &[String],
        record: &ProvenanceRecord,
    ) -> DetectionResult<VmmOutput> {
        let matrix = self.collect(panel, venues)?;
        let k = record.stabilizer.valid_components.len();
        if k == 0 {
            return Err(ValidationError::NoUsableMoments {
                dropped: record.stabilizer.dropped_names(),
            }
            .into());
        }

        let layout = ConditionLayout {
            environments: &record.environments,
            k,
        };
        let config_fingerprint = self.config_fingerprint(record.seed)?;
        let current = ReplayContext {
            venues,
            environment_column: self.config.environment_column.as_deref(),
            config_fingerprint: &config_fingerprint,
        };
        record.check_compatible(
            &current,
            &matrix.component_names(),
            &environment_set(&matrix.environments),
            layout.n_conditions(),
        )?;
        let weight = record.weight()?;
        let stabilized = Stabilizer::apply(&record.stabilizer, &matrix);

        let h = layout.rows(&stabilized, &record.environment_shares);
        let objective = Objective::new(&layout, &h, layout.active(&record.environment_shares), weight.matrix.clone());

        let seeds = DeterministicSeed::new(record.seed);
        let mut rng = SeededRng::new(seeds.optimizer);
        let fit = objective.minimize(
            initial_theta(k, &mut rng),
            self.config.max_iterations,
            self.config.convergence_tolerance,
        );
        if fit.status == ConvergenceStatus::MaxIterations {
            tracing::warn!(iterations = fit.iterations, loss = fit.loss, "VMM did not converge");
        }

        let t = h.nrows();
        let final_loss = if fit.loss.is_finite() { fit.loss.max(0.0) } else { 0.0 };
        let degrees_of_freedom = (record.environments.len() * k).saturating_sub(1);
        let j_statistic = t as f64 * final_loss;
        let j_p_value = chi_squared_sf(j_statistic, degrees_of_freedom).clamp(0.0, 1.0);

        let structural_stability = self.structural_stability(&layout, &stabilized, &weight, &seeds);
        let regime_confidence = self.regime_confidence(&layout, &stabilized, &weight, &seeds);

        Ok(VmmOutput {
            convergence_status: fit.status,
            iterations: fit.iterations,
            final_loss,
            parameters: StructuralParameters::from_theta(&fit.theta, k),
            structural_stability,
            regime_confidence,
            j_statistic,
            j_p_value,
            degrees_of_freedom,
            n_observations: t,
            stabilization: StabilizationSummary {
                valid_components: stabilized.valid_components.clone(),
                component_names: stabilized.component_names.clone(),
                dropped_components: record.stabilizer.dropped_names(),
            },
            weight: weight.meta.clone(),
            provenance: ProvenanceUse {
                seed: record.seed,
                created: false,
                reference_fingerprint: record.dataset_fingerprint.clone(),
                reference_dataset: record.dataset_fingerprint == panel.fingerprint(),
            },
        })
    }

    fn collect(&self, panel: &PricePanel, venues: &[String]) -> DetectionResult<MomentMatrix> {
        let matrix = self.calculator.moment_matrix(
            panel,
            venues,
            self.config.environment_column.as_deref(),
        )?;
        if matrix.n_rows() < self.config.min_observations {
            return Err(ValidationError::InsufficientRows {
                required: self.config.min_observations,
                found: matrix.n_rows(),
            }
            .into());
        }
        Ok(matrix)
    }

    fn config_fingerprint(&self, seed: u64) -> DetectionResult<String> {
        let text = serde_json::to_string(&(seed, self.calculator.config(), &self.config))
            .map_err(ProvenanceError::from)?;
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Refit on `data` using locally computed shares and the matching
    /// principal submatrix of `weight`.
    fn refit(
        &self,
        layout: &ConditionLayout<'_>,
        data: &StabilizedMomentMatrix,
        weight: &WeightMatrix,
        rng: &mut SeededRng,
    ) -> Option<Fit> {
        if data.n_rows() < MIN_REFIT_ROWS {
            return None;
        }
        let shares = layout.shares(data);
        let h = layout.rows(data, &shares);
        let active = layout.active(&shares);
        let sub_weight = weight.submatrix(&active);
        let objective = Objective::new(layout, &h, active, sub_weight);
        let fit = objective.minimize(
            initial_theta(layout.k, rng),
            self.config.max_iterations,
            self.config.convergence_tolerance,
        );
        fit.theta.iter().all(|v| v.is_finite()).then_some(fit)
    }

    /// `1 / (1 + mean parameter variance across contiguous sub-windows)`.
    fn structural_stability(
        &self,
        layout: &ConditionLayout<'_>,
        data: &StabilizedMomentMatrix,
        weight: &WeightMatrix,
        seeds: &DeterministicSeed,
    ) -> f64 {
        let n = data.n_rows();
        let windows = self.config.stability_windows;
        let mut rng = SeededRng::new(seeds.optimizer);
        let estimates: Vec<DVector<f64>> = (0..windows)
            .filter_map(|w| {
                let start = w * n / windows;
                let end = (w + 1) * n / windows;
                self.refit(layout, &data.slice_rows(start, end), weight, &mut rng)
                    .map(|f| f.theta)
            })
            .collect();
        if estimates.len() < 2 {
            return 0.0;
        }

        let p = estimates[0].len();
        let variances: Vec<f64> = (0..p)
            .map(|i| {
                let values: Vec<f64> = estimates.iter().map(|theta| theta[i]).collect();
                population_variance(&values)
            })
            .collect();
        (1.0 / (1.0 + mean(&variances))).clamp(0.0, 1.0)
    }

    /// `converged fraction * exp(-std(beta))` over seeded contiguous
    /// sub-sample refits.
    fn regime_confidence(
        &self,
        layout: &ConditionLayout<'_>,
        data: &StabilizedMomentMatrix,
        weight: &WeightMatrix,
        seeds: &DeterministicSeed,
    ) -> f64 {
        let n = data.n_rows();
        let len = ((n as f64 * self.config.subsample_fraction).ceil() as usize).clamp(1, n.max(1));
        let mut betas = Vec::new();
        let mut converged = 0usize;
        let mut attempted = 0usize;

        for i in 0..self.config.consistency_fits {
            let mut rng = SeededRng::new(DeterministicSeed::indexed(seeds.subsample, i as u64));
            let start = if n > len { rng.rng().gen_range(0..=n - len) } else { 0 };
            let sample = data.slice_rows(start, start + len);
            attempted += 1;
            if let Some(fit) = self.refit(layout, &sample, weight, &mut rng) {
                if fit.status == ConvergenceStatus::Converged {
                    converged += 1;
                }
                betas.push(fit.theta[0]);
            }
        }

        if attempted == 0 || betas.is_empty() {
            return 0.0;
        }
        let converged_fraction = converged as f64 / attempted as f64;
        let dispersion = if betas.len() > 1 { sample_std(&betas) } else { 0.0 };
        (converged_fraction * (-dispersion).exp()).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pooled() -> Vec<String> {
        vec!["all".to_string()]
    }

    fn theta(beta: f64, sigma: f64, rho: f64) -> DVector<f64> {
        DVector::from_vec(vec![beta, sigma, rho])
    }

    #[test]
    fn test_exactly_identified_problem_converges() {
        let envs = pooled();
        let layout = ConditionLayout { environments: &envs, k: 1 };
        let h = DMatrix::from_row_slice(1, 3, &[0.2, 2.0, 1.0]);
        let objective = Objective::new(&layout, &h, vec![0, 1, 2], DMatrix::identity(3, 3));

        let fit = objective.minimize(theta(0.0, 1.0, 0.5), 100, 1e-14);
        assert_eq!(fit.status, ConvergenceStatus::Converged);
        assert!((fit.theta[0] - 0.2).abs() < 1e-4);
        assert!((fit.theta[1] - 2.0).abs() < 1e-4);
        assert!((fit.theta[2] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_overflowing_steps_keep_last_finite_estimate() {
        let envs = pooled();
        let layout = ConditionLayout { environments: &envs, k: 1 };
        // finite starting loss, but every step toward sigma = 1e150 overflows
        let h = DMatrix::from_row_slice(1, 3, &[0.0, 1e150, 0.0]);
        let objective = Objective::new(&layout, &h, vec![0, 1, 2], DMatrix::identity(3, 3));

        let init = theta(0.0, 1.0, 0.5);
        let fit = objective.minimize(init.clone(), 50, 1e-10);
        assert_eq!(fit.status, ConvergenceStatus::MaxIterations);
        assert_eq!(fit.iterations, 1);
        assert!(fit.loss.is_finite());
        assert!(fit.theta.iter().all(|v| v.is_finite()));
        assert_eq!(fit.theta, init);
    }

    #[test]
    fn test_non_finite_starting_loss_returns_immediately() {
        let envs = pooled();
        let layout = ConditionLayout { environments: &envs, k: 1 };
        let h = DMatrix::from_row_slice(1, 3, &[0.0, 1e200, 0.0]);
        let objective = Objective::new(&layout, &h, vec![0, 1, 2], DMatrix::identity(3, 3));

        let init = theta(0.0, 1.0, 0.5);
        let fit = objective.minimize(init.clone(), 50, 1e-10);
        assert_eq!(fit.status, ConvergenceStatus::MaxIterations);
        assert_eq!(fit.iterations, 0);
        assert!(!fit.loss.is_finite());
        assert!(fit.theta.iter().all(|v| v.is_finite()));
        assert_eq!(fit.theta, init);
    }

    #[test]
    fn test_condition_layout_masks_absent_environments() {
        let envs = vec!["regime_0".to_string(), "regime_1".to_string()];
        let layout = ConditionLayout { environments: &envs, k: 2 };
        assert_eq!(layout.n_conditions(), 8);
        assert!(matches!(layout.kind(3), Condition::Mean));
        assert!(matches!(layout.kind(4), Condition::Variance(0)));
        assert!(matches!(layout.kind(7), Condition::Autocovariance(1)));
        assert_eq!(layout.active(&[0.0, 1.0]), vec![2, 3, 4, 5, 6, 7]);
    }
}
