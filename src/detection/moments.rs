//! Moment calculator
//!
//! Coordination-sensitive statistics over per-step log returns
//! `r[t][i] = ln p[t][i] - ln p[t-1][i]`. Every moment is bounded to [0, 1]:
//!
//! | moment                 | formula                                                   |
//! |------------------------|-----------------------------------------------------------|
//! | arbitrage timing       | `min(mean_t std_i r[t][i] / volatility_cap, 1)`           |
//! | mirroring similarity   | mean over venue pairs of `abs(corr(r_a, r_b))`            |
//! | spread-floor dwell     | `1 / (1 + mean abs(r) / price_change_scale)`              |
//! | undercut asymmetry     | `(max sigma - min sigma) / (max sigma + min sigma)`       |
//! | undercut concentration | normalized Herfindahl over `sigma_i / sum sigma`           |
//! | venue volatility       | `min(sigma_i / volatility_cap, 1)` per venue               |
//! | pairwise correlation   | `abs(corr)` per venue pair, upper-triangle order           |
//!
//! Each moment also reports an invariance companion: the population variance
//! of its per-environment values, taken element-wise for the per-venue and
//! per-pair arrays. With a single environment every companion is exactly 0.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::detection::config::{MomentConfig, PriceTransform};
use crate::detection::error::{DetectionResult, ValidationError};
use crate::detection::panel::{Observations, PricePanel};
use crate::detection::stats::{mean, pearson, population_variance, sample_std};

/// Moment vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentName {
    ArbitrageTiming,
    MirroringSimilarity,
    SpreadFloorDwell,
    UndercutAsymmetry,
    UndercutConcentration,
    VenueVolatility,
    PairwiseCorrelation,
}

impl MomentName {
    /// Scalar moments, in the column order of `MomentMatrix`.
    pub const SCALARS: [MomentName; 5] = [
        MomentName::ArbitrageTiming,
        MomentName::MirroringSimilarity,
        MomentName::SpreadFloorDwell,
        MomentName::UndercutAsymmetry,
        MomentName::UndercutConcentration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ArbitrageTiming => "arbitrage_timing",
            Self::MirroringSimilarity => "mirroring_similarity",
            Self::SpreadFloorDwell => "spread_floor_dwell",
            Self::UndercutAsymmetry => "undercut_asymmetry",
            Self::UndercutConcentration => "undercut_concentration",
            Self::VenueVolatility => "venue_volatility",
            Self::PairwiseCorrelation => "pairwise_correlation",
        }
    }

    pub fn is_scalar(&self) -> bool {
        Self::SCALARS.contains(self)
    }
}

impl fmt::Display for MomentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A moment is either one number or one number per venue / venue pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MomentValue {
    Scalar(f64),
    Array(Vec<f64>),
}

impl MomentValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Array(_) => None,
        }
    }

    pub fn values(&self) -> &[f64] {
        match self {
            Self::Scalar(v) => std::slice::from_ref(v),
            Self::Array(v) => v,
        }
    }
}

/// Moment name -> value for one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentVector {
    pub environment: String,
    pub values: BTreeMap<MomentName, MomentValue>,
}

/// Typed moments of one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptoMoments {
    pub environment: String,
    /// Number of returns the moments were computed from.
    pub n_observations: usize,
    pub arbitrage_timing: f64,
    pub mirroring_similarity: f64,
    pub spread_floor_dwell: f64,
    pub undercut_asymmetry: f64,
    pub undercut_concentration: f64,
    pub venue_volatility: Vec<f64>,
    pub pairwise_correlation: Vec<f64>,
}

impl CryptoMoments {
    pub fn scalar(&self, name: MomentName) -> Option<f64> {
        match name {
            MomentName::ArbitrageTiming => Some(self.arbitrage_timing),
            MomentName::MirroringSimilarity => Some(self.mirroring_similarity),
            MomentName::SpreadFloorDwell => Some(self.spread_floor_dwell),
            MomentName::UndercutAsymmetry => Some(self.undercut_asymmetry),
            MomentName::UndercutConcentration => Some(self.undercut_concentration),
            MomentName::VenueVolatility | MomentName::PairwiseCorrelation => None,
        }
    }

    pub fn scalars(&self) -> [f64; 5] {
        [
            self.arbitrage_timing,
            self.mirroring_similarity,
            self.spread_floor_dwell,
            self.undercut_asymmetry,
            self.undercut_concentration,
        ]
    }

    pub fn to_vector(&self) -> MomentVector {
        let mut values: BTreeMap<MomentName, MomentValue> = MomentName::SCALARS
            .iter()
            .zip(self.scalars())
            .map(|(name, v)| (*name, MomentValue::Scalar(v)))
            .collect();
        values.insert(
            MomentName::VenueVolatility,
            MomentValue::Array(self.venue_volatility.clone()),
        );
        values.insert(
            MomentName::PairwiseCorrelation,
            MomentValue::Array(self.pairwise_correlation.clone()),
        );
        MomentVector {
            environment: self.environment.clone(),
            values,
        }
    }
}

/// Per-environment moments plus invariance companions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentReport {
    pub venues: Vec<String>,
    /// One entry per environment, in environment-key order.
    pub per_environment: Vec<CryptoMoments>,
    /// Variance of each scalar moment across environments.
    pub invariance: BTreeMap<MomentName, f64>,
    /// Element-wise variance of each array moment across environments.
    pub array_invariance: BTreeMap<MomentName, Vec<f64>>,
}

impl MomentReport {
    pub fn environment(&self, key: &str) -> Option<&CryptoMoments> {
        self.per_environment.iter().find(|m| m.environment == key)
    }

    pub fn vectors(&self) -> Vec<MomentVector> {
        self.per_environment.iter().map(|m| m.to_vector()).collect()
    }

    /// Scalar moment name -> per-environment values, the shape `GlobalScaler`
    /// fits and transforms.
    pub fn as_series(&self) -> BTreeMap<String, Vec<f64>> {
        MomentName::SCALARS
            .iter()
            .map(|name| {
                let series = self
                    .per_environment
                    .iter()
                    .filter_map(|m| m.scalar(*name))
                    .collect();
                (name.as_str().to_string(), series)
            })
            .collect()
    }
}

/// Rolling-window scalar moments, one row per timestep.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentMatrix {
    pub components: Vec<MomentName>,
    pub timestamps: Vec<i64>,
    pub environments: Vec<String>,
    /// `timestamps.len()` x `components.len()`.
    pub rows: DMatrix<f64>,
}

impl MomentMatrix {
    pub fn n_rows(&self) -> usize {
        self.rows.nrows()
    }

    pub fn n_components(&self) -> usize {
        self.rows.ncols()
    }

    pub fn column(&self, j: usize) -> Vec<f64> {
        self.rows.column(j).iter().copied().collect()
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components.iter().map(|c| c.as_str().to_string()).collect()
    }
}

/// Population variance across environments; 0 below two environments.
fn companion(values: &[f64]) -> f64 {
    if values.len() < 2 {
        0.0
    } else {
        population_variance(values)
    }
}

fn elementwise_companion(per_environment: &[CryptoMoments], name: MomentName) -> Vec<f64> {
    let arrays: Vec<&[f64]> = per_environment
        .iter()
        .map(|m| match name {
            MomentName::VenueVolatility => m.venue_volatility.as_slice(),
            _ => m.pairwise_correlation.as_slice(),
        })
        .collect();
    let width = arrays.first().map(|a| a.len()).unwrap_or(0);
    (0..width)
        .map(|i| {
            let values: Vec<f64> = arrays.iter().filter_map(|a| a.get(i).copied()).collect();
            companion(&values)
        })
        .collect()
}

// =============================================================================
// CALCULATOR
// =============================================================================

pub struct MomentCalculator {
    config: MomentConfig,
}

impl MomentCalculator {
    pub fn new(config: MomentConfig) -> DetectionResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MomentConfig {
        &self.config
    }

    /// Moments per environment of `env_column`, or one pooled vector when no
    /// column is given.
    pub fn compute(
        &self,
        panel: &PricePanel,
        venues: &[String],
        env_column: Option<&str>,
    ) -> DetectionResult<MomentReport> {
        let obs = self.observations(panel, venues, env_column, self.config.min_rows())?;

        let per_environment: Vec<CryptoMoments> = obs
            .groups()
            .into_iter()
            .map(|(key, rows)| {
                let returns: Vec<&[f64]> = rows.iter().map(|&r| obs.values[r].as_slice()).collect();
                self.summarize(key, &returns)
            })
            .collect();

        let invariance = MomentName::SCALARS
            .iter()
            .map(|name| {
                let values: Vec<f64> =
                    per_environment.iter().filter_map(|m| m.scalar(*name)).collect();
                (*name, companion(&values))
            })
            .collect();
        let array_invariance = [MomentName::VenueVolatility, MomentName::PairwiseCorrelation]
            .into_iter()
            .map(|name| (name, elementwise_companion(&per_environment, name)))
            .collect();

        tracing::debug!(
            venues = venues.len(),
            environments = per_environment.len(),
            "moments computed"
        );

        Ok(MomentReport {
            venues: venues.to_vec(),
            per_environment,
            invariance,
            array_invariance,
        })
    }

    /// Scalar moments over a rolling window of `window` returns ending at each
    /// step. The first row ends at return `window - 1`.
    pub fn moment_matrix(
        &self,
        panel: &PricePanel,
        venues: &[String],
        env_column: Option<&str>,
    ) -> DetectionResult<MomentMatrix> {
        let window = self.config.window;
        let required = self.config.min_rows().max(window + 1);
        let obs = self.observations(panel, venues, env_column, required)?;

        let n_returns = obs.len();
        let n_rows = n_returns + 1 - window;
        let mut rows = DMatrix::zeros(n_rows, MomentName::SCALARS.len());
        let mut timestamps = Vec::with_capacity(n_rows);
        let mut environments = Vec::with_capacity(n_rows);

        for (out, end) in (window - 1..n_returns).enumerate() {
            let returns: Vec<&[f64]> = obs.values[end + 1 - window..=end]
                .iter()
                .map(|r| r.as_slice())
                .collect();
            let m = self.summarize(String::new(), &returns);
            for (j, v) in m.scalars().iter().enumerate() {
                rows[(out, j)] = *v;
            }
            // return `end` spans panel rows end..end+1
            timestamps.push(panel.timestamps()[end + 1]);
            environments.push(obs.environments[end].clone());
        }

        Ok(MomentMatrix {
            components: MomentName::SCALARS.to_vec(),
            timestamps,
            environments,
            rows,
        })
    }

    fn observations(
        &self,
        panel: &PricePanel,
        venues: &[String],
        env_column: Option<&str>,
        required_rows: usize,
    ) -> Result<Observations, ValidationError> {
        let indices = panel.venue_indices(venues)?;
        if panel.n_rows() < required_rows {
            return Err(ValidationError::InsufficientRows {
                required: required_rows,
                found: panel.n_rows(),
            });
        }
        let env_columns: Vec<String> = env_column.map(|c| vec![c.to_string()]).unwrap_or_default();
        Observations::from_panel(panel, &indices, &env_columns, PriceTransform::LogReturns)
    }

    fn summarize(&self, environment: String, returns: &[&[f64]]) -> CryptoMoments {
        let n_venues = returns.first().map(|r| r.len()).unwrap_or(0);
        let columns: Vec<Vec<f64>> = (0..n_venues)
            .map(|i| returns.iter().map(|r| r[i]).collect())
            .collect();
        let sigmas: Vec<f64> = columns.iter().map(|c| sample_std(c)).collect();
        let cap = self.config.volatility_cap;

        let dispersion: Vec<f64> = returns.iter().map(|r| sample_std(r)).collect();
        let arbitrage_timing = (mean(&dispersion) / cap).min(1.0);

        let mut pairwise_correlation = Vec::new();
        for a in 0..n_venues {
            for b in a + 1..n_venues {
                pairwise_correlation.push(pearson(&columns[a], &columns[b]).abs());
            }
        }
        let mirroring_similarity = mean(&pairwise_correlation);

        let abs_moves: Vec<f64> = returns.iter().flat_map(|r| r.iter().map(|v| v.abs())).collect();
        let spread_floor_dwell = 1.0 / (1.0 + mean(&abs_moves) / self.config.price_change_scale);

        let max_sigma = sigmas.iter().copied().fold(0.0, f64::max);
        let min_sigma = sigmas.iter().copied().fold(f64::INFINITY, f64::min);
        let undercut_asymmetry = if max_sigma + min_sigma > 0.0 {
            (max_sigma - min_sigma) / (max_sigma + min_sigma)
        } else {
            0.0
        };

        let total: f64 = sigmas.iter().sum();
        let undercut_concentration = if total > 0.0 && n_venues > 1 {
            let hhi: f64 = sigmas.iter().map(|s| (s / total).powi(2)).sum();
            let floor = 1.0 / n_venues as f64;
            ((hhi - floor) / (1.0 - floor)).clamp(0.0, 1.0)
        } else {
            0.0
        };

        CryptoMoments {
            environment,
            n_observations: returns.len(),
            arbitrage_timing,
            mirroring_similarity,
            spread_floor_dwell,
            undercut_asymmetry,
            undercut_concentration,
            venue_volatility: sigmas.iter().map(|s| (s / cap).min(1.0)).collect(),
            pairwise_correlation,
        }
    }
}
