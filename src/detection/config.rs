//! Analysis configuration
//!
//! Every engine validates its config when it is constructed, so a bad value
//! fails before any data is touched. A complete study can be loaded from TOML:
//!
//! ```toml
//! seed = 42
//! scaler = "robust"
//!
//! [icp]
//! significance_level = 0.05
//! n_bootstrap = 500
//! environment_columns = ["regime"]
//!
//! [vmm]
//! max_iterations = 1000
//! environment_column = "regime"
//!
//! [provenance]
//! backend = "json_dir"
//! dir = "provenance"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::detection::error::ConfigError;

fn check(ok: bool, field: &'static str, value: impl ToString, expected: &'static str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::new(field, value, expected))
    }
}

fn in_open_unit(x: f64) -> bool {
    x > 0.0 && x < 1.0
}

// =============================================================================
// MOMENTS
// =============================================================================

/// Moment calculator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentConfig {
    /// Longest lag the downstream analysis looks back; the panel must carry
    /// at least `max_lag + 10` rows.
    pub max_lag: usize,
    /// Rolling window (in returns) for per-timestep moments.
    pub window: usize,
    /// Return volatility that maps to 1.0 in the bounded moments.
    pub volatility_cap: f64,
    /// Mean absolute return at which spread-floor dwell equals 0.5.
    pub price_change_scale: f64,
}

impl Default for MomentConfig {
    fn default() -> Self {
        Self {
            max_lag: 5,
            window: 20,
            volatility_cap: 0.005,
            price_change_scale: 0.001,
        }
    }
}

impl MomentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(self.window >= 3, "moments.window", self.window, ">= 3")?;
        check(
            self.volatility_cap > 0.0 && self.volatility_cap.is_finite(),
            "moments.volatility_cap",
            self.volatility_cap,
            "finite and > 0",
        )?;
        check(
            self.price_change_scale > 0.0 && self.price_change_scale.is_finite(),
            "moments.price_change_scale",
            self.price_change_scale,
            "finite and > 0",
        )?;
        Ok(())
    }

    /// Minimum number of panel rows the calculator accepts.
    pub fn min_rows(&self) -> usize {
        self.max_lag + 10
    }
}

// =============================================================================
// STABILIZATION
// =============================================================================

/// Winsorize / center / scale / drop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    /// Lower winsorization percentile (0-100).
    pub lower_percentile: f64,
    /// Upper winsorization percentile (0-100).
    pub upper_percentile: f64,
    /// Columns whose winsorized standard deviation falls below this are dropped.
    pub min_std: f64,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            lower_percentile: 1.0,
            upper_percentile: 99.0,
            min_std: 1e-3,
        }
    }
}

impl StabilizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(
            self.lower_percentile >= 0.0 && self.lower_percentile < self.upper_percentile,
            "stabilizer.lower_percentile",
            self.lower_percentile,
            "0 <= lower < upper",
        )?;
        check(
            self.upper_percentile <= 100.0,
            "stabilizer.upper_percentile",
            self.upper_percentile,
            "<= 100",
        )?;
        check(self.min_std > 0.0, "stabilizer.min_std", self.min_std, "> 0")?;
        Ok(())
    }
}

// =============================================================================
// VMM
// =============================================================================

/// VMM estimator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmmConfig {
    pub max_iterations: usize,
    /// Stop once the loss improves by less than this.
    pub convergence_tolerance: f64,
    /// Ridge is added until the weight matrix condition number is at most this.
    pub max_condition_number: f64,
    /// HAC lag override; `None` uses `floor(4 (N/100)^(2/9))`.
    pub hac_lag: Option<usize>,
    /// Contiguous sub-windows used for the structural-stability score.
    pub stability_windows: usize,
    /// Seeded sub-sample refits used for the regime-confidence score.
    pub consistency_fits: usize,
    /// Fraction of timesteps in each consistency refit.
    pub subsample_fraction: f64,
    /// Environment label column splitting the mean conditions.
    pub environment_column: Option<String>,
    /// Minimum per-timestep moment rows.
    pub min_observations: usize,
    pub stabilizer: StabilizerConfig,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            convergence_tolerance: 1e-10,
            max_condition_number: 1e6,
            hac_lag: None,
            stability_windows: 4,
            consistency_fits: 8,
            subsample_fraction: 0.5,
            environment_column: None,
            min_observations: 50,
            stabilizer: StabilizerConfig::default(),
        }
    }
}

impl VmmConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(self.max_iterations >= 1, "vmm.max_iterations", self.max_iterations, ">= 1")?;
        check(
            self.convergence_tolerance > 0.0 && self.convergence_tolerance.is_finite(),
            "vmm.convergence_tolerance",
            self.convergence_tolerance,
            "finite and > 0",
        )?;
        check(
            self.max_condition_number > 1.0 && self.max_condition_number.is_finite(),
            "vmm.max_condition_number",
            self.max_condition_number,
            "finite and > 1",
        )?;
        check(
            self.stability_windows >= 2,
            "vmm.stability_windows",
            self.stability_windows,
            ">= 2",
        )?;
        check(
            self.consistency_fits >= 1,
            "vmm.consistency_fits",
            self.consistency_fits,
            ">= 1",
        )?;
        check(
            self.subsample_fraction > 0.0 && self.subsample_fraction <= 1.0,
            "vmm.subsample_fraction",
            self.subsample_fraction,
            "in (0, 1]",
        )?;
        check(
            self.min_observations >= 10,
            "vmm.min_observations",
            self.min_observations,
            ">= 10",
        )?;
        self.stabilizer.validate()
    }
}

// =============================================================================
// ICP
// =============================================================================

/// Series the invariance regression is fitted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceTransform {
    /// Per-step log returns (row 0 dropped).
    #[default]
    LogReturns,
    /// Raw price levels.
    Levels,
}

/// ICP invariance test configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcpConfig {
    pub significance_level: f64,
    pub n_bootstrap: usize,
    pub min_samples_per_env: usize,
    /// Label columns whose joined values define the environments.
    pub environment_columns: Vec<String>,
    /// Regression target; defaults to the first venue.
    pub target_venue: Option<String>,
    pub confidence_level: f64,
    pub fdr_level: f64,
    pub target_power: f64,
    pub min_detectable_effect: f64,
    /// Rows per non-overlapping correlation chunk.
    pub correlation_window: usize,
    pub price_transform: PriceTransform,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            significance_level: 0.05,
            n_bootstrap: 1000,
            min_samples_per_env: 30,
            environment_columns: vec!["regime".to_string()],
            target_venue: None,
            confidence_level: 0.95,
            fdr_level: 0.1,
            target_power: 0.8,
            min_detectable_effect: 0.2,
            correlation_window: 20,
            price_transform: PriceTransform::LogReturns,
        }
    }
}

impl IcpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(
            in_open_unit(self.significance_level),
            "icp.significance_level",
            self.significance_level,
            "in (0, 1)",
        )?;
        check(
            self.n_bootstrap <= 1_000_000,
            "icp.n_bootstrap",
            self.n_bootstrap,
            "<= 1000000",
        )?;
        check(
            self.min_samples_per_env >= 3,
            "icp.min_samples_per_env",
            self.min_samples_per_env,
            ">= 3",
        )?;
        check(
            !self.environment_columns.is_empty(),
            "icp.environment_columns",
            "[]",
            "at least one column",
        )?;
        check(
            in_open_unit(self.confidence_level),
            "icp.confidence_level",
            self.confidence_level,
            "in (0, 1)",
        )?;
        check(in_open_unit(self.fdr_level), "icp.fdr_level", self.fdr_level, "in (0, 1)")?;
        check(
            in_open_unit(self.target_power),
            "icp.target_power",
            self.target_power,
            "in (0, 1)",
        )?;
        check(
            self.min_detectable_effect > 0.0 && self.min_detectable_effect.is_finite(),
            "icp.min_detectable_effect",
            self.min_detectable_effect,
            "finite and > 0",
        )?;
        check(
            self.correlation_window >= 3,
            "icp.correlation_window",
            self.correlation_window,
            ">= 3",
        )?;
        Ok(())
    }
}

// =============================================================================
// STUDY
// =============================================================================

/// Moment scaling transform fitted once per study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalerMethod {
    MinMax,
    #[default]
    ZScore,
    /// Median / inter-quartile range.
    Robust,
}

/// Where provenance records live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ProvenanceBackend {
    Memory,
    JsonDir { dir: PathBuf },
    Sqlite { path: PathBuf },
}

impl Default for ProvenanceBackend {
    fn default() -> Self {
        Self::JsonDir {
            dir: PathBuf::from("provenance"),
        }
    }
}

/// A complete study: one seed, one scaler, one provenance backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    pub seed: u64,
    pub scaler: ScalerMethod,
    pub moments: MomentConfig,
    pub vmm: VmmConfig,
    pub icp: IcpConfig,
    pub provenance: ProvenanceBackend,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            scaler: ScalerMethod::default(),
            moments: MomentConfig::default(),
            vmm: VmmConfig::default(),
            icp: IcpConfig::default(),
            provenance: ProvenanceBackend::default(),
        }
    }
}

impl StudyConfig {
    /// Load from a TOML file and validate.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `COORDINATION_CONFIG_PATH` (or `coordination.toml`), falling
    /// back to defaults when the file is absent or invalid.
    pub fn from_env() -> Self {
        let path = std::env::var("COORDINATION_CONFIG_PATH")
            .unwrap_or_else(|_| "coordination.toml".to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default study config ({}): {}", path, e);
            Self::default()
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.moments.validate()?;
        self.vmm.validate()?;
        self.icp.validate()
    }
}
