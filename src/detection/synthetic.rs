//! Seeded synthetic markets
//!
//! Geometric random walks per venue, optionally with one lead venue whose
//! lagged returns are mirrored by the others. All innovations are drawn up
//! front from one ChaCha8 stream, so the same seed yields the same noise at
//! every coordination strength and datasets differ only by the injected
//! coordination.

use rand::distributions::Distribution;
use statrs::distribution::Normal;

use crate::detection::error::{ConfigError, DetectionResult};
use crate::detection::panel::PricePanel;
use crate::detection::seed::{DeterministicSeed, SeededRng};

/// Label column written by the generator.
pub const REGIME_COLUMN: &str = "regime";

/// Column names and environment layout of a generated panel.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticMarket {
    pub n_venues: usize,
    pub n_steps: usize,
    /// Contiguous, equal-length regimes labelled `regime_0..`.
    pub n_environments: usize,
    /// Per-step return standard deviation.
    pub volatility: f64,
    pub base_price: f64,
    pub seed: u64,
}

impl Default for SyntheticMarket {
    fn default() -> Self {
        Self {
            n_venues: 4,
            n_steps: 2000,
            n_environments: 2,
            volatility: 0.001,
            base_price: 100.0,
            seed: 42,
        }
    }
}

/// Lead-follower mirroring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinationProfile {
    pub lead_venue: usize,
    /// Steps by which followers trail the lead.
    pub lag: usize,
    /// Mirroring strength in [0, 1].
    pub strength: f64,
    /// Scale strength by `e / (E - 1)` in environment `e`.
    pub environment_dependent: bool,
}

impl Default for CoordinationProfile {
    fn default() -> Self {
        Self {
            lead_venue: 0,
            lag: 5,
            strength: 0.8,
            environment_dependent: false,
        }
    }
}

impl SyntheticMarket {
    pub fn venue_names(&self) -> Vec<String> {
        (0..self.n_venues).map(|i| format!("venue_{}", i)).collect()
    }

    fn environment_of(&self, t: usize) -> usize {
        let block = self.n_steps.div_ceil(self.n_environments.max(1)).max(1);
        (t / block).min(self.n_environments.saturating_sub(1))
    }

    pub fn environment_labels(&self) -> Vec<String> {
        (0..self.n_steps)
            .map(|t| format!("regime_{}", self.environment_of(t)))
            .collect()
    }

    /// Independent random walks.
    pub fn competitive(&self) -> DetectionResult<PricePanel> {
        self.generate(None)
    }

    /// Followers mirror the lead venue's return `lag` steps earlier.
    pub fn coordinated(&self, profile: &CoordinationProfile) -> DetectionResult<PricePanel> {
        self.generate(Some(profile))
    }

    fn validate(&self, profile: Option<&CoordinationProfile>) -> Result<(), ConfigError> {
        if self.n_venues < 2 {
            return Err(ConfigError::new("synthetic.n_venues", self.n_venues, ">= 2"));
        }
        if self.n_environments < 1 {
            return Err(ConfigError::new("synthetic.n_environments", self.n_environments, ">= 1"));
        }
        if !(self.volatility > 0.0 && self.volatility.is_finite()) {
            return Err(ConfigError::new("synthetic.volatility", self.volatility, "finite and > 0"));
        }
        if !(self.base_price > 0.0 && self.base_price.is_finite()) {
            return Err(ConfigError::new("synthetic.base_price", self.base_price, "finite and > 0"));
        }
        if let Some(p) = profile {
            if p.lead_venue >= self.n_venues {
                return Err(ConfigError::new("coordination.lead_venue", p.lead_venue, "< n_venues"));
            }
            if !(0.0..=1.0).contains(&p.strength) {
                return Err(ConfigError::new("coordination.strength", p.strength, "in [0, 1]"));
            }
        }
        Ok(())
    }

    fn generate(&self, profile: Option<&CoordinationProfile>) -> DetectionResult<PricePanel> {
        self.validate(profile)?;
        let normal = Normal::new(0.0, 1.0)
            .map_err(|_| ConfigError::new("synthetic.volatility", self.volatility, "finite and > 0"))?;

        let seeds = DeterministicSeed::new(self.seed);
        let mut rng = SeededRng::new(seeds.synthetic);
        let noise: Vec<Vec<f64>> = (0..self.n_steps)
            .map(|_| {
                (0..self.n_venues)
                    .map(|_| normal.sample(rng.rng()) * self.volatility)
                    .collect()
            })
            .collect();

        let mut returns = noise.clone();
        if let Some(p) = profile {
            let denom = self.n_environments.saturating_sub(1).max(1) as f64;
            for t in p.lag..self.n_steps {
                let s = if p.environment_dependent {
                    p.strength * self.environment_of(t) as f64 / denom
                } else {
                    p.strength
                };
                let own = (1.0 - s * s).max(0.0).sqrt();
                let lead = returns[t - p.lag][p.lead_venue];
                for i in (0..self.n_venues).filter(|&i| i != p.lead_venue) {
                    returns[t][i] = s * lead + own * noise[t][i];
                }
            }
        }

        let columns = self
            .venue_names()
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let mut log_price = self.base_price.ln();
                let prices = (0..self.n_steps)
                    .map(|t| {
                        if t > 0 {
                            log_price += returns[t][i];
                        }
                        log_price.exp()
                    })
                    .collect();
                (name, prices)
            })
            .collect();

        let timestamps = (0..self.n_steps as i64).map(|t| 1_700_000_000 + t).collect();
        let panel = PricePanel::new(timestamps, columns)?
            .with_environment(REGIME_COLUMN, self.environment_labels())?;
        Ok(panel)
    }
}
