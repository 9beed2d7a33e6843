//! Coordination Detection Core
//!
//! Statistical evidence of algorithmic coordination among trading venues:
//! invariance of pricing relationships across market environments (ICP) and
//! stability of moment-implied structure over time (VMM).
//!
//! # Architecture
//!
//! ```text
//!                  PricePanel (venues x time, environment labels)
//!                                │
//!        ┌───────────────────────┼────────────────────────┐
//!        ▼                       ▼                        ▼
//! ┌──────────────┐      ┌────────────────┐       ┌────────────────┐
//! │ Moment       │      │ Moment matrix  │       │ ICP Engine     │
//! │ Calculator   │      │ (rolling)      │       │ KS per env pair│
//! └──────┬───────┘      └───────┬────────┘       │ bootstrap, FDR │
//!        ▼                      ▼                └───────┬────────┘
//! ┌──────────────┐      ┌────────────────┐               │
//! │ GlobalScaler │      │ Stabilizer     │               │
//! └──────┬───────┘      └───────┬────────┘               │
//!        │                      ▼                        │
//!        │              ┌────────────────┐               │
//!        │              │ HAC WeightMatrx│               │
//!        │              └───────┬────────┘               │
//!        │                      ▼                        │
//!        │              ┌────────────────┐               │
//!        │              │ VMM Engine     │               │
//!        │              │ Gauss-Newton   │               │
//!        │              └───────┬────────┘               │
//!        │                      │                        │
//!        └──────────┬───────────┴────────────────────────┘
//!                   ▼
//!            AnalysisBundle ──► CompositeScorer (downstream)
//!
//!   ProvenanceStore: seed ──► { stabilizer, W, scaler }  (create-if-absent)
//! ```
//!
//! # Determinism Guarantees
//!
//! - **RNG**: Seeded `ChaCha8Rng` only, one stream per stochastic step
//! - **Bootstrap**: resample `i` seeded from `(seed, i)`; thread count is irrelevant
//! - **Provenance**: a stored record is replayed, never refitted
//! - **Numerics**: all reductions outside the bootstrap run sequentially

pub mod analyzer;
pub mod config;
pub mod error;
pub mod fdr;
pub mod icp;
pub mod moments;
pub mod panel;
pub mod provenance;
pub mod provenance_store;
pub mod scaler;
pub mod seed;
pub mod stabilizer;
pub mod stats;
pub mod synthetic;
pub mod vmm;
pub mod weight;

#[cfg(test)]
mod moments_tests;
#[cfg(test)]
mod provenance_tests;
#[cfg(test)]
mod scaler_tests;
#[cfg(test)]
mod stabilizer_tests;

pub use analyzer::{AnalysisBundle, CompositeScorer, CoordinationAnalyzer};
pub use config::{
    IcpConfig, MomentConfig, PriceTransform, ProvenanceBackend, ScalerMethod, StabilizerConfig,
    StudyConfig, VmmConfig,
};
pub use error::{
    ConfigError, DetectionError, DetectionResult, ProvenanceError, ScalerError, ValidationError,
};
pub use icp::{
    BootstrapInterval, ComparisonFamily, ConfidenceInterval, IcpDiagnostics, IcpEngine, IcpResult,
    PairComparison,
};
pub use moments::{
    CryptoMoments, MomentCalculator, MomentMatrix, MomentName, MomentReport, MomentValue,
    MomentVector,
};
pub use panel::{PricePanel, POOLED_ENVIRONMENT};
pub use provenance::{
    open_store, InMemoryProvenanceStore, JsonFileProvenanceStore, ProvenanceRecord, ProvenanceStore,
    ReplayContext,
};
pub use provenance_store::SqliteProvenanceStore;
pub use scaler::{GlobalScaler, MomentScale, ScalerParams};
pub use seed::{DeterministicSeed, SeededRng};
pub use stabilizer::{StabilizedMomentMatrix, Stabilizer, StabilizerParams};
pub use synthetic::{CoordinationProfile, SyntheticMarket, REGIME_COLUMN};
pub use vmm::{
    ConvergenceStatus, ProvenanceUse, StabilizationSummary, StructuralParameters, VmmEngine,
    VmmOutput,
};
pub use weight::{default_hac_lag, hac_covariance, WeightMatrix, WeightMatrixMeta};
