//! Coordination Core Library
//!
//! ICP invariance testing, stabilized VMM estimation and the moment pipeline
//! that feeds them, with seed-keyed provenance for deterministic replay.

pub mod detection;
pub mod telemetry;

pub use detection::{
    AnalysisBundle, CompositeScorer, CoordinationAnalyzer, DetectionError, DetectionResult,
    IcpEngine, IcpResult, MomentCalculator, PricePanel, StudyConfig, VmmEngine, VmmOutput,
};
