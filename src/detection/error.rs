//! Error taxonomy for the detection core.
//!
//! Only validation failures are expected during well-formed operation.
//! Numerical degeneracy (zero-variance moments, ill-conditioned weight
//! matrices) is remediated in place and recorded on the result, and
//! non-convergence is reported through `ConvergenceStatus`.

use std::fmt;

/// Result alias used throughout the detection core.
pub type DetectionResult<T> = Result<T, DetectionError>;

/// Top-level error for every fallible operation in the core.
#[derive(Debug)]
pub enum DetectionError {
    /// Input data does not meet a precondition.
    Validation(ValidationError),
    /// A configuration field is outside its valid range.
    Config(ConfigError),
    /// Global scaler misuse.
    Scaler(ScalerError),
    /// Provenance storage or replay failure.
    Provenance(ProvenanceError),
}

impl fmt::Display for DetectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "Validation failed: {}", e),
            Self::Config(e) => write!(f, "Invalid configuration: {}", e),
            Self::Scaler(e) => write!(f, "Scaler error: {}", e),
            Self::Provenance(e) => write!(f, "Provenance error: {}", e),
        }
    }
}

impl std::error::Error for DetectionError {}

impl From<ValidationError> for DetectionError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<ConfigError> for DetectionError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<ScalerError> for DetectionError {
    fn from(e: ScalerError) -> Self {
        Self::Scaler(e)
    }
}

impl From<ProvenanceError> for DetectionError {
    fn from(e: ProvenanceError) -> Self {
        Self::Provenance(e)
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

/// A violated input precondition. Every variant names what was required and
/// by how much it was missed.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Fewer venue price columns than the analysis needs.
    InsufficientColumns { required: usize, found: usize },
    /// Requested columns that are not present in the panel.
    MissingColumns { missing: Vec<String> },
    /// Fewer rows than the analysis needs.
    InsufficientRows { required: usize, found: usize },
    /// Non-finite values (missing data) in a column.
    MissingData { column: String, count: usize },
    /// A column whose length differs from the timestamp index.
    LengthMismatch { column: String, expected: usize, found: usize },
    /// A price that cannot be log-transformed.
    NonPositivePrice { column: String, row: usize, value: f64 },
    /// Timestamps must be non-decreasing.
    UnorderedTimestamps { row: usize },
    /// An environment label that is empty.
    EmptyEnvironmentLabel { column: String, row: usize },
    /// Fewer usable environments than required.
    InsufficientEnvironments {
        required: usize,
        found: usize,
        min_samples: usize,
        sizes: Vec<(String, usize)>,
    },
    /// Every moment component was dropped as degenerate.
    NoUsableMoments { dropped: Vec<String> },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientColumns { required, found } => write!(
                f,
                "need at least {} venue price columns, got {} (short by {})",
                required,
                found,
                required.saturating_sub(*found)
            ),
            Self::MissingColumns { missing } => {
                write!(f, "columns not present in panel: {}", missing.join(", "))
            }
            Self::InsufficientRows { required, found } => write!(
                f,
                "need at least {} rows, got {} (short by {})",
                required,
                found,
                required.saturating_sub(*found)
            ),
            Self::MissingData { column, count } => {
                write!(f, "column '{}' has {} missing/non-finite values", column, count)
            }
            Self::LengthMismatch { column, expected, found } => write!(
                f,
                "column '{}' has {} rows, expected {}",
                column, found, expected
            ),
            Self::NonPositivePrice { column, row, value } => write!(
                f,
                "column '{}' row {} has non-positive price {}",
                column, row, value
            ),
            Self::UnorderedTimestamps { row } => {
                write!(f, "timestamp at row {} precedes the previous row", row)
            }
            Self::EmptyEnvironmentLabel { column, row } => {
                write!(f, "environment column '{}' has an empty label at row {}", column, row)
            }
            Self::InsufficientEnvironments { required, found, min_samples, sizes } => {
                let listed: Vec<String> =
                    sizes.iter().map(|(k, n)| format!("{}={}", k, n)).collect();
                write!(
                    f,
                    "need at least {} environments with >= {} samples, found {} [{}]",
                    required,
                    min_samples,
                    found,
                    listed.join(", ")
                )
            }
            Self::NoUsableMoments { dropped } => write!(
                f,
                "all moment components have degenerate variance: {}",
                dropped.join(", ")
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// A configuration field outside its documented range.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigError {
    pub field: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl ConfigError {
    pub fn new(field: &'static str, value: impl ToString, expected: &'static str) -> Self {
        Self {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {} (expected {})", self.field, self.value, self.expected)
    }
}

impl std::error::Error for ConfigError {}

// =============================================================================
// SCALER
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ScalerError {
    /// `transform` was called before `fit`.
    NotFitted,
    /// A moment name that the scaler was not fitted on.
    UnknownMoment(String),
    /// A moment series with no values was passed to `fit`.
    EmptySeries(String),
}

impl fmt::Display for ScalerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFitted => write!(f, "transform called before fit"),
            Self::UnknownMoment(name) => write!(f, "moment '{}' was not present at fit time", name),
            Self::EmptySeries(name) => write!(f, "moment '{}' has no values to fit", name),
        }
    }
}

impl std::error::Error for ScalerError {}

// =============================================================================
// PROVENANCE
// =============================================================================

#[derive(Debug)]
pub enum ProvenanceError {
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
    Io(std::io::Error),
    /// A stored record cannot be replayed against the current input.
    Incompatible {
        seed: u64,
        field: &'static str,
        stored: String,
        current: String,
    },
}

impl fmt::Display for ProvenanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Incompatible { seed, field, stored, current } => write!(
                f,
                "record for seed {} is incompatible: {} stored={} current={}",
                seed, field, stored, current
            ),
        }
    }
}

impl std::error::Error for ProvenanceError {}

impl From<rusqlite::Error> for ProvenanceError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for ProvenanceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

impl From<std::io::Error> for ProvenanceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
