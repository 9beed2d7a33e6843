//! Provenance records and stores
//!
//! A record freezes everything needed to replay an analysis for one seed:
//! stabilizer bounds and scales, the HAC weight matrix and its metadata,
//! environment shares, and optionally the global scaler. Stores are
//! fit-once, read-many: `create_if_absent` never overwrites, and a writer
//! that loses a race gets the winner's record back.
//!
//! Backends:
//! - `InMemoryProvenanceStore` (tests, single process)
//! - `JsonFileProvenanceStore` (one `provenance_seed_<seed>.json` per seed)
//! - `SqliteProvenanceStore` (see `provenance_store`)

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::detection::config::ProvenanceBackend;
use crate::detection::error::ProvenanceError;
use crate::detection::provenance_store::SqliteProvenanceStore;
use crate::detection::scaler::ScalerParams;
use crate::detection::stabilizer::StabilizerParams;
use crate::detection::weight::{WeightMatrix, WeightMatrixMeta};

/// Record layout version.
pub const PROVENANCE_VERSION: u32 = 1;

/// Everything needed to replay a VMM fit without refitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub version: u32,
    pub seed: u64,
    pub created_at_ms: i64,
    /// SHA-256 of the reference panel.
    pub dataset_fingerprint: String,
    /// SHA-256 of the moment and VMM configuration.
    pub config_fingerprint: String,
    pub venues: Vec<String>,
    pub environment_column: Option<String>,
    /// Environment keys of the mean conditions, in condition order.
    pub environments: Vec<String>,
    /// Reference share of timesteps per environment.
    pub environment_shares: Vec<f64>,
    pub stabilizer: StabilizerParams,
    pub weight_meta: WeightMatrixMeta,
    /// Row-major `n_conditions x n_conditions`.
    pub weight_matrix: Vec<f64>,
    pub moment_scaler: Option<ScalerParams>,
}

impl ProvenanceRecord {
    pub fn file_name(seed: u64) -> String {
        format!("provenance_seed_{}.json", seed)
    }

    pub fn weight(&self) -> Result<WeightMatrix, ProvenanceError> {
        WeightMatrix::from_row_major(self.weight_meta.clone(), &self.weight_matrix).ok_or_else(
            || ProvenanceError::Incompatible {
                seed: self.seed,
                field: "weight_matrix",
                stored: self.weight_matrix.len().to_string(),
                current: (self.weight_meta.n_conditions * self.weight_meta.n_conditions)
                    .to_string(),
            },
        )
    }

    /// Load-and-compare: the stored transforms can only be replayed against
    /// the same venues and configuration, on data with the same components
    /// and environments.
    pub fn check_compatible(
        &self,
        current: &ReplayContext<'_>,
        component_names: &[String],
        environments: &[String],
        n_conditions: usize,
    ) -> Result<(), ProvenanceError> {
        if self.venues != current.venues {
            return Err(self.incompatible("venues", &self.venues, current.venues));
        }
        if self.environment_column.as_deref() != current.environment_column {
            return Err(ProvenanceError::Incompatible {
                seed: self.seed,
                field: "environment_column",
                stored: format!("{:?}", self.environment_column),
                current: format!("{:?}", current.environment_column),
            });
        }
        if self.config_fingerprint != current.config_fingerprint {
            return Err(ProvenanceError::Incompatible {
                seed: self.seed,
                field: "config_fingerprint",
                stored: self.config_fingerprint.clone(),
                current: current.config_fingerprint.to_string(),
            });
        }
        if self.stabilizer.component_names != component_names {
            return Err(self.incompatible(
                "component_names",
                &self.stabilizer.component_names,
                component_names,
            ));
        }
        if self.environments != environments {
            return Err(self.incompatible("environments", &self.environments, environments));
        }
        if self.weight_meta.n_conditions != n_conditions {
            return Err(ProvenanceError::Incompatible {
                seed: self.seed,
                field: "n_conditions",
                stored: self.weight_meta.n_conditions.to_string(),
                current: n_conditions.to_string(),
            });
        }
        Ok(())
    }

    fn incompatible(&self, field: &'static str, stored: &[String], current: &[String]) -> ProvenanceError {
        ProvenanceError::Incompatible {
            seed: self.seed,
            field,
            stored: format!("[{}]", stored.join(", ")),
            current: format!("[{}]", current.join(", ")),
        }
    }
}

/// What the caller is about to replay a record against.
#[derive(Debug, Clone, Copy)]
pub struct ReplayContext<'a> {
    pub venues: &'a [String],
    pub environment_column: Option<&'a str>,
    pub config_fingerprint: &'a str,
}

/// Seed-keyed, create-if-absent record storage.
pub trait ProvenanceStore: Send + Sync {
    fn load(&self, seed: u64) -> Result<Option<ProvenanceRecord>, ProvenanceError>;

    /// Persist `record` unless one already exists for its seed. Returns the
    /// record that is stored afterwards.
    fn create_if_absent(&self, record: &ProvenanceRecord) -> Result<ProvenanceRecord, ProvenanceError>;
}

/// Open the store named by `backend`.
pub fn open_store(backend: &ProvenanceBackend) -> Result<Box<dyn ProvenanceStore>, ProvenanceError> {
    Ok(match backend {
        ProvenanceBackend::Memory => Box::new(InMemoryProvenanceStore::new()),
        ProvenanceBackend::JsonDir { dir } => Box::new(JsonFileProvenanceStore::new(dir)?),
        ProvenanceBackend::Sqlite { path } => Box::new(SqliteProvenanceStore::new(path)?),
    })
}

// =============================================================================
// IN-MEMORY
// =============================================================================

#[derive(Default)]
pub struct InMemoryProvenanceStore {
    records: Mutex<BTreeMap<u64, ProvenanceRecord>>,
}

impl InMemoryProvenanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl ProvenanceStore for InMemoryProvenanceStore {
    fn load(&self, seed: u64) -> Result<Option<ProvenanceRecord>, ProvenanceError> {
        Ok(self.records.lock().get(&seed).cloned())
    }

    fn create_if_absent(&self, record: &ProvenanceRecord) -> Result<ProvenanceRecord, ProvenanceError> {
        let mut records = self.records.lock();
        let stored = records.entry(record.seed).or_insert_with(|| record.clone());
        Ok(stored.clone())
    }
}

// =============================================================================
// JSON FILES
// =============================================================================

/// One pretty-printed JSON file per seed. Files are written to a temporary
/// path in the same directory and published with a no-clobber rename.
pub struct JsonFileProvenanceStore {
    dir: PathBuf,
}

impl JsonFileProvenanceStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, ProvenanceError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, seed: u64) -> PathBuf {
        self.dir.join(ProvenanceRecord::file_name(seed))
    }
}

impl ProvenanceStore for JsonFileProvenanceStore {
    fn load(&self, seed: u64) -> Result<Option<ProvenanceRecord>, ProvenanceError> {
        let path = self.path_for(seed);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn create_if_absent(&self, record: &ProvenanceRecord) -> Result<ProvenanceRecord, ProvenanceError> {
        if let Some(existing) = self.load(record.seed)? {
            debug!(seed = record.seed, "provenance record already present");
            return Ok(existing);
        }

        let path = self.path_for(record.seed);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                info!(seed = record.seed, path = %path.display(), "persisted provenance record");
                Ok(record.clone())
            }
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(seed = record.seed, "lost provenance race; using stored record");
                self.load(record.seed)?.ok_or(ProvenanceError::Io(e.error))
            }
            Err(e) => Err(e.error.into()),
        }
    }
}
