//! SQLite provenance storage
//!
//! Single-file store for provenance records. Records are immutable once
//! written: `create_if_absent` uses `INSERT OR IGNORE` and always reads the
//! stored row back.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE provenance_records (
//!     seed TEXT PRIMARY KEY,
//!     version INTEGER NOT NULL,
//!     created_at_ms INTEGER NOT NULL,
//!     dataset_fingerprint TEXT NOT NULL,
//!     config_fingerprint TEXT NOT NULL,
//!     record_json TEXT NOT NULL
//! ) WITHOUT ROWID;
//! ```

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::detection::error::ProvenanceError;
use crate::detection::provenance::{ProvenanceRecord, ProvenanceStore};

/// Schema version for migrations.
/// Version history:
/// - v1: Initial schema
const SCHEMA_VERSION: u32 = 1;

pub struct SqliteProvenanceStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProvenanceStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, ProvenanceError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self, ProvenanceError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), ProvenanceError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;

        match current_version {
            None => {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS provenance_records (
                        seed TEXT PRIMARY KEY,
                        version INTEGER NOT NULL,
                        created_at_ms INTEGER NOT NULL,
                        dataset_fingerprint TEXT NOT NULL,
                        config_fingerprint TEXT NOT NULL,
                        record_json TEXT NOT NULL
                    ) WITHOUT ROWID;
                "#,
                )?;
                conn.execute("INSERT INTO schema_version (version) VALUES (?)", [SCHEMA_VERSION])?;
                info!("Created provenance store schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("Provenance store schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!(
                    "Provenance store schema version mismatch: expected {}, got {}",
                    SCHEMA_VERSION, v
                );
            }
        }

        Ok(())
    }

    /// Check if a record exists for `seed`.
    pub fn exists(&self, seed: u64) -> Result<bool, ProvenanceError> {
        let conn = self.conn.lock();
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM provenance_records WHERE seed = ?",
                [seed.to_string()],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        Ok(exists)
    }

    pub fn count(&self) -> Result<usize, ProvenanceError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM provenance_records", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }

    fn load_locked(conn: &Connection, seed: u64) -> Result<Option<ProvenanceRecord>, ProvenanceError> {
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM provenance_records WHERE seed = ?",
                [seed.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }
}

impl ProvenanceStore for SqliteProvenanceStore {
    fn load(&self, seed: u64) -> Result<Option<ProvenanceRecord>, ProvenanceError> {
        let conn = self.conn.lock();
        Self::load_locked(&conn, seed)
    }

    fn create_if_absent(&self, record: &ProvenanceRecord) -> Result<ProvenanceRecord, ProvenanceError> {
        let json = serde_json::to_string(record)?;
        let conn = self.conn.lock();
        let inserted = conn.execute(
            r#"INSERT OR IGNORE INTO provenance_records (
                seed, version, created_at_ms, dataset_fingerprint, config_fingerprint, record_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                record.seed.to_string(),
                record.version,
                record.created_at_ms,
                record.dataset_fingerprint,
                record.config_fingerprint,
                json,
            ],
        )?;

        if inserted == 1 {
            info!(seed = record.seed, "persisted provenance record");
        } else {
            debug!(seed = record.seed, "provenance record already present");
        }

        Self::load_locked(&conn, record.seed)?.ok_or(ProvenanceError::Sqlite(
            rusqlite::Error::QueryReturnedNoRows,
        ))
    }
}
