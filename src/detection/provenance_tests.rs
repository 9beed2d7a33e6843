//! Provenance Store Tests
//!
//! Every backend must be create-if-absent: the first record for a seed wins
//! and later writers get it back unchanged.

use crate::detection::config::{MomentConfig, ProvenanceBackend, VmmConfig};
use crate::detection::error::ProvenanceError;
use crate::detection::provenance::{
    open_store, InMemoryProvenanceStore, JsonFileProvenanceStore, ProvenanceRecord, ProvenanceStore,
    ReplayContext,
};
use crate::detection::provenance_store::SqliteProvenanceStore;
use crate::detection::synthetic::{SyntheticMarket, REGIME_COLUMN};
use crate::detection::vmm::VmmEngine;

fn record(seed: u64) -> ProvenanceRecord {
    let m = SyntheticMarket { n_steps: 400, ..SyntheticMarket::default() };
    let config = VmmConfig {
        environment_column: Some(REGIME_COLUMN.to_string()),
        ..VmmConfig::default()
    };
    VmmEngine::new(config, MomentConfig::default())
        .unwrap()
        .fit_provenance(&m.competitive().unwrap(), &m.venue_names(), seed)
        .unwrap()
}

fn later(record: &ProvenanceRecord) -> ProvenanceRecord {
    ProvenanceRecord {
        created_at_ms: record.created_at_ms + 1_000,
        dataset_fingerprint: "different".to_string(),
        ..record.clone()
    }
}

fn assert_first_writer_wins(store: &dyn ProvenanceStore) {
    let first = record(11);
    assert!(store.load(11).unwrap().is_none());

    let stored = store.create_if_absent(&first).unwrap();
    assert_eq!(stored, first);

    let again = store.create_if_absent(&later(&first)).unwrap();
    assert_eq!(again, first);
    assert_eq!(store.load(11).unwrap(), Some(first));
}

// =============================================================================
// BACKENDS
// =============================================================================

#[test]
fn test_in_memory_first_writer_wins() {
    let store = InMemoryProvenanceStore::new();
    assert_first_writer_wins(&store);
    assert_eq!(store.len(), 1);
}

#[test]
fn test_json_first_writer_wins() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileProvenanceStore::new(dir.path().join("nested")).unwrap();
    assert_first_writer_wins(&store);

    let text = std::fs::read_to_string(store.path_for(11)).unwrap();
    assert!(text.contains("\"weight_matrix\""));
    assert!(text.contains("\"valid_components\""));
}

#[test]
fn test_sqlite_first_writer_wins() {
    let store = SqliteProvenanceStore::in_memory().unwrap();
    assert_first_writer_wins(&store);
    assert!(store.exists(11).unwrap());
    assert!(!store.exists(12).unwrap());
    assert_eq!(store.count().unwrap(), 1);
}

#[test]
fn test_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("provenance.db");
    let original = record(u64::MAX);
    {
        let store = SqliteProvenanceStore::new(&path).unwrap();
        store.create_if_absent(&original).unwrap();
    }
    let reopened = SqliteProvenanceStore::new(&path).unwrap();
    assert_eq!(reopened.load(u64::MAX).unwrap(), Some(original));
}

#[test]
fn test_open_store_for_each_backend() {
    let dir = tempfile::tempdir().unwrap();
    let backends = [
        ProvenanceBackend::Memory,
        ProvenanceBackend::JsonDir { dir: dir.path().join("json") },
        ProvenanceBackend::Sqlite { path: dir.path().join("p.db") },
    ];
    for backend in &backends {
        let store = open_store(backend).unwrap();
        let rec = record(3);
        assert_eq!(store.create_if_absent(&rec).unwrap(), rec);
        assert_eq!(store.load(3).unwrap(), Some(rec));
    }
}

#[test]
fn test_concurrent_json_writers_agree() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileProvenanceStore::new(dir.path()).unwrap();
    let base = record(21);

    let results: Vec<ProvenanceRecord> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let candidate = ProvenanceRecord {
                    created_at_ms: base.created_at_ms + i,
                    ..base.clone()
                };
                let store = &store;
                s.spawn(move || store.create_if_absent(&candidate).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let stored = store.load(21).unwrap().unwrap();
    assert!(results.iter().all(|r| *r == stored));
}

// =============================================================================
// COMPATIBILITY
// =============================================================================

fn replay_context(rec: &ProvenanceRecord) -> ReplayContext<'_> {
    ReplayContext {
        venues: &rec.venues,
        environment_column: rec.environment_column.as_deref(),
        config_fingerprint: &rec.config_fingerprint,
    }
}

#[test]
fn test_matching_context_is_compatible() {
    let rec = record(4);
    rec.check_compatible(
        &replay_context(&rec),
        &rec.stabilizer.component_names,
        &rec.environments,
        rec.weight_meta.n_conditions,
    )
    .unwrap();
}

#[test]
fn test_component_mismatch_is_incompatible() {
    let rec = record(4);
    let err = rec
        .check_compatible(
            &replay_context(&rec),
            &["arbitrage_timing".to_string()],
            &rec.environments,
            0,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ProvenanceError::Incompatible { field: "component_names", seed: 4, .. }
    ));
}

#[test]
fn test_environment_column_mismatch_is_incompatible() {
    let rec = record(4);
    let current = ReplayContext { environment_column: None, ..replay_context(&rec) };
    let err = rec
        .check_compatible(
            &current,
            &rec.stabilizer.component_names,
            &rec.environments,
            rec.weight_meta.n_conditions,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ProvenanceError::Incompatible { field: "environment_column", seed: 4, .. }
    ));
}

#[test]
fn test_truncated_weight_matrix_is_incompatible() {
    let mut rec = record(4);
    rec.weight_matrix.pop();
    assert!(matches!(
        rec.weight().unwrap_err(),
        ProvenanceError::Incompatible { field: "weight_matrix", .. }
    ));
}

#[test]
fn test_record_json_round_trip_is_exact() {
    let rec = record(8);
    let json = serde_json::to_string_pretty(&rec).unwrap();
    let back: ProvenanceRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(back, rec);
    assert_eq!(ProvenanceRecord::file_name(8), "provenance_seed_8.json");
}
