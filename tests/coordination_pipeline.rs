//! End-to-end tests for the detection pipeline
//!
//! Four venues, 2000 steps, two regimes, seed 42: independent random walks
//! must look invariant, and followers mirroring the lead venue five steps
//! late in only one regime must not.

use coordination_core::detection::{
    CoordinationAnalyzer, CoordinationProfile, IcpConfig, IcpEngine, InMemoryProvenanceStore,
    ProvenanceBackend, ProvenanceStore, SqliteProvenanceStore, StudyConfig, SyntheticMarket,
    VmmConfig, VmmEngine, REGIME_COLUMN,
};
use coordination_core::telemetry::init_test_tracing;
use coordination_core::{AnalysisBundle, CompositeScorer, MomentCalculator};

fn scenario() -> SyntheticMarket {
    SyntheticMarket {
        n_venues: 4,
        n_steps: 2000,
        n_environments: 2,
        seed: 42,
        ..SyntheticMarket::default()
    }
}

fn mirrored() -> CoordinationProfile {
    CoordinationProfile {
        lead_venue: 0,
        lag: 5,
        strength: 0.8,
        environment_dependent: true,
    }
}

fn study(provenance: ProvenanceBackend) -> StudyConfig {
    StudyConfig {
        seed: 42,
        vmm: VmmConfig {
            environment_column: Some(REGIME_COLUMN.to_string()),
            ..VmmConfig::default()
        },
        icp: IcpConfig { n_bootstrap: 50, ..IcpConfig::default() },
        provenance,
        ..StudyConfig::default()
    }
}

#[test]
fn test_competitive_scenario_is_not_flagged() {
    init_test_tracing();
    let m = scenario();
    let icp = IcpEngine::new(IcpConfig { n_bootstrap: 50, ..IcpConfig::default() }).unwrap();
    let result = icp
        .analyze_invariance(&m.competitive().unwrap(), &m.venue_names(), 42)
        .unwrap();

    assert_eq!(result.n_environments, 2);
    assert!(!result.reject_h0, "p = {}", result.p_value);
}

#[test]
fn test_mirroring_scenario_is_flagged() {
    init_test_tracing();
    let m = scenario();
    let icp = IcpEngine::new(IcpConfig { n_bootstrap: 50, ..IcpConfig::default() }).unwrap();
    let result = icp
        .analyze_invariance(&m.coordinated(&mirrored()).unwrap(), &m.venue_names(), 42)
        .unwrap();

    assert_eq!(result.n_environments, 2);
    assert!(result.reject_h0);
    assert!(result.p_value <= 0.05);
}

#[test]
fn test_moments_separate_regimes_under_mirroring() {
    let m = scenario();
    let calculator = MomentCalculator::new(Default::default()).unwrap();
    let report = calculator
        .compute(&m.coordinated(&mirrored()).unwrap(), &m.venue_names(), Some(REGIME_COLUMN))
        .unwrap();

    let calm = report.environment("regime_0").unwrap();
    let mirrored = report.environment("regime_1").unwrap();
    assert!(mirrored.mirroring_similarity > calm.mirroring_similarity);
}

#[test]
fn test_vmm_is_reproducible_across_stores() {
    let m = scenario();
    let panel = m.coordinated(&mirrored()).unwrap();
    let vmm = VmmEngine::new(
        VmmConfig {
            environment_column: Some(REGIME_COLUMN.to_string()),
            ..VmmConfig::default()
        },
        Default::default(),
    )
    .unwrap();

    let a = vmm
        .estimate(&panel, &m.venue_names(), 42, &InMemoryProvenanceStore::new())
        .unwrap();
    let b = vmm
        .estimate(&panel, &m.venue_names(), 42, &SqliteProvenanceStore::in_memory().unwrap())
        .unwrap();

    assert!((a.j_statistic - b.j_statistic).abs() <= 1e-10);
    assert!((a.j_p_value - b.j_p_value).abs() <= 1e-10);
    assert_eq!(a.parameters, b.parameters);
    assert_eq!(a.weight, b.weight);
}

#[test]
fn test_sqlite_study_survives_restart() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let backend = ProvenanceBackend::Sqlite { path: dir.path().join("study.db") };
    let m = scenario();
    let panel = m.competitive().unwrap();

    let first = CoordinationAnalyzer::from_config(study(backend.clone()))
        .unwrap()
        .analyze(&panel, &m.venue_names())
        .unwrap();

    let analyzer = CoordinationAnalyzer::from_config(study(backend)).unwrap();
    let second = analyzer.analyze(&panel, &m.venue_names()).unwrap();

    assert!(first.vmm.provenance.created);
    assert!(!second.vmm.provenance.created);
    assert_eq!(first.vmm.j_statistic, second.vmm.j_statistic);
    assert_eq!(first.scaled_moments, second.scaled_moments);
    assert!(analyzer.store().load(42).unwrap().is_some());
}

#[test]
fn test_json_study_writes_one_record_per_seed() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ProvenanceBackend::JsonDir { dir: dir.path().to_path_buf() };
    let m = scenario();
    let analyzer = CoordinationAnalyzer::from_config(study(backend)).unwrap();

    analyzer.analyze(&m.competitive().unwrap(), &m.venue_names()).unwrap();
    analyzer
        .analyze(&m.coordinated(&mirrored()).unwrap(), &m.venue_names())
        .unwrap();

    let files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
        .collect();
    assert_eq!(files.len(), 1);
    assert!(dir.path().join("provenance_seed_42.json").exists());
}

#[test]
fn test_study_config_from_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("study.toml");
    std::fs::write(
        &path,
        r#"
seed = 7
scaler = "robust"

[vmm]
environment_column = "regime"

[icp]
n_bootstrap = 10

[provenance]
backend = "memory"
"#,
    )
    .unwrap();

    let config = StudyConfig::load(&path).unwrap();
    assert_eq!(config.seed, 7);
    assert_eq!(config.provenance, ProvenanceBackend::Memory);

    let m = SyntheticMarket { n_steps: 600, ..scenario() };
    let bundle = CoordinationAnalyzer::from_config(config)
        .unwrap()
        .analyze(&m.competitive().unwrap(), &m.venue_names())
        .unwrap();
    assert_eq!(bundle.vmm.provenance.seed, 7);
}

struct MaxEvidence;

impl CompositeScorer for MaxEvidence {
    fn score(&self, bundle: &AnalysisBundle) -> f64 {
        (1.0 - bundle.icp.p_value).max(1.0 - bundle.vmm.j_p_value)
    }
}

#[test]
fn test_composite_score_ranks_mirroring_higher() {
    let m = scenario();
    let analyzer = CoordinationAnalyzer::from_config(study(ProvenanceBackend::Memory)).unwrap();

    let competitive = analyzer.analyze(&m.competitive().unwrap(), &m.venue_names()).unwrap();
    let coordinated = analyzer
        .analyze(&m.coordinated(&mirrored()).unwrap(), &m.venue_names())
        .unwrap();

    let scorer = MaxEvidence;
    assert!(scorer.score(&coordinated) >= scorer.score(&competitive));
    assert!(scorer.score(&coordinated) > 0.95);
}
