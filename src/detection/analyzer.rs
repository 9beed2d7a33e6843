//! Study-level analysis
//!
//! Runs moments, global scaling, VMM and ICP over one panel with a shared
//! provenance record, and hands the typed results to whatever composite
//! scorer sits downstream.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::detection::config::StudyConfig;
use crate::detection::error::DetectionResult;
use crate::detection::icp::{IcpEngine, IcpResult};
use crate::detection::moments::{MomentCalculator, MomentReport};
use crate::detection::panel::PricePanel;
use crate::detection::provenance::{open_store, ProvenanceStore};
use crate::detection::scaler::GlobalScaler;
use crate::detection::vmm::{VmmEngine, VmmOutput};

/// Everything one analysis call produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisBundle {
    pub moments: MomentReport,
    /// Scalar moments per environment after the study's global scaler.
    pub scaled_moments: BTreeMap<String, Vec<f64>>,
    pub vmm: VmmOutput,
    pub icp: IcpResult,
}

/// Consumer of analysis results (composite risk scoring lives downstream).
pub trait CompositeScorer {
    fn score(&self, bundle: &AnalysisBundle) -> f64;
}

pub struct CoordinationAnalyzer {
    config: StudyConfig,
    store: Box<dyn ProvenanceStore>,
    moments: MomentCalculator,
    vmm: VmmEngine,
    icp: IcpEngine,
}

impl CoordinationAnalyzer {
    pub fn new(config: StudyConfig, store: Box<dyn ProvenanceStore>) -> DetectionResult<Self> {
        config.validate()?;
        Ok(Self {
            moments: MomentCalculator::new(config.moments.clone())?,
            vmm: VmmEngine::new(config.vmm.clone(), config.moments.clone())?,
            icp: IcpEngine::new(config.icp.clone())?,
            config,
            store,
        })
    }

    /// Analyzer backed by the store named in `config.provenance`.
    pub fn from_config(config: StudyConfig) -> DetectionResult<Self> {
        let store = open_store(&config.provenance)?;
        Self::new(config, store)
    }

    pub fn config(&self) -> &StudyConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn ProvenanceStore {
        self.store.as_ref()
    }

    pub fn analyze(&self, panel: &PricePanel, venues: &[String]) -> DetectionResult<AnalysisBundle> {
        let seed = self.config.seed;
        let env_column = self
            .config
            .vmm
            .environment_column
            .as_deref()
            .or_else(|| self.config.icp.environment_columns.first().map(|c| c.as_str()));

        let moments = self.moments.compute(panel, venues, env_column)?;
        let series = moments.as_series();

        let (record, created) = match self.store.load(seed)? {
            Some(record) => (record, false),
            None => {
                let mut fitted = self.vmm.fit_provenance(panel, venues, seed)?;
                let mut scaler = GlobalScaler::new(self.config.scaler);
                fitted.moment_scaler = Some(scaler.fit(&series)?.clone());
                let stored = self.store.create_if_absent(&fitted)?;
                let created = stored == fitted;
                (stored, created)
            }
        };

        let scaler = match &record.moment_scaler {
            Some(params) => GlobalScaler::from_params(params.clone()),
            None => {
                tracing::warn!(seed, "provenance record has no scaler; fitting on this panel");
                let mut scaler = GlobalScaler::new(self.config.scaler);
                scaler.fit(&series)?;
                scaler
            }
        };
        let scaled_moments = scaler.transform(&series)?;

        let mut vmm = self.vmm.estimate_with_provenance(panel, venues, &record)?;
        vmm.provenance.created = created;
        let icp = self.icp.analyze_invariance(panel, venues, seed)?;

        Ok(AnalysisBundle {
            moments,
            scaled_moments,
            vmm,
            icp,
        })
    }
}
