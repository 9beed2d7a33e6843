//! Global moment scaler
//!
//! Fitted once per study on a reference dataset and reused for every later
//! comparison. Refitting per call would renormalize a competitive and a
//! coordinated dataset onto the same range and hide the difference.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::detection::config::ScalerMethod;
use crate::detection::error::ScalerError;
use crate::detection::stats::{mean, percentile, sample_std};

/// Frozen `(x - center) / scale` for one moment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MomentScale {
    pub center: f64,
    pub scale: f64,
}

impl MomentScale {
    fn fit(method: ScalerMethod, values: &[f64]) -> Self {
        match method {
            ScalerMethod::MinMax => {
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                Self { center: min, scale: max - min }
            }
            ScalerMethod::ZScore => Self {
                center: mean(values),
                scale: sample_std(values),
            },
            ScalerMethod::Robust => Self {
                center: percentile(values, 50.0),
                scale: percentile(values, 75.0) - percentile(values, 25.0),
            },
        }
    }

    /// Degenerate scales map everything to 0.
    pub fn apply(&self, x: f64) -> f64 {
        if self.scale.abs() < f64::EPSILON {
            0.0
        } else {
            (x - self.center) / self.scale
        }
    }
}

/// Fitted scaler state, persisted with the provenance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerParams {
    pub method: ScalerMethod,
    pub moments: BTreeMap<String, MomentScale>,
}

#[derive(Debug, Clone)]
pub struct GlobalScaler {
    method: ScalerMethod,
    params: Option<ScalerParams>,
}

impl GlobalScaler {
    pub fn new(method: ScalerMethod) -> Self {
        Self { method, params: None }
    }

    /// Restore a scaler fitted in an earlier run.
    pub fn from_params(params: ScalerParams) -> Self {
        Self {
            method: params.method,
            params: Some(params),
        }
    }

    pub fn method(&self) -> ScalerMethod {
        self.method
    }

    pub fn is_fitted(&self) -> bool {
        self.params.is_some()
    }

    pub fn params(&self) -> Option<&ScalerParams> {
        self.params.as_ref()
    }

    /// Freeze one transform per moment name.
    pub fn fit(&mut self, moments: &BTreeMap<String, Vec<f64>>) -> Result<&ScalerParams, ScalerError> {
        if let Some((name, _)) = moments.iter().find(|(_, v)| v.is_empty()) {
            return Err(ScalerError::EmptySeries(name.clone()));
        }
        if self.params.is_some() {
            tracing::warn!(method = ?self.method, "refitting an already fitted global scaler");
        }
        let fitted = moments
            .iter()
            .map(|(name, values)| (name.clone(), MomentScale::fit(self.method, values)))
            .collect();
        Ok(&*self.params.insert(ScalerParams {
            method: self.method,
            moments: fitted,
        }))
    }

    /// Apply the frozen transforms without refitting.
    pub fn transform(
        &self,
        moments: &BTreeMap<String, Vec<f64>>,
    ) -> Result<BTreeMap<String, Vec<f64>>, ScalerError> {
        let params = self.params.as_ref().ok_or(ScalerError::NotFitted)?;
        moments
            .iter()
            .map(|(name, values)| {
                let scale = params
                    .moments
                    .get(name)
                    .ok_or_else(|| ScalerError::UnknownMoment(name.clone()))?;
                Ok((name.clone(), values.iter().map(|&x| scale.apply(x)).collect()))
            })
            .collect()
    }
}
