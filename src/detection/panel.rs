//! Price panel
//!
//! Ordered, timestamped venue prices plus categorical environment labels.
//! The panel is validated once at construction; analyses borrow it
//! immutably.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::detection::config::PriceTransform;
use crate::detection::error::ValidationError;

/// Separator used when several label columns form one environment key.
pub const ENVIRONMENT_KEY_SEPARATOR: &str = "|";

/// Environment key used when no environment column is requested.
pub const POOLED_ENVIRONMENT: &str = "all";

/// Timestamped venue prices with environment labels.
#[derive(Debug, Clone, PartialEq)]
pub struct PricePanel {
    timestamps: Vec<i64>,
    venues: Vec<String>,
    prices: Vec<Vec<f64>>,
    environments: BTreeMap<String, Vec<String>>,
}

impl PricePanel {
    /// Build a panel from a timestamp index and `(venue, prices)` columns.
    pub fn new(
        timestamps: Vec<i64>,
        columns: Vec<(String, Vec<f64>)>,
    ) -> Result<Self, ValidationError> {
        let n = timestamps.len();

        if let Some(row) = timestamps.windows(2).position(|w| w[1] < w[0]) {
            return Err(ValidationError::UnorderedTimestamps { row: row + 1 });
        }

        let mut venues = Vec::with_capacity(columns.len());
        let mut prices = Vec::with_capacity(columns.len());
        for (name, values) in columns {
            if values.len() != n {
                return Err(ValidationError::LengthMismatch {
                    column: name,
                    expected: n,
                    found: values.len(),
                });
            }
            let missing = values.iter().filter(|v| !v.is_finite()).count();
            if missing > 0 {
                return Err(ValidationError::MissingData { column: name, count: missing });
            }
            venues.push(name);
            prices.push(values);
        }

        Ok(Self {
            timestamps,
            venues,
            prices,
            environments: BTreeMap::new(),
        })
    }

    /// Attach an environment label column.
    pub fn with_environment(
        mut self,
        name: impl Into<String>,
        labels: Vec<String>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        if labels.len() != self.n_rows() {
            return Err(ValidationError::LengthMismatch {
                column: name,
                expected: self.n_rows(),
                found: labels.len(),
            });
        }
        if let Some(row) = labels.iter().position(|l| l.is_empty()) {
            return Err(ValidationError::EmptyEnvironmentLabel { column: name, row });
        }
        self.environments.insert(name, labels);
        Ok(self)
    }

    pub fn n_rows(&self) -> usize {
        self.timestamps.len()
    }

    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    pub fn venues(&self) -> &[String] {
        &self.venues
    }

    pub fn column(&self, venue: &str) -> Option<&[f64]> {
        self.venues
            .iter()
            .position(|v| v == venue)
            .map(|i| self.prices[i].as_slice())
    }

    pub fn environment(&self, name: &str) -> Option<&[String]> {
        self.environments.get(name).map(|v| v.as_slice())
    }

    /// Resolve venue names to column indices. Requires at least two venues,
    /// all present.
    pub fn venue_indices(&self, venues: &[String]) -> Result<Vec<usize>, ValidationError> {
        if venues.len() < 2 {
            return Err(ValidationError::InsufficientColumns {
                required: 2,
                found: venues.len(),
            });
        }
        let missing: Vec<String> = venues
            .iter()
            .filter(|v| !self.venues.contains(v))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ValidationError::MissingColumns { missing });
        }
        Ok(venues
            .iter()
            .filter_map(|v| self.venues.iter().position(|x| x == v))
            .collect())
    }

    /// One environment key per row: the listed label columns joined with
    /// `|`. An empty list yields the pooled key for every row.
    pub fn environment_keys(&self, columns: &[String]) -> Result<Vec<String>, ValidationError> {
        if columns.is_empty() {
            return Ok(vec![POOLED_ENVIRONMENT.to_string(); self.n_rows()]);
        }
        let missing: Vec<String> = columns
            .iter()
            .filter(|c| !self.environments.contains_key(c.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ValidationError::MissingColumns { missing });
        }
        let label_columns: Vec<&Vec<String>> =
            columns.iter().filter_map(|c| self.environments.get(c.as_str())).collect();

        Ok((0..self.n_rows())
            .map(|row| {
                label_columns
                    .iter()
                    .map(|col| col[row].as_str())
                    .collect::<Vec<_>>()
                    .join(ENVIRONMENT_KEY_SEPARATOR)
            })
            .collect())
    }

    /// Row-major log returns for the given venue columns (`n_rows - 1` rows).
    pub fn log_returns(&self, indices: &[usize]) -> Result<Vec<Vec<f64>>, ValidationError> {
        for &i in indices {
            if let Some(row) = self.prices[i].iter().position(|&p| p <= 0.0) {
                return Err(ValidationError::NonPositivePrice {
                    column: self.venues[i].clone(),
                    row,
                    value: self.prices[i][row],
                });
            }
        }
        Ok((1..self.n_rows())
            .map(|t| {
                indices
                    .iter()
                    .map(|&i| (self.prices[i][t] / self.prices[i][t - 1]).ln())
                    .collect()
            })
            .collect())
    }

    /// Row-major price levels for the given venue columns.
    pub fn levels(&self, indices: &[usize]) -> Vec<Vec<f64>> {
        (0..self.n_rows())
            .map(|t| indices.iter().map(|&i| self.prices[i][t]).collect())
            .collect()
    }

    /// SHA-256 over the index, venue names, exact price bits and labels.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for ts in &self.timestamps {
            hasher.update(ts.to_le_bytes());
        }
        for (venue, column) in self.venues.iter().zip(&self.prices) {
            hasher.update(venue.as_bytes());
            for p in column {
                hasher.update(p.to_bits().to_le_bytes());
            }
        }
        for (name, labels) in &self.environments {
            hasher.update(name.as_bytes());
            for label in labels {
                hasher.update(label.as_bytes());
                hasher.update([0u8]);
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

// =============================================================================
// OBSERVATIONS
// =============================================================================

/// Analysis-ready rows: one value per venue plus the row's environment key.
#[derive(Debug, Clone)]
pub struct Observations {
    pub values: Vec<Vec<f64>>,
    pub environments: Vec<String>,
}

impl Observations {
    /// Extract rows for `indices` under `transform`. Log returns take the
    /// environment label of the later timestamp.
    pub fn from_panel(
        panel: &PricePanel,
        indices: &[usize],
        environment_columns: &[String],
        transform: PriceTransform,
    ) -> Result<Self, ValidationError> {
        let keys = panel.environment_keys(environment_columns)?;
        match transform {
            PriceTransform::LogReturns => Ok(Self {
                values: panel.log_returns(indices)?,
                environments: keys.into_iter().skip(1).collect(),
            }),
            PriceTransform::Levels => Ok(Self {
                values: panel.levels(indices),
                environments: keys,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Row indices per environment key, in key order.
    pub fn groups(&self) -> BTreeMap<String, Vec<usize>> {
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (row, env) in self.environments.iter().enumerate() {
            groups.entry(env.clone()).or_default().push(row);
        }
        groups
    }

    /// Keep environments with at least `min_samples` rows; require at least
    /// two survivors.
    pub fn partition(
        &self,
        min_samples: usize,
    ) -> Result<BTreeMap<String, Vec<usize>>, ValidationError> {
        let groups = self.groups();
        let sizes: Vec<(String, usize)> =
            groups.iter().map(|(k, rows)| (k.clone(), rows.len())).collect();
        let kept: BTreeMap<String, Vec<usize>> = groups
            .into_iter()
            .filter(|(_, rows)| rows.len() >= min_samples)
            .collect();
        if kept.len() < 2 {
            return Err(ValidationError::InsufficientEnvironments {
                required: 2,
                found: kept.len(),
                min_samples,
                sizes,
            });
        }
        Ok(kept)
    }

    /// New observation set made of the given rows (repeats allowed).
    pub fn resample(&self, rows: &[usize]) -> Self {
        Self {
            values: rows.iter().map(|&r| self.values[r].clone()).collect(),
            environments: rows.iter().map(|&r| self.environments[r].clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn panel() -> PricePanel {
        PricePanel::new(
            vec![1, 2, 3, 4],
            vec![
                ("a".to_string(), vec![100.0, 101.0, 102.0, 101.0]),
                ("b".to_string(), vec![50.0, 50.5, 50.0, 49.0]),
            ],
        )
        .unwrap()
        .with_environment("regime", vec!["x".into(), "x".into(), "y".into(), "y".into()])
        .unwrap()
        .with_environment("session", vec!["eu".into(), "us".into(), "eu".into(), "us".into()])
        .unwrap()
    }

    #[test]
    fn test_missing_values_are_rejected() {
        let err = PricePanel::new(
            vec![1, 2],
            vec![("a".to_string(), vec![1.0, f64::NAN])],
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::MissingData { column: "a".into(), count: 1 });
    }

    #[test]
    fn test_unordered_timestamps_rejected() {
        let err = PricePanel::new(vec![2, 1], vec![("a".into(), vec![1.0, 1.0])]).unwrap_err();
        assert_eq!(err, ValidationError::UnorderedTimestamps { row: 1 });
    }

    #[test]
    fn test_venue_indices_report_missing_columns() {
        let p = panel();
        let err = p.venue_indices(&["a".into(), "zz".into()]).unwrap_err();
        assert_eq!(err, ValidationError::MissingColumns { missing: vec!["zz".into()] });

        let err = p.venue_indices(&["a".into()]).unwrap_err();
        assert_eq!(err, ValidationError::InsufficientColumns { required: 2, found: 1 });
    }

    #[test]
    fn test_multi_column_environment_keys() {
        let p = panel();
        let keys = p
            .environment_keys(&["regime".into(), "session".into()])
            .unwrap();
        assert_eq!(keys, vec!["x|eu", "x|us", "y|eu", "y|us"]);
    }

    #[test]
    fn test_log_returns_shape_and_labels() {
        let p = panel();
        let idx = p.venue_indices(&["a".into(), "b".into()]).unwrap();
        let obs =
            Observations::from_panel(&p, &idx, &["regime".into()], PriceTransform::LogReturns)
                .unwrap();
        assert_eq!(obs.len(), 3);
        assert_eq!(obs.environments, vec!["x", "y", "y"]);
        assert!((obs.values[0][0] - (101.0f64 / 100.0).ln()).abs() < 1e-15);
    }

    #[test]
    fn test_partition_requires_two_environments() {
        let p = panel();
        let idx = p.venue_indices(&["a".into(), "b".into()]).unwrap();
        let obs = Observations::from_panel(&p, &idx, &["regime".into()], PriceTransform::Levels)
            .unwrap();
        assert_eq!(obs.partition(2).unwrap().len(), 2);
        match obs.partition(3).unwrap_err() {
            ValidationError::InsufficientEnvironments { found, min_samples, sizes, .. } => {
                assert_eq!(found, 0);
                assert_eq!(min_samples, 3);
                assert_eq!(sizes, vec![("x".to_string(), 2), ("y".to_string(), 2)]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_fingerprint_changes_with_prices() {
        let a = panel();
        let b = PricePanel::new(
            vec![1, 2, 3, 4],
            vec![
                ("a".to_string(), vec![100.0, 101.0, 102.0, 101.5]),
                ("b".to_string(), vec![50.0, 50.5, 50.0, 49.0]),
            ],
        )
        .unwrap();
        assert_eq!(a.fingerprint(), panel().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
