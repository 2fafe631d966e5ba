//! Versioned model artifacts
//!
//! An artifact carries everything inference needs to check compatibility
//! before scoring: the ordered feature schema, the decision constants used to
//! build labels, the default-fill table for partial scenarios and the fitted
//! trees. Artifacts come in pairs (regressor + classifier) from one training
//! run and are only ever loaded and swapped as a pair.

mod store;

pub use store::{compute_checksum, ArtifactStore, RunInfo};

use crate::error::{ForecastError, Result};
use crate::features::{FeatureKind, FeatureSchema, FeatureTable};
use crate::models::DecisionConstants;
use crate::trainer::{BoostedTrees, ClassificationMetrics, Objective};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current on-disk artifact format
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Which half of the pair an artifact is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    Regressor,
    Classifier,
}

impl ModelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::Regressor => "regressor",
            ModelRole::Classifier => "classifier",
        }
    }

    fn objective(&self) -> Objective {
        match self {
            ModelRole::Regressor => Objective::SquaredError,
            ModelRole::Classifier => Objective::Logistic,
        }
    }
}

/// Per-feature fallback values for partial scenarios
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefaultFillTable {
    values: BTreeMap<String, f64>,
}

impl DefaultFillTable {
    /// Column medians of `table`; calendar columns are rounded to whole values
    pub fn from_table(table: &FeatureTable) -> Self {
        let values = table
            .schema()
            .names()
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                let median = median(table.column(i))?;
                let value = match FeatureKind::of(name) {
                    Some(FeatureKind::Calendar { .. }) => median.round(),
                    _ => median,
                };
                Some((name.clone(), value))
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, f64)> for DefaultFillTable {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// Hold-out evaluation of one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub train_rows: usize,
    pub test_rows: usize,
    /// Share of violations over all labelled rows
    pub violation_rate: f64,
    /// Regressor mean absolute error on the test partition (µg/m³)
    pub mae: f64,
    /// Classifier scores on the test partition at the classification cutoff
    pub classification: ClassificationMetrics,
}

/// One fitted model plus the contract it was trained under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub run_id: String,
    pub role: ModelRole,
    pub trained_at: DateTime<Utc>,
    pub feature_schema: FeatureSchema,
    pub constants: DecisionConstants,
    pub defaults: DefaultFillTable,
    pub metrics: EvaluationMetrics,
    pub model: BoostedTrees,
}

impl ModelArtifact {
    /// Structural checks on a freshly built or deserialized artifact
    pub fn validate(&self) -> Result<()> {
        if self.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ForecastError::UnsupportedFormat {
                found: self.format_version,
                expected: ARTIFACT_FORMAT_VERSION,
            });
        }
        if self.model.objective() != self.role.objective() {
            return Err(ForecastError::IncompatibleArtifacts(format!(
                "{} artifact carries a {:?} model",
                self.role.as_str(),
                self.model.objective()
            )));
        }
        if self.model.n_features() != self.feature_schema.len() {
            return Err(ForecastError::SchemaMismatch {
                role: self.role.as_str().to_string(),
                detail: format!(
                    "model expects {} features, schema lists {}",
                    self.model.n_features(),
                    self.feature_schema.len()
                ),
            });
        }
        if !self.model.is_well_formed() {
            return Err(ForecastError::IncompatibleArtifacts(format!(
                "{} model has malformed trees",
                self.role.as_str()
            )));
        }
        Ok(())
    }

    /// Require a vector's schema to equal the stored one, name for name
    pub fn check_schema(&self, schema: &FeatureSchema) -> Result<()> {
        self.feature_schema.ensure_matches(schema, self.role.as_str())
    }

    /// Score values already laid out in this artifact's schema order
    pub fn score(&self, values: &[f64]) -> f64 {
        self.model.predict(values)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse and validate; the format version is checked before the body so
    /// a newer layout reports `UnsupportedFormat` rather than a parse error.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)?;
        let version = raw
            .get("format_version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ForecastError::Parse("artifact has no format_version".to_string()))?;
        if version != ARTIFACT_FORMAT_VERSION as u64 {
            return Err(ForecastError::UnsupportedFormat {
                found: version as u32,
                expected: ARTIFACT_FORMAT_VERSION,
            });
        }
        let artifact: ModelArtifact = serde_json::from_value(raw)?;
        artifact.validate()?;
        Ok(artifact)
    }
}

/// Regressor and classifier from the same training run
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPair {
    regressor: ModelArtifact,
    classifier: ModelArtifact,
}

impl ArtifactPair {
    /// Pair two artifacts, refusing any mix of runs, schemas or constants
    pub fn new(regressor: ModelArtifact, classifier: ModelArtifact) -> Result<Self> {
        regressor.validate()?;
        classifier.validate()?;

        if regressor.role != ModelRole::Regressor || classifier.role != ModelRole::Classifier {
            return Err(ForecastError::IncompatibleArtifacts(format!(
                "expected regressor + classifier, got {} + {}",
                regressor.role.as_str(),
                classifier.role.as_str()
            )));
        }
        if regressor.run_id != classifier.run_id {
            return Err(ForecastError::IncompatibleArtifacts(format!(
                "run ids differ: {} vs {}",
                regressor.run_id, classifier.run_id
            )));
        }
        if regressor.feature_schema != classifier.feature_schema {
            return Err(ForecastError::IncompatibleArtifacts(
                "feature schemas differ between regressor and classifier".to_string(),
            ));
        }
        if regressor.constants != classifier.constants {
            return Err(ForecastError::IncompatibleArtifacts(
                "decision constants differ between regressor and classifier".to_string(),
            ));
        }
        if regressor.defaults != classifier.defaults {
            return Err(ForecastError::IncompatibleArtifacts(
                "default-fill tables differ between regressor and classifier".to_string(),
            ));
        }

        Ok(Self {
            regressor,
            classifier,
        })
    }

    pub fn regressor(&self) -> &ModelArtifact {
        &self.regressor
    }

    pub fn classifier(&self) -> &ModelArtifact {
        &self.classifier
    }

    pub fn run_id(&self) -> &str {
        &self.regressor.run_id
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.regressor.trained_at
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.regressor.feature_schema
    }

    pub fn constants(&self) -> &DecisionConstants {
        &self.regressor.constants
    }

    pub fn defaults(&self) -> &DefaultFillTable {
        &self.regressor.defaults
    }

    pub fn metrics(&self) -> &EvaluationMetrics {
        &self.regressor.metrics
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::features::FeatureRow;
    use crate::trainer::BoostingParams;
    use chrono::TimeZone;
    use std::sync::Arc;

    /// A tiny coherent pair over the standard schema. The regressor predicts
    /// `lag_1h` and the classifier says "violation" when `lag_1h > 15`.
    pub(crate) fn fixture_pair(run_id: &str) -> ArtifactPair {
        let schema = FeatureSchema::standard();
        let lag = schema.position("lag_1h").unwrap();
        let rows: Vec<Vec<f64>> = (0..60)
            .map(|i| {
                let mut row = vec![1.0; schema.len()];
                row[lag] = i as f64;
                row
            })
            .collect();
        let targets: Vec<f64> = rows.iter().map(|r| r[lag]).collect();
        let labels: Vec<f64> = targets.iter().map(|&t| if t > 15.0 { 1.0 } else { 0.0 }).collect();

        let regressor = BoostedTrees::fit(
            Objective::SquaredError,
            &BoostingParams::regressor(),
            &rows,
            &targets,
            None,
        );
        let classifier = BoostedTrees::fit(
            Objective::Logistic,
            &BoostingParams::classifier(),
            &rows,
            &labels,
            None,
        );

        let defaults: DefaultFillTable = schema
            .names()
            .iter()
            .map(|n| {
                let value = if n == "day_of_month" || n == "month" { 1.0 } else { 0.0 };
                (n.clone(), value)
            })
            .collect();
        let metrics = EvaluationMetrics {
            train_rows: 48,
            test_rows: 12,
            violation_rate: 0.7,
            mae: 0.1,
            classification: ClassificationMetrics::from_decisions(&[true], &[true]),
        };
        let artifact = |role, model| ModelArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            run_id: run_id.to_string(),
            role,
            trained_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            feature_schema: schema.clone(),
            constants: DecisionConstants::default(),
            defaults: defaults.clone(),
            metrics: metrics.clone(),
            model,
        };

        ArtifactPair::new(
            artifact(ModelRole::Regressor, regressor),
            artifact(ModelRole::Classifier, classifier),
        )
        .unwrap()
    }

    #[test]
    fn test_fixture_pair_is_coherent() {
        let pair = fixture_pair("run-a");
        assert_eq!(pair.run_id(), "run-a");
        assert_eq!(pair.schema(), &FeatureSchema::standard());
    }

    #[test]
    fn test_mixed_runs_rejected() {
        let a = fixture_pair("run-a");
        let b = fixture_pair("run-b");
        let err = ArtifactPair::new(a.regressor().clone(), b.classifier().clone()).unwrap_err();
        assert!(matches!(err, ForecastError::IncompatibleArtifacts(_)));
    }

    #[test]
    fn test_swapped_roles_rejected() {
        let pair = fixture_pair("run-a");
        let err =
            ArtifactPair::new(pair.classifier().clone(), pair.regressor().clone()).unwrap_err();
        assert!(matches!(err, ForecastError::IncompatibleArtifacts(_)));
    }

    #[test]
    fn test_differing_constants_rejected() {
        let pair = fixture_pair("run-a");
        let mut classifier = pair.classifier().clone();
        classifier.constants.who_threshold = 25.0;
        let err = ArtifactPair::new(pair.regressor().clone(), classifier).unwrap_err();
        assert!(matches!(err, ForecastError::IncompatibleArtifacts(_)));
    }

    #[test]
    fn test_json_preserves_schema_order() {
        let pair = fixture_pair("run-a");
        let bytes = pair.regressor().to_json().unwrap();
        let parsed = ModelArtifact::from_json(&bytes).unwrap();
        assert_eq!(parsed.feature_schema.names(), FeatureSchema::standard().names());
        assert_eq!(&parsed, pair.regressor());
    }

    #[test]
    fn test_future_format_rejected() {
        let pair = fixture_pair("run-a");
        let mut value = serde_json::to_value(pair.regressor()).unwrap();
        value["format_version"] = serde_json::json!(2);
        let bytes = serde_json::to_vec(&value).unwrap();
        let err = ModelArtifact::from_json(&bytes).unwrap_err();
        assert!(matches!(
            err,
            ForecastError::UnsupportedFormat {
                found: 2,
                expected: 1
            }
        ));
    }

    #[test]
    fn test_defaults_are_medians() {
        let schema = Arc::new(FeatureSchema::new(vec!["hour".into(), "lag_1h".into()]));
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let rows = [(3.0, 1.0), (4.0, 10.0), (8.0, 2.0), (9.0, 5.0)]
            .iter()
            .enumerate()
            .map(|(i, &(h, l))| FeatureRow {
                timestamp: start + chrono::Duration::hours(i as i64),
                values: vec![h, l],
                labels: None,
            })
            .collect();
        let table = FeatureTable::new(schema, rows).unwrap();
        let defaults = DefaultFillTable::from_table(&table);
        // hour median 6.0, lag median 3.5
        assert_eq!(defaults.get("hour"), Some(6.0));
        assert_eq!(defaults.get("lag_1h"), Some(3.5));
    }
}
