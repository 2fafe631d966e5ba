//! Model training
//!
//! Fits the concentration regressor and the violation classifier on the
//! leading part of a time-ordered feature table and scores them on the
//! trailing part. Rows are never shuffled.

mod boosting;
mod metrics;

pub use boosting::{BoostedTrees, BoostingParams, Objective, RegressionTree, TreeNode};
pub use metrics::{mean_absolute_error, ClassificationMetrics, ConfusionMatrix};

use crate::artifact::{
    ArtifactPair, DefaultFillTable, EvaluationMetrics, ModelArtifact, ModelRole,
    ARTIFACT_FORMAT_VERSION,
};
use crate::error::{ForecastError, Result};
use crate::features::{FeatureRow, FeatureTable};
use crate::models::DecisionConstants;
use crate::observability::ForecastMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Instant;
use tracing::{debug, info};

/// Training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Leading share of rows used for fitting (0 < f < 1)
    pub train_fraction: f64,
    /// Smallest acceptable training partition
    pub min_train_rows: usize,
    pub regressor: BoostingParams,
    pub classifier: BoostingParams,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            train_fraction: 0.8,
            min_train_rows: 2,
            regressor: BoostingParams::regressor(),
            classifier: BoostingParams::classifier(),
        }
    }
}

impl TrainerConfig {
    /// Index of the first test row for a table of `rows` rows
    pub fn split_index(&self, rows: usize) -> usize {
        (rows as f64 * self.train_fraction).floor() as usize
    }

    /// Fewest rows giving a non-empty test partition and a training
    /// partition of at least `min_train_rows`
    pub fn min_viable_rows(&self) -> usize {
        let min_train = self.min_train_rows.max(1);
        (min_train + 1..=min_train.saturating_mul(1000).max(1000))
            .find(|&n| {
                let split = self.split_index(n);
                split >= min_train && split < n
            })
            .unwrap_or(usize::MAX)
    }

    fn validate(&self) -> Result<()> {
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            return Err(ForecastError::InvalidConfig(format!(
                "train_fraction must be within (0, 1), got {}",
                self.train_fraction
            )));
        }
        Ok(())
    }
}

/// Summary of one training run
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub run_id: String,
    pub trained_at: DateTime<Utc>,
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
    pub test_start: DateTime<Utc>,
    pub test_end: DateTime<Utc>,
    pub metrics: EvaluationMetrics,
    pub duration_secs: f64,
}

/// Artifacts plus the report describing how they were produced
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub artifacts: ArtifactPair,
    pub report: TrainingReport,
}

/// Fits the regressor/classifier pair
#[derive(Debug, Clone)]
pub struct ModelTrainer {
    config: TrainerConfig,
    constants: DecisionConstants,
}

impl ModelTrainer {
    pub fn new(config: TrainerConfig, constants: DecisionConstants) -> Self {
        Self { config, constants }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn train(&self, table: &FeatureTable) -> Result<TrainingOutcome> {
        self.train_at(table, Utc::now())
    }

    /// Train with an explicit training timestamp (part of the run id)
    pub fn train_at(
        &self,
        table: &FeatureTable,
        trained_at: DateTime<Utc>,
    ) -> Result<TrainingOutcome> {
        let start = Instant::now();
        self.config.validate()?;
        self.check_table(table)?;

        let n = table.len();
        let split = self.config.split_index(n);
        let required = self.config.min_viable_rows();
        if n < required || split < self.config.min_train_rows || split >= n {
            return Err(ForecastError::InsufficientTrainingData { rows: n, required });
        }

        let (train, test) = table.split_at(split);
        debug!(
            train_rows = train.len(),
            test_rows = test.len(),
            train_end = %train.rows()[train.len() - 1].timestamp,
            test_start = %test.rows()[0].timestamp,
            "Time-ordered split"
        );

        let x_train: Vec<Vec<f64>> = train.rows().iter().map(|r| r.values.clone()).collect();
        let y_pm25: Vec<f64> = train.rows().iter().map(target_pm25).collect();
        let y_violation: Vec<bool> = train.rows().iter().map(target_violation).collect();
        let y_class: Vec<f64> = y_violation.iter().map(|&v| if v { 1.0 } else { 0.0 }).collect();
        let weights = balanced_weights(&y_violation);

        let regressor = BoostedTrees::fit(
            Objective::SquaredError,
            &self.config.regressor,
            &x_train,
            &y_pm25,
            None,
        );
        let classifier = BoostedTrees::fit(
            Objective::Logistic,
            &self.config.classifier,
            &x_train,
            &y_class,
            Some(&weights),
        );

        let actual_pm25: Vec<f64> = test.rows().iter().map(target_pm25).collect();
        let predicted_pm25: Vec<f64> = test
            .rows()
            .iter()
            .map(|r| regressor.predict(&r.values).max(0.0))
            .collect();
        let actual_violation: Vec<bool> = test.rows().iter().map(target_violation).collect();
        let decisions: Vec<bool> = test
            .rows()
            .iter()
            .map(|r| self.constants.decide(classifier.predict(&r.values)))
            .collect();

        let metrics = EvaluationMetrics {
            train_rows: train.len(),
            test_rows: test.len(),
            violation_rate: table.summary().violation_rate,
            mae: mean_absolute_error(&actual_pm25, &predicted_pm25),
            classification: ClassificationMetrics::from_decisions(&actual_violation, &decisions),
        };

        let run_id = format!(
            "{}-{}",
            trained_at.format("%Y%m%dT%H%M%SZ"),
            &table_fingerprint(table)[..8]
        );
        let defaults = DefaultFillTable::from_table(&train);

        let artifact = |role, model| ModelArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            run_id: run_id.clone(),
            role,
            trained_at,
            feature_schema: table.schema().as_ref().clone(),
            constants: self.constants,
            defaults: defaults.clone(),
            metrics: metrics.clone(),
            model,
        };
        let artifacts = ArtifactPair::new(
            artifact(ModelRole::Regressor, regressor),
            artifact(ModelRole::Classifier, classifier),
        )?;

        let duration_secs = start.elapsed().as_secs_f64();
        ForecastMetrics::new().observe_training(duration_secs);

        info!(
            run_id = %run_id,
            train_rows = metrics.train_rows,
            test_rows = metrics.test_rows,
            mae = metrics.mae,
            f1 = metrics.classification.f1,
            duration_secs = duration_secs,
            "Training complete"
        );

        let report = TrainingReport {
            run_id,
            trained_at,
            train_start: train.rows()[0].timestamp,
            train_end: train.rows()[train.len() - 1].timestamp,
            test_start: test.rows()[0].timestamp,
            test_end: test.rows()[test.len() - 1].timestamp,
            metrics,
            duration_secs,
        };

        Ok(TrainingOutcome { artifacts, report })
    }

    /// Rows must be strictly time-ordered, labelled, and labelled with this
    /// trainer's WHO threshold.
    fn check_table(&self, table: &FeatureTable) -> Result<()> {
        if table.is_empty() {
            return Err(ForecastError::InsufficientTrainingData {
                rows: 0,
                required: self.config.min_viable_rows(),
            });
        }

        for pair in table.rows().windows(2) {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(ForecastError::InvalidObservation {
                    timestamp: pair[1].timestamp,
                    reason: format!(
                        "feature rows out of time order (follows {})",
                        pair[0].timestamp
                    ),
                });
            }
        }

        for row in table.rows() {
            let labels = row.labels.ok_or_else(|| ForecastError::SchemaMismatch {
                role: "labels".to_string(),
                detail: format!("row at {} has no labels", row.timestamp),
            })?;
            if labels.target_violation != self.constants.is_violation(labels.target_pm25) {
                return Err(ForecastError::SchemaMismatch {
                    role: "labels".to_string(),
                    detail: format!(
                        "target_violation at {} disagrees with who_threshold {}",
                        row.timestamp, self.constants.who_threshold
                    ),
                });
            }
        }
        Ok(())
    }
}

fn target_pm25(row: &FeatureRow) -> f64 {
    row.labels.map(|l| l.target_pm25).unwrap_or_default()
}

fn target_violation(row: &FeatureRow) -> bool {
    row.labels.map(|l| l.target_violation).unwrap_or_default()
}

/// `w_c = n / (2 * n_c)`, so both classes carry equal total weight.
/// A class absent from `labels` leaves everyone at weight 1.
pub fn balanced_weights(labels: &[bool]) -> Vec<f64> {
    let n = labels.len() as f64;
    let positives = labels.iter().filter(|&&v| v).count() as f64;
    let negatives = n - positives;
    if positives == 0.0 || negatives == 0.0 {
        return vec![1.0; labels.len()];
    }
    let w_pos = n / (2.0 * positives);
    let w_neg = n / (2.0 * negatives);
    labels
        .iter()
        .map(|&v| if v { w_pos } else { w_neg })
        .collect()
}

/// SHA-256 over the schema and every row, lowercase hex
fn table_fingerprint(table: &FeatureTable) -> String {
    let mut hasher = Sha256::new();
    for name in table.schema().names() {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
    }
    for row in table.rows() {
        hasher.update(row.timestamp.timestamp().to_le_bytes());
        for v in &row.values {
            hasher.update(v.to_le_bytes());
        }
        if let Some(labels) = row.labels {
            hasher.update(labels.target_pm25.to_le_bytes());
            hasher.update([labels.target_violation as u8]);
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureBuilder;
    use crate::test_support::regime_series;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn quick_config() -> TrainerConfig {
        TrainerConfig {
            regressor: BoostingParams {
                n_estimators: 20,
                ..BoostingParams::regressor()
            },
            classifier: BoostingParams {
                n_estimators: 20,
                ..BoostingParams::classifier()
            },
            ..TrainerConfig::default()
        }
    }

    fn trained_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn table(hours: usize) -> FeatureTable {
        FeatureBuilder::default()
            .build(&regime_series(hours))
            .unwrap()
            .0
    }

    #[test]
    fn test_split_is_time_ordered() {
        let table = table(600);
        let trainer = ModelTrainer::new(quick_config(), DecisionConstants::default());
        let outcome = trainer.train_at(&table, trained_at()).unwrap();
        let report = &outcome.report;

        assert!(report.train_end < report.test_start);
        assert_eq!(
            report.metrics.train_rows,
            (table.len() as f64 * 0.8).floor() as usize
        );
        assert_eq!(report.metrics.train_rows + report.metrics.test_rows, table.len());
        assert_eq!(report.train_start, table.rows()[0].timestamp);
        assert_eq!(report.test_end, table.rows()[table.len() - 1].timestamp);
    }

    #[test]
    fn test_artifacts_carry_table_schema_and_constants() {
        let table = table(600);
        let constants = DecisionConstants::default();
        let outcome = ModelTrainer::new(quick_config(), constants)
            .train_at(&table, trained_at())
            .unwrap();

        let pair = &outcome.artifacts;
        assert_eq!(pair.schema(), table.schema().as_ref());
        assert_eq!(pair.constants(), &constants);
        assert_eq!(pair.defaults().len(), table.schema().len());
        assert!(pair.run_id().starts_with("20240601T120000Z-"));
        assert_eq!(pair.run_id(), outcome.report.run_id);
    }

    #[test]
    fn test_models_learn_regimes() {
        let table = table(900);
        let outcome = ModelTrainer::new(quick_config(), DecisionConstants::default())
            .train_at(&table, trained_at())
            .unwrap();
        let metrics = &outcome.report.metrics;
        // regime switches every 72h; only the switch hours are hard
        assert!(metrics.mae < 5.0, "mae was {}", metrics.mae);
        assert!(
            metrics.classification.f1 > 0.8,
            "f1 was {}",
            metrics.classification.f1
        );
    }

    #[test]
    fn test_empty_table_is_insufficient() {
        let (empty, _) = table(600).split_at(0);
        let err = ModelTrainer::new(quick_config(), DecisionConstants::default())
            .train(&empty)
            .unwrap_err();
        assert!(matches!(
            err,
            ForecastError::InsufficientTrainingData { rows: 0, .. }
        ));
    }

    #[test]
    fn test_too_few_rows_is_insufficient() {
        let (two, _) = table(600).split_at(2);
        let err = ModelTrainer::new(quick_config(), DecisionConstants::default())
            .train(&two)
            .unwrap_err();
        assert!(matches!(
            err,
            ForecastError::InsufficientTrainingData {
                rows: 2,
                required: 3
            }
        ));

        let (three, _) = table(600).split_at(3);
        assert!(ModelTrainer::new(quick_config(), DecisionConstants::default())
            .train(&three)
            .is_ok());
    }

    #[test]
    fn test_cutoff_does_not_change_fitted_models() {
        let table = table(600);
        let strict = DecisionConstants {
            classification_cutoff: 0.9,
            ..DecisionConstants::default()
        };
        let a = ModelTrainer::new(quick_config(), DecisionConstants::default())
            .train_at(&table, trained_at())
            .unwrap();
        let b = ModelTrainer::new(quick_config(), strict)
            .train_at(&table, trained_at())
            .unwrap();

        assert_eq!(a.artifacts.classifier().model, b.artifacts.classifier().model);
        assert_eq!(a.artifacts.regressor().model, b.artifacts.regressor().model);
    }

    #[test]
    fn test_labels_from_other_threshold_rejected() {
        let table = table(600);
        let other = DecisionConstants {
            who_threshold: 25.0,
            ..DecisionConstants::default()
        };
        // readings sit near 5 or 30, so thresholds 15 and 25 agree on every label
        let all_safe: Vec<FeatureRow> = table
            .rows()
            .iter()
            .cloned()
            .map(|mut row| {
                if let Some(labels) = row.labels.as_mut() {
                    labels.target_violation = false;
                }
                row
            })
            .collect();
        let relabelled = FeatureTable::new(Arc::clone(table.schema()), all_safe).unwrap();
        assert!(ModelTrainer::new(quick_config(), other).train(&table).is_ok());
        let err = ModelTrainer::new(quick_config(), DecisionConstants::default())
            .train(&relabelled)
            .unwrap_err();
        assert!(matches!(err, ForecastError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_out_of_range_fraction_is_config_error() {
        let config = TrainerConfig {
            train_fraction: 1.0,
            ..quick_config()
        };
        let err = ModelTrainer::new(config, DecisionConstants::default())
            .train(&table(600))
            .unwrap_err();
        assert!(matches!(err, ForecastError::InvalidConfig(_)));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_balanced_weights() {
        let w = balanced_weights(&[true, false, false, false]);
        assert!((w[0] - 2.0).abs() < 1e-12);
        assert!((w[1] - 2.0 / 3.0).abs() < 1e-12);
        let total_pos: f64 = w[..1].iter().sum();
        let total_neg: f64 = w[1..].iter().sum();
        assert!((total_pos - total_neg).abs() < 1e-12);

        assert_eq!(balanced_weights(&[false, false]), vec![1.0, 1.0]);
    }

    #[test]
    fn test_min_viable_rows() {
        assert_eq!(TrainerConfig::default().min_viable_rows(), 3);
        let config = TrainerConfig {
            min_train_rows: 10,
            ..TrainerConfig::default()
        };
        // floor(13 * 0.8) = 10
        assert_eq!(config.min_viable_rows(), 13);
    }
}
