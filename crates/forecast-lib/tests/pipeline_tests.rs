//! End-to-end tests: raw series to stored artifacts to predictions

use chrono::{DateTime, Duration, TimeZone, Utc};
use forecast_lib::features::FeatureRow;
use forecast_lib::predictor::documented_scenarios;
use forecast_lib::trainer::BoostingParams;
use forecast_lib::{
    ArtifactStore, DecisionConstants, FeatureBuilder, FeatureSchema, FeatureTable, Labels,
    ModelTrainer, Observation, PredictionService, ScenarioOverrides, SeriesStore,
    TrainerConfig,
};
use std::sync::Arc;
use tempfile::TempDir;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Alternating 72h clean and polluted blocks
fn series(hours: usize) -> Vec<Observation> {
    (0..hours)
        .map(|i| {
            let base = if (i / 72) % 2 == 0 { 6.0 } else { 32.0 };
            let wobble = ((i * 11) % 7) as f64 * 0.2;
            Observation::new(start() + Duration::hours(i as i64), base + wobble)
        })
        .collect()
}

fn trainer() -> ModelTrainer {
    let config = TrainerConfig {
        regressor: BoostingParams {
            n_estimators: 30,
            ..BoostingParams::regressor()
        },
        classifier: BoostingParams {
            n_estimators: 30,
            ..BoostingParams::classifier()
        },
        ..TrainerConfig::default()
    };
    ModelTrainer::new(config, DecisionConstants::default())
}

fn concentration_scenario(level: f64, hour: f64) -> ScenarioOverrides {
    let mut overrides = ScenarioOverrides::new().with("hour", hour);
    for name in [
        "lag_1h",
        "lag_24h",
        "lag_168h",
        "rolling_mean_6h",
        "rolling_mean_24h",
        "rolling_mean_168h",
        "ema_24h",
        "ema_7d",
    ] {
        overrides.set(name, level);
    }
    overrides
}

/// Calendar and concentration columns only, three polluted hours in every
/// five so the stored medians sit in the polluted regime
fn regime_table(rows: usize) -> FeatureTable {
    let schema = Arc::new(FeatureSchema::new(
        ["hour", "day_of_week", "lag_1h", "lag_24h", "rolling_mean_24h"]
            .iter()
            .map(|name| name.to_string())
            .collect(),
    ));
    let rows = (0..rows)
        .map(|i| {
            let polluted = i % 5 < 3;
            let (level, target) = if polluted {
                (18.0 + ((i * 7) % 17) as f64, 25.0 + (i % 9) as f64)
            } else {
                (5.0 + (i % 6) as f64, 6.0 + (i % 4) as f64 * 0.5)
            };
            FeatureRow {
                timestamp: start() + Duration::hours(i as i64),
                values: vec![
                    (i % 24) as f64,
                    ((i / 24) % 7) as f64,
                    level,
                    level + 0.5,
                    level - 0.3,
                ],
                labels: Some(Labels {
                    target_pm25: target,
                    target_violation: polluted,
                }),
            }
        })
        .collect();
    FeatureTable::new(schema, rows).unwrap()
}

#[test]
fn test_documented_scenarios_against_trained_pair() {
    let outcome = trainer().train(&regime_table(400)).unwrap();
    let service = PredictionService::new(outcome.artifacts);

    let scenarios = documented_scenarios();
    let evening = service.predict_quick(&scenarios[0].overrides).unwrap();
    assert!(evening.violation_flag, "{:?}", evening);
    assert!(evening.pm25_estimate > 15.0, "{:?}", evening);
    assert!((0.5..=1.0).contains(&evening.confidence));

    let morning = service.predict_quick(&scenarios[1].overrides).unwrap();
    assert!(!morning.violation_flag, "{:?}", morning);
    assert!(morning.pm25_estimate < 15.0, "{:?}", morning);
    assert!((0.5..=1.0).contains(&morning.confidence));
}

#[test]
fn test_quick_flag_names_reach_the_trained_pair() {
    let outcome = trainer().train(&regime_table(400)).unwrap();
    let service = PredictionService::new(outcome.artifacts);

    let clean = ScenarioOverrides::new()
        .with("hour", 9.0)
        .with("day_of_week", 1.0)
        .with("rolling_24h", 8.2)
        .with("lag_1", 7.9)
        .with("lag_24", 9.1)
        .with("rolling_mean_24", 8.5);
    let session = service.session();
    let result = session.predict_quick(&clean).unwrap();
    assert!(!result.violation_flag, "{:?}", result);

    let canonical = ScenarioOverrides::new()
        .with("hour", 9.0)
        .with("day_of_week", 1.0)
        .with("lag_1h", 7.9)
        .with("lag_24h", 9.1)
        .with("rolling_mean_24h", 8.5);
    assert_eq!(session.predict_quick(&canonical).unwrap(), result);
}

#[test]
fn test_csv_to_served_predictions() {
    let dir = TempDir::new().unwrap();
    let raw_path = dir.path().join("raw.csv");
    SeriesStore::write_observations(&raw_path, &series(1200)).unwrap();

    let observations = SeriesStore::load_csv(&raw_path).unwrap();
    assert_eq!(observations.len(), 1200);

    let (table, report) = FeatureBuilder::default().build(&observations).unwrap();
    assert_eq!(report.rows + report.excluded_rows, 1200);
    assert_eq!(report.excluded_rows, 169);

    let features_path = dir.path().join("features.csv");
    SeriesStore::write_feature_table(&features_path, &table).unwrap();
    let table = SeriesStore::read_feature_table(&features_path).unwrap();

    let outcome = trainer().train(&table).unwrap();
    let store = ArtifactStore::open(dir.path().join("models"), 3).unwrap();
    store.save(&outcome.artifacts).unwrap();

    let loaded = store.load_current().unwrap();
    assert_eq!(loaded.run_id(), outcome.report.run_id);
    assert_eq!(loaded.schema().names(), table.schema().names());

    let service = PredictionService::new(loaded);
    let results = service.predict_batch(&table).unwrap();
    assert_eq!(results.len(), table.len());
    for (row, result) in table.rows().iter().zip(&results) {
        assert_eq!(result.timestamp, Some(row.timestamp));
        assert!(result.pm25_estimate >= 0.0);
        assert!((0.5..=1.0).contains(&result.confidence));
    }

    let predictions_path = dir.path().join("predictions.csv");
    SeriesStore::write_predictions(&predictions_path, &table, &results).unwrap();
    let written = std::fs::read_to_string(&predictions_path).unwrap();
    assert_eq!(written.lines().count(), table.len() + 1);
    assert!(written.lines().next().unwrap().ends_with("confidence,alert"));
}

#[test]
fn test_split_never_trains_on_later_rows() {
    let (table, _) = FeatureBuilder::default().build(&series(800)).unwrap();
    let outcome = trainer().train(&table).unwrap();
    let report = outcome.report;

    assert!(report.train_end < report.test_start);
    assert_eq!(
        report.metrics.train_rows + report.metrics.test_rows,
        table.len()
    );
    assert_eq!(report.metrics.train_rows, (table.len() as f64 * 0.8) as usize);
}

#[test]
fn test_scenarios_move_in_the_expected_direction() {
    let (table, _) = FeatureBuilder::default().build(&series(1200)).unwrap();
    let outcome = trainer().train(&table).unwrap();
    let service = PredictionService::new(outcome.artifacts);

    let polluted = service
        .predict_quick(&concentration_scenario(32.0, 18.0))
        .unwrap();
    assert!(polluted.pm25_estimate > 20.0, "{:?}", polluted);
    assert!(polluted.violation_flag);

    let clean = service
        .predict_quick(&concentration_scenario(6.0, 9.0))
        .unwrap();
    assert!(clean.pm25_estimate < 12.0, "{:?}", clean);
    assert!(!clean.violation_flag);
    assert!(clean.violation_probability < polluted.violation_probability);
}

#[test]
fn test_decision_does_not_use_who_threshold_at_serve_time() {
    let (table, _) = FeatureBuilder::default().build(&series(900)).unwrap();
    let outcome = trainer().train(&table).unwrap();
    let service = PredictionService::new(outcome.artifacts);

    for index in 0..50 {
        let vector = table.vector(index).unwrap();
        let result = service.predict(&vector).unwrap();
        assert_eq!(
            result.violation_flag,
            result.violation_probability >= 0.5,
            "flag must follow the classifier, not the estimate"
        );
    }
}

#[test]
fn test_exclusion_boundary() {
    let builder = FeatureBuilder::default();

    // 168h of history plus the observation itself plus its label
    let (table, report) = builder.build(&series(170)).unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(report.excluded_rows, 169);
    assert_eq!(table.rows()[0].timestamp, start() + Duration::hours(168));

    let (table, _) = builder.build(&series(169)).unwrap();
    assert!(table.is_empty());
}

#[test]
fn test_retraining_rolls_back_to_previous_run() {
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::open(dir.path(), 5).unwrap();
    let (table, _) = FeatureBuilder::default().build(&series(600)).unwrap();

    let first = trainer()
        .train_at(&table, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
        .unwrap();
    let second = trainer()
        .train_at(&table, Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap())
        .unwrap();
    store.save(&first.artifacts).unwrap();
    store.save(&second.artifacts).unwrap();

    assert_eq!(
        store.current_run().unwrap().as_deref(),
        Some(second.report.run_id.as_str())
    );
    let restored = store.rollback().unwrap();
    assert_eq!(restored.as_deref(), Some(first.report.run_id.as_str()));
    assert_eq!(store.load_current().unwrap().run_id(), first.report.run_id);
}
