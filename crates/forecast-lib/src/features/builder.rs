//! Single-pass feature table construction

use super::{
    calendar_fields, ExponentialAverage, FeatureRow, FeatureSchema, FeatureTable, RollingWindow,
    EMA_HALF_LIVES, LAG_HOURS, MAX_LOOKBACK_HOURS, WINDOW_HOURS,
};
use crate::error::{ForecastError, Result};
use crate::models::{DecisionConstants, Labels, Observation};
use crate::observability::ForecastMetrics;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Outcome counts of one build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub observations: usize,
    pub rows: usize,
    /// Observations without full lookback or without a next-hour label
    pub excluded_rows: usize,
    /// Breaks in hourly continuity; each one restarts the lookback
    pub gaps: usize,
}

/// Builds causal feature rows from an hourly observation series
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    constants: DecisionConstants,
    schema: Arc<FeatureSchema>,
}

impl FeatureBuilder {
    pub fn new(constants: DecisionConstants) -> Self {
        Self {
            constants,
            schema: Arc::new(FeatureSchema::standard()),
        }
    }

    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    pub fn constants(&self) -> &DecisionConstants {
        &self.constants
    }

    /// Build the labelled feature table for a whole series.
    ///
    /// Rows lacking the 168h lookback or the next-hour label are dropped,
    /// never filled.
    pub fn build(&self, observations: &[Observation]) -> Result<(FeatureTable, BuildReport)> {
        validate_series(observations)?;

        let start = Instant::now();
        let mut state = SeriesState::new();
        let mut rows = Vec::new();
        let mut report = BuildReport {
            observations: observations.len(),
            ..Default::default()
        };

        for (i, obs) in observations.iter().enumerate() {
            if i > 0 && !is_next_hour(&observations[i - 1], obs) {
                let gap = ForecastError::InsufficientHistory {
                    timestamp: obs.timestamp,
                    reason: format!(
                        "gap after {}, next {} hours lack lookback",
                        observations[i - 1].timestamp, MAX_LOOKBACK_HOURS
                    ),
                };
                warn!(kind = gap.kind(), error = %gap, "Gap in hourly series, restarting lookback");
                report.gaps += 1;
                state.reset();
            }

            let features = state.push(obs);
            let next = observations.get(i + 1).filter(|next| is_next_hour(obs, next));

            match (features, next) {
                (Some(values), Some(next)) => rows.push(FeatureRow {
                    timestamp: obs.timestamp,
                    values,
                    labels: Some(Labels {
                        target_pm25: next.pm25,
                        target_violation: self.constants.is_violation(next.pm25),
                    }),
                }),
                _ => report.excluded_rows += 1,
            }
        }

        report.rows = rows.len();
        let table = FeatureTable::new(Arc::clone(&self.schema), rows)?;
        ForecastMetrics::new()
            .observe_feature_build(start.elapsed().as_secs_f64(), report.excluded_rows);

        info!(
            observations = report.observations,
            rows = report.rows,
            excluded = report.excluded_rows,
            gaps = report.gaps,
            features = self.schema.len(),
            "Generated feature table"
        );

        Ok((table, report))
    }
}

impl Default for FeatureBuilder {
    fn default() -> Self {
        Self::new(DecisionConstants::default())
    }
}

fn validate_series(observations: &[Observation]) -> Result<()> {
    if observations.is_empty() {
        return Err(ForecastError::DataUnavailable);
    }
    for (i, obs) in observations.iter().enumerate() {
        if !obs.pm25.is_finite() || obs.pm25 < 0.0 {
            return Err(ForecastError::InvalidObservation {
                timestamp: obs.timestamp,
                reason: format!("pm25 must be finite and non-negative, got {}", obs.pm25),
            });
        }
        if i > 0 && obs.timestamp <= observations[i - 1].timestamp {
            return Err(ForecastError::InvalidObservation {
                timestamp: obs.timestamp,
                reason: "timestamps must be strictly increasing".to_string(),
            });
        }
    }
    Ok(())
}

fn is_next_hour(prev: &Observation, next: &Observation) -> bool {
    next.timestamp - prev.timestamp == Duration::hours(1)
}

/// Accumulators for one contiguous segment of the series
struct SeriesState {
    history: RollingWindow,
    windows: Vec<RollingWindow>,
    emas: Vec<ExponentialAverage>,
    segment_len: usize,
}

impl SeriesState {
    fn new() -> Self {
        Self {
            // newest sample plus 168 lagged ones
            history: RollingWindow::new(MAX_LOOKBACK_HOURS + 1),
            windows: WINDOW_HOURS.iter().map(|&h| RollingWindow::new(h)).collect(),
            emas: EMA_HALF_LIVES
                .iter()
                .map(|&(_, half_life)| ExponentialAverage::from_half_life(half_life))
                .collect(),
            segment_len: 0,
        }
    }

    fn reset(&mut self) {
        self.history.clear();
        self.windows.iter_mut().for_each(RollingWindow::clear);
        self.emas.iter_mut().for_each(ExponentialAverage::reset);
        self.segment_len = 0;
    }

    /// Absorb one observation; returns its features once the lookback is full
    fn push(&mut self, obs: &Observation) -> Option<Vec<f64>> {
        self.segment_len += 1;
        self.history.push(obs.pm25);
        for window in &mut self.windows {
            window.push(obs.pm25);
        }
        for ema in &mut self.emas {
            ema.update(obs.pm25);
        }

        if self.segment_len <= MAX_LOOKBACK_HOURS {
            return None;
        }
        Some(self.features(obs.timestamp))
    }

    fn features(&self, timestamp: DateTime<Utc>) -> Vec<f64> {
        let mut values = Vec::with_capacity(15);
        values.extend(calendar_fields(timestamp));
        for lag in LAG_HOURS {
            values.push(self.history.back(lag).unwrap_or_default());
        }
        for window in &self.windows {
            values.push(window.mean());
            values.push(window.std_dev());
        }
        for ema in &self.emas {
            values.push(ema.value());
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        // a Monday
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn series(values: impl IntoIterator<Item = f64>) -> Vec<Observation> {
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| Observation::new(start() + Duration::hours(i as i64), v))
            .collect()
    }

    fn ramp(n: usize) -> Vec<Observation> {
        series((0..n).map(|i| i as f64))
    }

    fn wavy(n: usize) -> Vec<Observation> {
        series((0..n).map(|i| 12.0 + 8.0 * ((i as f64) / 5.0).sin() + (i % 7) as f64))
    }

    fn value(table: &FeatureTable, row: usize, name: &str) -> f64 {
        let idx = table.schema().position(name).unwrap();
        table.rows()[row].values[idx]
    }

    #[test]
    fn test_empty_series_is_unavailable() {
        let builder = FeatureBuilder::default();
        assert!(matches!(
            builder.build(&[]),
            Err(ForecastError::DataUnavailable)
        ));
    }

    #[test]
    fn test_row_exclusion_boundary() {
        let builder = FeatureBuilder::default();
        let obs = ramp(200);
        let (table, report) = builder.build(&obs).unwrap();

        // indices 168..=198 have full lookback and a label
        assert_eq!(table.len(), 31);
        assert_eq!(report.excluded_rows, 169);
        assert_eq!(table.rows()[0].timestamp, obs[168].timestamp);
        for early in &obs[..167] {
            assert!(table.rows().iter().all(|r| r.timestamp != early.timestamp));
        }
    }

    #[test]
    fn test_short_series_yields_empty_table() {
        let builder = FeatureBuilder::default();
        let (table, report) = builder.build(&ramp(169)).unwrap();
        assert!(table.is_empty());
        assert_eq!(report.excluded_rows, 169);
    }

    #[test]
    fn test_lags_and_windows_on_ramp() {
        let builder = FeatureBuilder::default();
        let (table, _) = builder.build(&ramp(200)).unwrap();
        // first row is index 168, value 168
        assert_eq!(value(&table, 0, "lag_1h"), 167.0);
        assert_eq!(value(&table, 0, "lag_24h"), 144.0);
        assert_eq!(value(&table, 0, "lag_168h"), 0.0);
        assert!((value(&table, 0, "rolling_mean_6h") - 165.5).abs() < 1e-9);
        assert!((value(&table, 0, "rolling_std_6h") - 3.5_f64.sqrt()).abs() < 1e-9);
        assert!((value(&table, 0, "rolling_mean_168h") - 84.5).abs() < 1e-9);
    }

    #[test]
    fn test_labels_look_one_hour_ahead() {
        let builder = FeatureBuilder::default();
        let (table, _) = builder.build(&ramp(200)).unwrap();
        let labels = table.rows()[0].labels.unwrap();
        assert_eq!(labels.target_pm25, 169.0);
        assert!(labels.target_violation);

        let (low, _) = builder.build(&series(vec![15.0; 200])).unwrap();
        // exactly at the threshold is not a violation
        assert!(!low.rows()[0].labels.unwrap().target_violation);
    }

    #[test]
    fn test_calendar_encodings() {
        let builder = FeatureBuilder::default();
        let (table, _) = builder.build(&ramp(200)).unwrap();
        // index 168 = 2024-01-08 00:00, a Monday
        assert_eq!(value(&table, 0, "hour"), 0.0);
        assert_eq!(value(&table, 0, "day_of_week"), 0.0);
        assert_eq!(value(&table, 0, "day_of_month"), 8.0);
        assert_eq!(value(&table, 0, "month"), 1.0);
        assert_eq!(value(&table, 5, "hour"), 5.0);
    }

    #[test]
    fn test_features_are_causal() {
        let builder = FeatureBuilder::default();
        let obs = wavy(400);
        let (full, _) = builder.build(&obs).unwrap();

        for cut in [170, 200, 263, 350] {
            // keep the label observation for the last row
            let (prefix, _) = builder.build(&obs[..=cut + 1]).unwrap();
            for row in prefix.rows() {
                let twin = full
                    .rows()
                    .iter()
                    .find(|r| r.timestamp == row.timestamp)
                    .expect("row missing from full table");
                assert_eq!(twin.values, row.values, "feature drift at {}", row.timestamp);
            }
        }
    }

    #[test]
    fn test_future_values_do_not_change_features() {
        let builder = FeatureBuilder::default();
        let mut obs = wavy(300);
        let (before, _) = builder.build(&obs).unwrap();
        for o in obs.iter_mut().skip(250) {
            o.pm25 += 100.0;
        }
        let (after, _) = builder.build(&obs).unwrap();
        // row for index 248 has label at 249; untouched by the change
        let idx = 248 - 168;
        assert_eq!(before.rows()[idx].values, after.rows()[idx].values);
        assert_eq!(before.rows()[idx].labels, after.rows()[idx].labels);
    }

    #[test]
    fn test_build_is_idempotent() {
        let builder = FeatureBuilder::default();
        let obs = wavy(500);
        let (a, ra) = builder.build(&obs).unwrap();
        let (b, rb) = builder.build(&obs).unwrap();
        assert_eq!(a, b);
        assert_eq!(ra, rb);
    }

    #[test]
    fn test_gap_restarts_lookback() {
        let builder = FeatureBuilder::default();
        let mut obs = wavy(500);
        for o in obs.iter_mut().skip(250) {
            o.timestamp = o.timestamp + Duration::hours(3);
        }
        let (table, report) = builder.build(&obs).unwrap();
        assert_eq!(report.gaps, 1);
        // 81 rows per 250-long segment
        assert_eq!(table.len(), 162);
        assert!(table
            .rows()
            .iter()
            .all(|r| r.timestamp != obs[249].timestamp));
        assert!(table
            .rows()
            .iter()
            .all(|r| r.timestamp < obs[249].timestamp || r.timestamp >= obs[250 + 168].timestamp));
    }

    #[test]
    fn test_unordered_series_rejected() {
        let builder = FeatureBuilder::default();
        let mut obs = ramp(10);
        obs.swap(3, 4);
        assert!(matches!(
            builder.build(&obs),
            Err(ForecastError::InvalidObservation { .. })
        ));

        let mut dup = ramp(10);
        dup[5].timestamp = dup[4].timestamp;
        assert!(builder.build(&dup).is_err());
    }

    #[test]
    fn test_negative_concentration_rejected() {
        let builder = FeatureBuilder::default();
        let mut obs = ramp(10);
        obs[2].pm25 = -1.0;
        assert!(matches!(
            builder.build(&obs),
            Err(ForecastError::InvalidObservation { .. })
        ));
    }
}
