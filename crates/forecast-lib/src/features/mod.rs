//! Feature engineering for next-hour PM2.5 forecasting
//!
//! Turns an hourly observation series into a feature table of calendar
//! encodings, lags, rolling statistics and exponential moving averages,
//! plus next-hour labels. Every feature at time `t` is computed from
//! observations at or before `t`; only the labels look one hour ahead.

mod builder;
mod window;

pub use builder::{BuildReport, FeatureBuilder};
pub use window::{ExponentialAverage, RollingWindow};

use crate::error::{ForecastError, Result};
use crate::models::Labels;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lag offsets in hours
pub const LAG_HOURS: [usize; 3] = [1, 24, 168];

/// Trailing window lengths in hours
pub const WINDOW_HOURS: [usize; 3] = [6, 24, 168];

/// EMA half-lives in hours, paired with their feature names
pub const EMA_HALF_LIVES: [(&str, f64); 2] = [("ema_24h", 24.0), ("ema_7d", 168.0)];

/// Longest lookback any feature needs
pub const MAX_LOOKBACK_HOURS: usize = 168;

/// Calendar features, derived from the timestamp alone
pub const CALENDAR_FEATURES: [&str; 4] = ["hour", "day_of_week", "day_of_month", "month"];

/// Calendar encodings of a timestamp, in [`CALENDAR_FEATURES`] order.
/// Day of week counts from Monday = 0.
pub fn calendar_fields(timestamp: DateTime<Utc>) -> [f64; 4] {
    [
        timestamp.hour() as f64,
        timestamp.weekday().num_days_from_monday() as f64,
        timestamp.day() as f64,
        timestamp.month() as f64,
    ]
}

/// Domain of a feature, used to validate caller-supplied values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    /// Integer calendar field with an inclusive range
    Calendar { min: u32, max: u32 },
    /// A concentration in µg/m³ (lags, means, EMAs)
    Concentration,
    /// A standard deviation of concentrations
    Dispersion,
}

/// Static description of one engineered feature
#[derive(Debug, Clone, Copy)]
pub struct FeatureSpec {
    pub name: &'static str,
    pub kind: FeatureKind,
}

impl FeatureSpec {
    const fn calendar(name: &'static str, min: u32, max: u32) -> Self {
        Self {
            name,
            kind: FeatureKind::Calendar { min, max },
        }
    }

    const fn concentration(name: &'static str) -> Self {
        Self {
            name,
            kind: FeatureKind::Concentration,
        }
    }

    const fn dispersion(name: &'static str) -> Self {
        Self {
            name,
            kind: FeatureKind::Dispersion,
        }
    }
}

/// The engineered features in schema order
pub const STANDARD_FEATURES: [FeatureSpec; 15] = [
    FeatureSpec::calendar("hour", 0, 23),
    FeatureSpec::calendar("day_of_week", 0, 6),
    FeatureSpec::calendar("day_of_month", 1, 31),
    FeatureSpec::calendar("month", 1, 12),
    FeatureSpec::concentration("lag_1h"),
    FeatureSpec::concentration("lag_24h"),
    FeatureSpec::concentration("lag_168h"),
    FeatureSpec::concentration("rolling_mean_6h"),
    FeatureSpec::dispersion("rolling_std_6h"),
    FeatureSpec::concentration("rolling_mean_24h"),
    FeatureSpec::dispersion("rolling_std_24h"),
    FeatureSpec::concentration("rolling_mean_168h"),
    FeatureSpec::dispersion("rolling_std_168h"),
    FeatureSpec::concentration("ema_24h"),
    FeatureSpec::concentration("ema_7d"),
];

impl FeatureKind {
    /// Look up the kind of a known feature name
    pub fn of(name: &str) -> Option<FeatureKind> {
        STANDARD_FEATURES
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| spec.kind)
    }

    /// Check a value against this domain, returning the reason on failure
    pub fn check(&self, value: f64) -> std::result::Result<(), String> {
        if !value.is_finite() {
            return Err("value must be finite".to_string());
        }
        match *self {
            FeatureKind::Calendar { min, max } => {
                if value.fract() != 0.0 {
                    return Err("calendar fields must be whole numbers".to_string());
                }
                if value < min as f64 || value > max as f64 {
                    return Err(format!("must be within {}..={}", min, max));
                }
            }
            FeatureKind::Concentration => {
                if value < 0.0 {
                    return Err("concentration cannot be negative".to_string());
                }
            }
            FeatureKind::Dispersion => {
                if value < 0.0 {
                    return Err("standard deviation cannot be negative".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Ordered feature names. The order is part of the model contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSchema {
    names: Vec<String>,
}

impl FeatureSchema {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Schema produced by [`FeatureBuilder`]
    pub fn standard() -> Self {
        Self::new(STANDARD_FEATURES.iter().map(|s| s.name.to_string()).collect())
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Require `candidate` to list exactly these names in exactly this order.
    ///
    /// Nothing is reordered on the caller's behalf: a permutation of the right
    /// names is still a mismatch.
    pub fn ensure_matches(&self, candidate: &FeatureSchema, role: &str) -> Result<()> {
        if self == candidate {
            return Ok(());
        }

        let missing: Vec<&str> = self
            .names
            .iter()
            .filter(|n| candidate.position(n).is_none())
            .map(String::as_str)
            .collect();
        let unexpected: Vec<&str> = candidate
            .names
            .iter()
            .filter(|n| self.position(n).is_none())
            .map(String::as_str)
            .collect();

        let detail = if !missing.is_empty() || !unexpected.is_empty() {
            format!("missing {:?}, unexpected {:?}", missing, unexpected)
        } else if self.len() != candidate.len() {
            format!(
                "expected {} features, got {} (duplicated names)",
                self.len(),
                candidate.len()
            )
        } else {
            let idx = self
                .names
                .iter()
                .zip(candidate.names.iter())
                .position(|(a, b)| a != b)
                .unwrap_or(0);
            format!(
                "order differs at position {}: expected '{}', got '{}'",
                idx, self.names[idx], candidate.names[idx]
            )
        };

        Err(ForecastError::SchemaMismatch {
            role: role.to_string(),
            detail,
        })
    }

    /// Reject NaN and infinite values; trees cannot route them consistently
    pub fn ensure_finite(&self, values: &[f64], location: &str) -> Result<()> {
        match values.iter().position(|v| !v.is_finite()) {
            None => Ok(()),
            Some(i) => Err(ForecastError::NonFiniteFeature {
                feature: self
                    .names
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("#{}", i)),
                location: location.to_string(),
                value: values[i],
            }),
        }
    }
}

/// One row of the feature table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub timestamp: DateTime<Utc>,
    pub values: Vec<f64>,
    pub labels: Option<Labels>,
}

/// A single feature vector ready for inference
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub timestamp: Option<DateTime<Utc>>,
    pub schema: Arc<FeatureSchema>,
    pub values: Vec<f64>,
}

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.schema.position(name).map(|i| self.values[i])
    }
}

/// Time-ordered feature rows sharing one schema
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    schema: Arc<FeatureSchema>,
    rows: Vec<FeatureRow>,
}

impl FeatureTable {
    /// Build a table, rejecting rows whose width disagrees with the schema
    /// and rows holding non-finite features or targets
    pub fn new(schema: Arc<FeatureSchema>, rows: Vec<FeatureRow>) -> Result<Self> {
        for row in &rows {
            if row.values.len() != schema.len() {
                return Err(ForecastError::SchemaMismatch {
                    role: "feature_table".to_string(),
                    detail: format!(
                        "row at {} has {} values, schema has {}",
                        row.timestamp,
                        row.values.len(),
                        schema.len()
                    ),
                });
            }
            let location = row.timestamp.to_rfc3339();
            schema.ensure_finite(&row.values, &location)?;
            if let Some(labels) = row.labels.filter(|l| !l.target_pm25.is_finite()) {
                return Err(ForecastError::NonFiniteFeature {
                    feature: "target_pm25".to_string(),
                    location,
                    value: labels.target_pm25,
                });
            }
        }
        Ok(Self { schema, rows })
    }

    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Split into `[..index]` and `[index..]` without reordering
    pub fn split_at(&self, index: usize) -> (FeatureTable, FeatureTable) {
        let index = index.min(self.rows.len());
        let (head, tail) = self.rows.split_at(index);
        (
            FeatureTable {
                schema: Arc::clone(&self.schema),
                rows: head.to_vec(),
            },
            FeatureTable {
                schema: Arc::clone(&self.schema),
                rows: tail.to_vec(),
            },
        )
    }

    /// All values of one feature column
    pub fn column(&self, index: usize) -> Vec<f64> {
        self.rows.iter().map(|r| r.values[index]).collect()
    }

    pub fn vector(&self, index: usize) -> Option<FeatureVector> {
        self.rows.get(index).map(|row| FeatureVector {
            timestamp: Some(row.timestamp),
            schema: Arc::clone(&self.schema),
            values: row.values.clone(),
        })
    }

    /// Descriptive statistics of the table, logged after feature generation
    pub fn summary(&self) -> TableSummary {
        let labelled: Vec<&Labels> = self.rows.iter().filter_map(|r| r.labels.as_ref()).collect();
        let violations = labelled.iter().filter(|l| l.target_violation).count();
        let targets = labelled.iter().map(|l| l.target_pm25);

        TableSummary {
            samples: self.rows.len(),
            features: self.schema.len(),
            labelled: labelled.len(),
            violation_rate: if labelled.is_empty() {
                0.0
            } else {
                violations as f64 / labelled.len() as f64
            },
            pm25_min: targets.clone().reduce(f64::min),
            pm25_max: targets.reduce(f64::max),
        }
    }
}

/// Summary statistics of a feature table
#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    pub samples: usize,
    pub features: usize,
    pub labelled: usize,
    pub violation_rate: f64,
    /// `None` when no row is labelled
    pub pm25_min: Option<f64>,
    pub pm25_max: Option<f64>,
}
