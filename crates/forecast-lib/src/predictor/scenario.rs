//! Partial "what if" scenarios expanded into full feature vectors
//!
//! A caller names a handful of features; everything else comes from the
//! default-fill table stored with the artifacts (training medians), or from
//! the scenario timestamp for calendar fields.

use crate::artifact::{ArtifactPair, DefaultFillTable};
use crate::error::{ForecastError, Result};
use crate::features::{
    calendar_fields, FeatureKind, FeatureSchema, FeatureVector, CALENDAR_FEATURES,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Short names accepted in place of schema names. When several aliases of
/// one feature are supplied, the one listed first wins.
pub const FEATURE_ALIASES: [(&str, &str); 5] = [
    ("lag_1", "lag_1h"),
    ("lag_24", "lag_24h"),
    ("rolling_mean_24", "rolling_mean_24h"),
    ("rolling_24h", "rolling_mean_24h"),
    ("rolling_6h", "rolling_mean_6h"),
];

/// Schema name for `name`, resolving aliases
pub fn canonical_name(name: &str) -> &str {
    FEATURE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(name)
}

/// Caller-supplied feature values for a single scenario
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioOverrides {
    /// When set, calendar fields not overridden are derived from it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
}

impl ScenarioOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp.is_none() && self.values.is_empty()
    }
}

/// A named scenario used for demonstration reports
#[derive(Debug, Clone)]
pub struct NamedScenario {
    pub name: &'static str,
    pub description: &'static str,
    pub overrides: ScenarioOverrides,
}

/// The two reference scenarios: a polluted evening and a clean morning
pub fn documented_scenarios() -> Vec<NamedScenario> {
    vec![
        NamedScenario {
            name: "high_pollution_evening",
            description: "18:00 after a day averaging 20.5 µg/m³",
            overrides: ScenarioOverrides::new()
                .with("hour", 18.0)
                .with("rolling_24h", 20.5),
        },
        NamedScenario {
            name: "clean_morning",
            description: "Tuesday 09:00 with readings around 8 µg/m³",
            overrides: ScenarioOverrides::new()
                .with("hour", 9.0)
                .with("day_of_week", 1.0)
                .with("rolling_24h", 8.2)
                .with("lag_1h", 7.9)
                .with("lag_24h", 9.1)
                .with("rolling_mean_24h", 8.5),
        },
    ]
}

/// Expands overrides against one artifact pair's schema and defaults
pub struct ScenarioResolver<'a> {
    schema: &'a FeatureSchema,
    defaults: &'a DefaultFillTable,
}

impl<'a> ScenarioResolver<'a> {
    pub fn new(schema: &'a FeatureSchema, defaults: &'a DefaultFillTable) -> Self {
        Self { schema, defaults }
    }

    pub fn from_pair(pair: &'a ArtifactPair) -> Self {
        Self::new(pair.schema(), pair.defaults())
    }

    /// Validate overrides and assemble a vector in schema order.
    ///
    /// Precedence per feature: explicit override, then the scenario
    /// timestamp (calendar fields only), then the stored default.
    pub fn resolve(&self, overrides: &ScenarioOverrides) -> Result<FeatureVector> {
        let explicit = self.canonicalize(overrides)?;
        let calendar = overrides.timestamp.map(calendar_fields);

        let mut values = Vec::with_capacity(self.schema.len());
        for name in self.schema.names() {
            let from_timestamp = calendar.and_then(|fields| {
                CALENDAR_FEATURES
                    .iter()
                    .position(|c| *c == name.as_str())
                    .map(|i| fields[i])
            });
            let value = explicit
                .get(name.as_str())
                .copied()
                .or(from_timestamp)
                .or_else(|| self.defaults.get(name))
                .ok_or_else(|| ForecastError::SchemaMismatch {
                    role: "scenario".to_string(),
                    detail: format!("no override or default for '{}'", name),
                })?;
            values.push(value);
        }

        debug!(
            overridden = explicit.len(),
            defaulted = self.schema.len() - explicit.len(),
            "Resolved scenario"
        );

        Ok(FeatureVector {
            timestamp: overrides.timestamp,
            schema: Arc::new(self.schema.clone()),
            values,
        })
    }

    /// Map every supplied name onto the schema, validating each value.
    ///
    /// A canonical name beats its aliases, and aliases follow
    /// [`FEATURE_ALIASES`] order; shadowed values are dropped with a debug log.
    fn canonicalize(&self, overrides: &ScenarioOverrides) -> Result<BTreeMap<String, f64>> {
        let mut explicit: BTreeMap<String, f64> = BTreeMap::new();

        for (name, &value) in &overrides.values {
            let canonical = canonical_name(name);
            let check = if self.schema.position(canonical).is_none() {
                Err("not a feature of the loaded model".to_string())
            } else {
                match FeatureKind::of(canonical) {
                    Some(kind) => kind.check(value),
                    None if value.is_finite() => Ok(()),
                    None => Err("value must be finite".to_string()),
                }
            };
            check.map_err(|reason| ForecastError::InvalidOverride {
                feature: name.clone(),
                value,
                reason,
            })?;
            if canonical == name.as_str() {
                explicit.insert(name.clone(), value);
            }
        }

        for (alias, canonical) in FEATURE_ALIASES {
            let Some(&value) = overrides.values.get(alias) else {
                continue;
            };
            match explicit.get(canonical) {
                Some(&kept) => {
                    if kept != value {
                        debug!(
                            alias,
                            feature = canonical,
                            dropped = value,
                            kept,
                            "Alias value shadowed"
                        );
                    }
                }
                None => {
                    explicit.insert(canonical.to_string(), value);
                }
            }
        }

        Ok(explicit)
    }
}
