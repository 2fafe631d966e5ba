//! Core data models for the forecaster

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// WHO 24h guideline value used to label a violation (µg/m³)
pub const WHO_THRESHOLD: f64 = 15.0;

/// Probability cutoff separating predicted violation from predicted safe
pub const CLASSIFICATION_CUTOFF: f64 = 0.5;

/// A single hourly PM2.5 reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub pm25: f64,
}

impl Observation {
    pub fn new(timestamp: DateTime<Utc>, pm25: f64) -> Self {
        Self { timestamp, pm25 }
    }
}

/// Decision constants shared by label generation and inference.
///
/// `who_threshold` defines ground truth when labels are built;
/// `classification_cutoff` is the classifier's decision boundary. They are
/// carried together so both stages read the same value, but no code path
/// derives one from the other.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionConstants {
    pub who_threshold: f64,
    pub classification_cutoff: f64,
}

impl DecisionConstants {
    /// Label a concentration against the WHO threshold (strictly greater)
    pub fn is_violation(&self, pm25: f64) -> bool {
        pm25 > self.who_threshold
    }

    /// Decide on a classifier probability
    pub fn decide(&self, probability: f64) -> bool {
        probability >= self.classification_cutoff
    }
}

impl Default for DecisionConstants {
    fn default() -> Self {
        Self {
            who_threshold: WHO_THRESHOLD,
            classification_cutoff: CLASSIFICATION_CUTOFF,
        }
    }
}

/// Training labels for one feature row
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Labels {
    pub target_pm25: f64,
    pub target_violation: bool,
}

/// Verdict for one feature vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub timestamp: Option<DateTime<Utc>>,
    pub pm25_estimate: f64,
    pub violation_flag: bool,
    /// Raw classifier probability of a violation
    pub violation_probability: f64,
    /// Distance from maximal uncertainty, `max(p, 1 - p)`
    pub confidence: f64,
}

impl PredictionResult {
    pub fn band(&self) -> ConfidenceBand {
        ConfidenceBand::from_confidence(self.confidence)
    }
}

/// Coarse confidence bucket for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            ConfidenceBand::High
        } else if confidence >= 0.6 {
            ConfidenceBand::Medium
        } else {
            ConfidenceBand::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceBand::High => "HIGH",
            ConfidenceBand::Medium => "MEDIUM",
            ConfidenceBand::Low => "LOW",
        }
    }
}
