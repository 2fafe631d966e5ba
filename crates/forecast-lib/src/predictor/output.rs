//! Reporting shapes built from prediction results

use crate::artifact::{ArtifactPair, DefaultFillTable, EvaluationMetrics};
use crate::models::{DecisionConstants, PredictionResult};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Aggregate view of a batch of predictions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub count: usize,
    pub violations: usize,
    pub violation_share: f64,
    pub pm25_min: Option<f64>,
    pub pm25_max: Option<f64>,
    pub mean_confidence: Option<f64>,
}

impl BatchSummary {
    pub fn from_results(results: &[PredictionResult]) -> Self {
        let count = results.len();
        let violations = results.iter().filter(|r| r.violation_flag).count();
        let estimates = results.iter().map(|r| r.pm25_estimate);

        Self {
            count,
            violations,
            violation_share: if count == 0 {
                0.0
            } else {
                violations as f64 / count as f64
            },
            pm25_min: estimates.clone().reduce(f64::min),
            pm25_max: estimates.reduce(f64::max),
            mean_confidence: if count == 0 {
                None
            } else {
                Some(results.iter().map(|r| r.confidence).sum::<f64>() / count as f64)
            },
        }
    }
}

/// Description of the loaded artifact pair
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub run_id: String,
    pub trained_at: DateTime<Utc>,
    pub feature_schema: Vec<String>,
    pub constants: DecisionConstants,
    pub metrics: EvaluationMetrics,
    pub defaults: DefaultFillTable,
}

impl From<&ArtifactPair> for ServiceInfo {
    fn from(pair: &ArtifactPair) -> Self {
        Self {
            run_id: pair.run_id().to_string(),
            trained_at: pair.trained_at(),
            feature_schema: pair.schema().names().to_vec(),
            constants: *pair.constants(),
            metrics: pair.metrics().clone(),
            defaults: pair.defaults().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(estimate: f64, p: f64) -> PredictionResult {
        PredictionResult {
            timestamp: None,
            pm25_estimate: estimate,
            violation_flag: p >= 0.5,
            violation_probability: p,
            confidence: p.max(1.0 - p),
        }
    }

    #[test]
    fn test_batch_summary() {
        let summary =
            BatchSummary::from_results(&[result(4.0, 0.1), result(22.0, 0.9), result(30.0, 0.7)]);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.violations, 2);
        assert!((summary.violation_share - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(summary.pm25_min, Some(4.0));
        assert_eq!(summary.pm25_max, Some(30.0));
        assert!((summary.mean_confidence.unwrap() - 2.5 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_batch_summary() {
        let summary = BatchSummary::from_results(&[]);
        assert_eq!(summary.count, 0);
        assert_eq!(summary.violation_share, 0.0);
        assert_eq!(summary.pm25_min, None);
        assert_eq!(summary.mean_confidence, None);
    }
}
