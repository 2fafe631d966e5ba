//! Hold-out evaluation metrics

use serde::{Deserialize, Serialize};

/// Mean absolute error; 0 for empty input
pub fn mean_absolute_error(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    actual
        .iter()
        .zip(predicted.iter())
        .map(|(a, p)| (a - p).abs())
        .sum::<f64>()
        / actual.len() as f64
}

/// Confusion matrix for binary classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub tp: usize,
    pub tn: usize,
    pub fp: usize,
    pub fn_: usize,
}

impl ConfusionMatrix {
    pub fn from_decisions(actual: &[bool], predicted: &[bool]) -> Self {
        let mut m = Self::default();
        for (&t, &p) in actual.iter().zip(predicted.iter()) {
            match (t, p) {
                (true, true) => m.tp += 1,
                (false, false) => m.tn += 1,
                (false, true) => m.fp += 1,
                (true, false) => m.fn_ += 1,
            }
        }
        m
    }

    pub fn total(&self) -> usize {
        self.tp + self.tn + self.fp + self.fn_
    }
}

/// Classifier scores on the held-out partition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub confusion: ConfusionMatrix,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl ClassificationMetrics {
    /// Scores from decisions already thresholded at the classification cutoff.
    /// Undefined ratios (no positives predicted, none present) are 0.
    pub fn from_decisions(actual: &[bool], predicted: &[bool]) -> Self {
        let confusion = ConfusionMatrix::from_decisions(actual, predicted);
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };

        let precision = ratio(confusion.tp, confusion.tp + confusion.fp);
        let recall = ratio(confusion.tp, confusion.tp + confusion.fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            confusion,
            accuracy: ratio(confusion.tp + confusion.tn, confusion.total()),
            precision,
            recall,
            f1,
        }
    }
}
