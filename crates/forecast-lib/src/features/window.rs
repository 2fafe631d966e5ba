//! Bounded-window accumulators for single-pass causal features

use std::collections::VecDeque;

/// Fixed-length trailing window over the most recent samples.
///
/// The window includes the sample just pushed, so after pushing the value
/// at `t` the statistics cover `t - len + 1 ..= t`. Running sums are
/// updated on push and eviction, so statistics cost O(1) per sample.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    samples: VecDeque<f64>,
    sum: f64,
    sum_sq: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum -= evicted;
                self.sum_sq -= evicted * evicted;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.sum / self.samples.len() as f64
    }

    /// Sample standard deviation (Bessel's correction)
    pub fn std_dev(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let n = n as f64;
        let centered = self.sum_sq - self.sum * self.sum / n;
        // rounding can leave a tiny negative residue on flat windows
        (centered.max(0.0) / (n - 1.0)).sqrt()
    }

    /// Value `offset` samples back from the newest one (0 = newest)
    pub fn back(&self, offset: usize) -> Option<f64> {
        let n = self.samples.len();
        if offset >= n {
            return None;
        }
        self.samples.get(n - 1 - offset).copied()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }
}

/// Bias-adjusted exponentially weighted mean with a half-life in samples.
///
/// Equivalent to weighting the sample `i` steps back by `decay^i` and
/// dividing by the sum of weights, so early values are not biased toward 0.
#[derive(Debug, Clone)]
pub struct ExponentialAverage {
    decay: f64,
    weighted_sum: f64,
    weight_total: f64,
}

impl ExponentialAverage {
    pub fn from_half_life(half_life: f64) -> Self {
        Self {
            decay: 0.5_f64.powf(1.0 / half_life),
            weighted_sum: 0.0,
            weight_total: 0.0,
        }
    }

    pub fn update(&mut self, value: f64) -> f64 {
        self.weighted_sum = value + self.decay * self.weighted_sum;
        self.weight_total = 1.0 + self.decay * self.weight_total;
        self.value()
    }

    pub fn value(&self) -> f64 {
        if self.weight_total == 0.0 {
            return 0.0;
        }
        self.weighted_sum / self.weight_total
    }

    pub fn reset(&mut self) {
        self.weighted_sum = 0.0;
        self.weight_total = 0.0;
    }
}
