//! Gradient-boosted regression trees
//!
//! Second-order boosting over histogram-binned features. Each feature is
//! cut into at most `max_bins` buckets once per fit; trees are grown
//! depth-first by scanning per-node gradient/hessian histograms. The fitted
//! model is a flat node array per tree so it serializes without pointers.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Loss minimised by the ensemble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Continuous target, squared error
    SquaredError,
    /// Binary target in {0, 1}, log loss; predictions are probabilities
    Logistic,
}

/// Boosting hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostingParams {
    /// Number of boosting rounds (trees)
    pub n_estimators: usize,
    /// Maximum depth of each tree
    pub max_depth: usize,
    /// Shrinkage applied to every leaf
    pub learning_rate: f64,
    /// L2 regularisation on leaf weights
    pub lambda: f64,
    /// Minimum hessian sum in each child
    pub min_child_weight: f64,
    /// Minimum loss reduction to accept a split
    pub min_split_gain: f64,
    /// Maximum histogram buckets per feature
    pub max_bins: usize,
}

impl BoostingParams {
    /// Defaults for the concentration regressor
    pub fn regressor() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 6,
            learning_rate: 0.3,
            lambda: 1.0,
            min_child_weight: 1.0,
            min_split_gain: 0.0,
            max_bins: 64,
        }
    }

    /// Defaults for the violation classifier
    pub fn classifier() -> Self {
        Self {
            max_depth: 4,
            ..Self::regressor()
        }
    }
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self::regressor()
    }
}

/// Node of a fitted tree; children are indices into the tree's node array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

/// A single regression tree; samples with `x[feature] <= threshold` go left
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<TreeNode>,
}

impl RegressionTree {
    pub fn predict(&self, features: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match self.nodes.get(idx) {
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    idx = if features[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
                Some(TreeNode::Leaf { value }) => return *value,
                None => return 0.0,
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[TreeNode], idx: usize) -> usize {
            match nodes.get(idx) {
                Some(TreeNode::Split { left, right, .. }) => {
                    1 + walk(nodes, *left).max(walk(nodes, *right))
                }
                _ => 0,
            }
        }
        walk(&self.nodes, 0)
    }

    /// Check child indices point forward and stay in bounds
    fn is_well_formed(&self, n_features: usize) -> bool {
        !self.nodes.is_empty()
            && self.nodes.iter().enumerate().all(|(i, node)| match node {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    *feature < n_features
                        && threshold.is_finite()
                        && *left > i
                        && *right > i
                        && *left < self.nodes.len()
                        && *right < self.nodes.len()
                }
                TreeNode::Leaf { value } => value.is_finite(),
            })
    }
}

/// Fitted additive tree ensemble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedTrees {
    objective: Objective,
    n_features: usize,
    base_score: f64,
    trees: Vec<RegressionTree>,
}

impl BoostedTrees {
    /// Fit an ensemble on row-major features.
    ///
    /// `weights` scales each sample's gradient and hessian; `None` means 1.
    /// Fitting is deterministic: identical inputs give identical trees.
    pub fn fit(
        objective: Objective,
        params: &BoostingParams,
        rows: &[Vec<f64>],
        targets: &[f64],
        weights: Option<&[f64]>,
    ) -> Self {
        let n_features = rows.first().map(|r| r.len()).unwrap_or(0);
        let unit = vec![1.0; rows.len()];
        let weights = weights.unwrap_or(&unit);

        let base_score = initial_score(objective, targets, weights);
        let mut model = Self {
            objective,
            n_features,
            base_score,
            trees: Vec::with_capacity(params.n_estimators),
        };
        if rows.is_empty() || n_features == 0 {
            return model;
        }

        let binned = BinnedMatrix::new(rows, params.max_bins.max(2));
        let mut raw = vec![base_score; rows.len()];
        let mut grad = vec![0.0; rows.len()];
        let mut hess = vec![0.0; rows.len()];

        for round in 0..params.n_estimators {
            for i in 0..rows.len() {
                let (g, h) = gradient(objective, raw[i], targets[i]);
                grad[i] = g * weights[i];
                hess[i] = h * weights[i];
            }

            let mut grower = TreeGrower {
                binned: &binned,
                grad: &grad,
                hess: &hess,
                params,
                nodes: Vec::new(),
            };
            let indices: Vec<usize> = (0..rows.len()).collect();
            grower.grow(indices, 0);
            let tree = RegressionTree {
                nodes: grower.nodes,
            };

            for (i, row) in rows.iter().enumerate() {
                raw[i] += tree.predict(row);
            }

            if round % 25 == 0 {
                debug!(
                    round,
                    nodes = tree.node_count(),
                    depth = tree.depth(),
                    "Fitted boosting round"
                );
            }
            model.trees.push(tree);
        }

        model
    }

    /// Additive score before the link function
    pub fn raw_score(&self, features: &[f64]) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.predict(features)).sum::<f64>()
    }

    /// Prediction on the target scale: a value for squared error, a
    /// probability for the logistic objective
    pub fn predict(&self, features: &[f64]) -> f64 {
        let raw = self.raw_score(features);
        match self.objective {
            Objective::SquaredError => raw,
            Objective::Logistic => sigmoid(raw),
        }
    }

    pub fn objective(&self) -> Objective {
        self.objective
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Structural validity of a deserialized model
    pub fn is_well_formed(&self) -> bool {
        self.base_score.is_finite() && self.trees.iter().all(|t| t.is_well_formed(self.n_features))
    }
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn initial_score(objective: Objective, targets: &[f64], weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let mean = targets
        .iter()
        .zip(weights.iter())
        .map(|(y, w)| y * w)
        .sum::<f64>()
        / total;
    match objective {
        Objective::SquaredError => mean,
        Objective::Logistic => {
            let p = mean.clamp(1e-6, 1.0 - 1e-6);
            (p / (1.0 - p)).ln()
        }
    }
}

/// First and second derivative of the loss with respect to the raw score
fn gradient(objective: Objective, raw: f64, target: f64) -> (f64, f64) {
    match objective {
        Objective::SquaredError => (raw - target, 1.0),
        Objective::Logistic => {
            let p = sigmoid(raw);
            (p - target, (p * (1.0 - p)).max(1e-16))
        }
    }
}

/// Column-major bucket indices plus the split threshold of each bucket edge
struct BinnedMatrix {
    /// `bins[f][i]`: bucket of sample `i` on feature `f`
    bins: Vec<Vec<u16>>,
    /// `thresholds[f][b]`: samples in buckets `0..=b` satisfy `x <= thresholds[f][b]`
    thresholds: Vec<Vec<f64>>,
}

impl BinnedMatrix {
    fn new(rows: &[Vec<f64>], max_bins: usize) -> Self {
        let n_features = rows[0].len();
        let mut bins = Vec::with_capacity(n_features);
        let mut thresholds = Vec::with_capacity(n_features);

        for f in 0..n_features {
            let column: Vec<f64> = rows.iter().map(|r| r[f]).collect();
            let cuts = bucket_edges(&column, max_bins);
            let assigned = column
                .iter()
                .map(|v| cuts.partition_point(|t| t < v) as u16)
                .collect();
            bins.push(assigned);
            thresholds.push(cuts);
        }

        Self { bins, thresholds }
    }

    fn n_bins(&self, feature: usize) -> usize {
        self.thresholds[feature].len() + 1
    }
}

/// Split candidates for one column: midpoints between distinct values when
/// there are few of them, otherwise quantile cut points.
fn bucket_edges(column: &[f64], max_bins: usize) -> Vec<f64> {
    let mut sorted = column.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mut distinct = sorted.clone();
    distinct.dedup();

    if distinct.len() <= max_bins {
        return distinct.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();
    }

    let mut cuts: Vec<f64> = (1..max_bins)
        .map(|k| sorted[k * sorted.len() / max_bins])
        .collect();
    cuts.dedup();
    // the largest value never splits anything off
    if let (Some(last_cut), Some(max)) = (cuts.last(), sorted.last()) {
        if last_cut >= max {
            cuts.pop();
        }
    }
    cuts
}

struct TreeGrower<'a> {
    binned: &'a BinnedMatrix,
    grad: &'a [f64],
    hess: &'a [f64],
    params: &'a BoostingParams,
    nodes: Vec<TreeNode>,
}

struct SplitCandidate {
    feature: usize,
    bin: usize,
    gain: f64,
}

impl TreeGrower<'_> {
    fn grow(&mut self, indices: Vec<usize>, depth: usize) -> usize {
        let id = self.nodes.len();
        self.nodes.push(TreeNode::Leaf { value: 0.0 });

        let (g_sum, h_sum) = indices.iter().fold((0.0, 0.0), |(g, h), &i| {
            (g + self.grad[i], h + self.hess[i])
        });

        let split = if depth < self.params.max_depth
            && h_sum >= 2.0 * self.params.min_child_weight
            && indices.len() > 1
        {
            self.best_split(&indices, g_sum, h_sum)
        } else {
            None
        };

        match split {
            Some(split) => {
                let bins = &self.binned.bins[split.feature];
                let (left, right): (Vec<usize>, Vec<usize>) = indices
                    .into_iter()
                    .partition(|&i| (bins[i] as usize) <= split.bin);
                let threshold = self.binned.thresholds[split.feature][split.bin];
                let left_id = self.grow(left, depth + 1);
                let right_id = self.grow(right, depth + 1);
                self.nodes[id] = TreeNode::Split {
                    feature: split.feature,
                    threshold,
                    left: left_id,
                    right: right_id,
                };
            }
            None => {
                let weight = -g_sum / (h_sum + self.params.lambda);
                self.nodes[id] = TreeNode::Leaf {
                    value: weight * self.params.learning_rate,
                };
            }
        }
        id
    }

    fn best_split(&self, indices: &[usize], g_sum: f64, h_sum: f64) -> Option<SplitCandidate> {
        let lambda = self.params.lambda;
        let parent = g_sum * g_sum / (h_sum + lambda);
        let mut best: Option<SplitCandidate> = None;

        for feature in 0..self.binned.bins.len() {
            let n_bins = self.binned.n_bins(feature);
            if n_bins < 2 {
                continue;
            }
            let bins = &self.binned.bins[feature];
            let mut g_hist = vec![0.0; n_bins];
            let mut h_hist = vec![0.0; n_bins];
            for &i in indices {
                let b = bins[i] as usize;
                g_hist[b] += self.grad[i];
                h_hist[b] += self.hess[i];
            }

            let (mut g_left, mut h_left) = (0.0, 0.0);
            // the last bucket cannot be a left side: nothing would go right
            for bin in 0..n_bins - 1 {
                g_left += g_hist[bin];
                h_left += h_hist[bin];
                let g_right = g_sum - g_left;
                let h_right = h_sum - h_left;
                if h_left < self.params.min_child_weight || h_right < self.params.min_child_weight
                {
                    continue;
                }
                let gain = 0.5
                    * (g_left * g_left / (h_left + lambda) + g_right * g_right / (h_right + lambda)
                        - parent);
                if gain > self.params.min_split_gain
                    && best.as_ref().map_or(true, |b| gain > b.gain)
                {
                    best = Some(SplitCandidate { feature, bin, gain });
                }
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_data() -> (Vec<Vec<f64>>, Vec<f64>) {
        let rows: Vec<Vec<f64>> = (0..200).map(|i| vec![i as f64, (i % 3) as f64]).collect();
        let targets = rows
            .iter()
            .map(|r| if r[0] < 100.0 { 5.0 } else { 30.0 })
            .collect();
        (rows, targets)
    }

    #[test]
    fn test_regressor_learns_step() {
        let (rows, targets) = step_data();
        let model = BoostedTrees::fit(
            Objective::SquaredError,
            &BoostingParams::regressor(),
            &rows,
            &targets,
            None,
        );
        assert!((model.predict(&[10.0, 0.0]) - 5.0).abs() < 0.5);
        assert!((model.predict(&[150.0, 1.0]) - 30.0).abs() < 0.5);
        assert_eq!(model.n_trees(), 100);
        assert!(model.is_well_formed());
    }

    #[test]
    fn test_classifier_outputs_probabilities() {
        let (rows, targets) = step_data();
        let labels: Vec<f64> = targets.iter().map(|&t| if t > 15.0 { 1.0 } else { 0.0 }).collect();
        let model = BoostedTrees::fit(
            Objective::Logistic,
            &BoostingParams::classifier(),
            &rows,
            &labels,
            None,
        );
        let low = model.predict(&[20.0, 2.0]);
        let high = model.predict(&[180.0, 2.0]);
        assert!((0.0..=1.0).contains(&low) && (0.0..=1.0).contains(&high));
        assert!(low < 0.1, "low was {}", low);
        assert!(high > 0.9, "high was {}", high);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let (rows, targets) = step_data();
        let params = BoostingParams {
            n_estimators: 10,
            ..BoostingParams::regressor()
        };
        let a = BoostedTrees::fit(Objective::SquaredError, &params, &rows, &targets, None);
        let b = BoostedTrees::fit(Objective::SquaredError, &params, &rows, &targets, None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_weights_shift_base_score() {
        let rows = vec![vec![0.0]; 4];
        let labels = vec![1.0, 0.0, 0.0, 0.0];
        let params = BoostingParams {
            n_estimators: 0,
            ..BoostingParams::classifier()
        };
        let unweighted = BoostedTrees::fit(Objective::Logistic, &params, &rows, &labels, None);
        assert!((unweighted.predict(&[0.0]) - 0.25).abs() < 1e-9);

        let balanced = [2.0, 2.0 / 3.0, 2.0 / 3.0, 2.0 / 3.0];
        let weighted =
            BoostedTrees::fit(Objective::Logistic, &params, &rows, &labels, Some(&balanced));
        assert!((weighted.predict(&[0.0]) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_bucket_edges_small_domain_uses_midpoints() {
        let edges = bucket_edges(&[3.0, 1.0, 2.0, 2.0], 64);
        assert_eq!(edges, vec![1.5, 2.5]);
    }

    #[test]
    fn test_bucket_edges_are_capped() {
        let column: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let edges = bucket_edges(&column, 16);
        assert!(edges.len() < 16);
        assert!(edges.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_constant_feature_yields_single_leaf() {
        let rows = vec![vec![1.0]; 10];
        let targets: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let params = BoostingParams {
            n_estimators: 1,
            ..BoostingParams::regressor()
        };
        let model = BoostedTrees::fit(Objective::SquaredError, &params, &rows, &targets, None);
        assert_eq!(model.trees[0].node_count(), 1);
        assert!((model.predict(&[1.0]) - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_malformed_tree_detected() {
        let model = BoostedTrees {
            objective: Objective::SquaredError,
            n_features: 1,
            base_score: 0.0,
            trees: vec![RegressionTree {
                nodes: vec![TreeNode::Split {
                    feature: 3,
                    threshold: 1.0,
                    left: 1,
                    right: 2,
                }],
            }],
        };
        assert!(!model.is_well_formed());
    }
}
