use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Growth limits for a single regression tree
#[derive(Debug, Clone, Copy)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// L2 penalty on leaf weights
    pub reg_lambda: f64,
    /// L1 penalty on leaf weights
    pub reg_alpha: f64,
    /// Minimum loss reduction a split must reach
    pub gamma: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    /// Rows with `x[feature] < threshold` go left
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

/// Regression tree fitted to residuals with squared loss. Node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<TreeNode>,
}

struct Split {
    feature: usize,
    threshold: f64,
    gain: f64,
}

impl RegressionTree {
    /// Fit on the given rows, considering only the given feature columns
    pub fn fit(
        features: &Array2<f64>,
        residuals: &[f64],
        rows: &[usize],
        columns: &[usize],
        params: &TreeParams,
    ) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(features, residuals, rows.to_vec(), columns, params, 0);
        tree
    }

    fn grow(
        &mut self,
        features: &Array2<f64>,
        residuals: &[f64],
        rows: Vec<usize>,
        columns: &[usize],
        params: &TreeParams,
        depth: usize,
    ) -> usize {
        let index = self.nodes.len();
        let sum: f64 = rows.iter().map(|&r| residuals[r]).sum();
        self.nodes.push(TreeNode::Leaf {
            value: leaf_weight(sum, rows.len(), params),
        });

        let min_leaf = params.min_samples_leaf.max(1);
        if depth >= params.max_depth || rows.len() < 2 * min_leaf {
            return index;
        }

        let Some(split) = best_split(features, residuals, &rows, columns, min_leaf, params) else {
            return index;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&r| features[[r, split.feature]] < split.threshold);

        let left = self.grow(features, residuals, left_rows, columns, params, depth + 1);
        let right = self.grow(features, residuals, right_rows, columns, params, depth + 1);
        self.nodes[index] = TreeNode::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        index
    }

    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if row[*feature] < *threshold { *left } else { *right };
                }
            }
        }
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| matches!(node, TreeNode::Leaf { .. }))
            .count()
    }

    /// Highest feature index any split reads
    pub fn max_feature(&self) -> Option<usize> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                TreeNode::Split { feature, .. } => Some(*feature),
                TreeNode::Leaf { .. } => None,
            })
            .max()
    }
}

/// Gradient sum shrunk toward zero by the L1 penalty
fn soft_threshold(sum: f64, reg_alpha: f64) -> f64 {
    if sum > reg_alpha {
        sum - reg_alpha
    } else if sum < -reg_alpha {
        sum + reg_alpha
    } else {
        0.0
    }
}

fn leaf_weight(sum: f64, count: usize, params: &TreeParams) -> f64 {
    soft_threshold(sum, params.reg_alpha) / (count as f64 + params.reg_lambda)
}

fn score(sum: f64, count: usize, params: &TreeParams) -> f64 {
    let shrunk = soft_threshold(sum, params.reg_alpha);
    shrunk * shrunk / (count as f64 + params.reg_lambda)
}

/// Exhaustive search over sorted feature values; the first best split wins
/// ties. Gain is half the score improvement and must exceed `gamma`.
fn best_split(
    features: &Array2<f64>,
    residuals: &[f64],
    rows: &[usize],
    columns: &[usize],
    min_leaf: usize,
    params: &TreeParams,
) -> Option<Split> {
    let n = rows.len();
    let total: f64 = rows.iter().map(|&r| residuals[r]).sum();
    let parent = score(total, n, params);
    let min_gain = params.gamma.max(1e-12);
    let mut best: Option<Split> = None;
    let mut order = rows.to_vec();

    for &feature in columns {
        order.sort_by(|&a, &b| features[[a, feature]].total_cmp(&features[[b, feature]]));

        let mut left_sum = 0.0;
        for k in 1..n {
            left_sum += residuals[order[k - 1]];
            if k < min_leaf || n - k < min_leaf {
                continue;
            }
            let lo = features[[order[k - 1], feature]];
            let hi = features[[order[k], feature]];
            if lo >= hi {
                continue;
            }

            let gain =
                0.5 * (score(left_sum, k, params) + score(total - left_sum, n - k, params) - parent);
            if gain > min_gain && best.as_ref().map_or(true, |b| gain > b.gain) {
                let mid = lo + (hi - lo) / 2.0;
                let threshold = if mid > lo { mid } else { hi };
                best = Some(Split {
                    feature,
                    threshold,
                    gain,
                });
            }
        }
    }

    best
}
