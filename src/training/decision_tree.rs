//! Decision tree classifier used as an interpretable surrogate

use crate::error::{ExplainError, Result};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Decision tree node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TreeNode {
    /// Leaf node with predicted class
    Leaf {
        class: usize,
        n_samples: usize,
        /// Share of samples in this leaf that carry `class`
        purity: f64,
    },
    /// Internal node with split `x[feature_idx] <= threshold` going left
    Split {
        feature_idx: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
        n_samples: usize,
        impurity: f64,
        /// Majority class of the samples reaching this node
        class: usize,
        purity: f64,
    },
}

impl TreeNode {
    pub fn n_samples(&self) -> usize {
        match self {
            TreeNode::Leaf { n_samples, .. } | TreeNode::Split { n_samples, .. } => *n_samples,
        }
    }

    /// Majority class at this node
    pub fn class(&self) -> usize {
        match self {
            TreeNode::Leaf { class, .. } | TreeNode::Split { class, .. } => *class,
        }
    }

    fn purity(&self) -> f64 {
        match self {
            TreeNode::Leaf { purity, .. } | TreeNode::Split { purity, .. } => *purity,
        }
    }

    /// Copy of this subtree cut at `depth` levels; cut nodes become leaves
    fn truncated(&self, depth: usize) -> TreeNode {
        match self {
            TreeNode::Leaf { .. } => self.clone(),
            TreeNode::Split { .. } if depth <= 1 => TreeNode::Leaf {
                class: self.class(),
                n_samples: self.n_samples(),
                purity: self.purity(),
            },
            TreeNode::Split {
                feature_idx,
                threshold,
                left,
                right,
                n_samples,
                impurity,
                class,
                purity,
            } => TreeNode::Split {
                feature_idx: *feature_idx,
                threshold: *threshold,
                left: Box::new(left.truncated(depth - 1)),
                right: Box::new(right.truncated(depth - 1)),
                n_samples: *n_samples,
                impurity: *impurity,
                class: *class,
                purity: *purity,
            },
        }
    }
}

/// Impurity criterion
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Criterion {
    /// Gini impurity
    Gini,
    /// Shannon entropy
    Entropy,
}

/// CART classification tree over encoded features
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    /// Tree root
    root: Option<TreeNode>,
    /// Maximum depth
    pub max_depth: Option<usize>,
    /// Minimum samples to split
    pub min_samples_split: usize,
    /// Minimum samples in leaf
    pub min_samples_leaf: usize,
    /// Impurity criterion
    pub criterion: Criterion,
    /// Number of features
    n_features: usize,
    /// Number of classes seen during fit
    n_classes: usize,
    /// Normalised impurity-decrease importances
    feature_importances: Option<Vec<f64>>,
}

impl Default for DecisionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionTree {
    pub fn new() -> Self {
        Self {
            root: None,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            criterion: Criterion::Gini,
            n_features: 0,
            n_classes: 0,
            feature_importances: None,
        }
    }

    /// Set maximum depth
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Set minimum samples to split
    pub fn with_min_samples_split(mut self, min_samples: usize) -> Self {
        self.min_samples_split = min_samples.max(2);
        self
    }

    /// Set minimum samples in leaf
    pub fn with_min_samples_leaf(mut self, min_samples: usize) -> Self {
        self.min_samples_leaf = min_samples.max(1);
        self
    }

    /// Set criterion
    pub fn with_criterion(mut self, criterion: Criterion) -> Self {
        self.criterion = criterion;
        self
    }

    /// Fit the tree to encoded rows and class labels
    pub fn fit(&mut self, x: &Array2<f64>, y: &[usize]) -> Result<&mut Self> {
        let n_samples = x.nrows();
        let n_features = x.ncols();

        if n_samples != y.len() {
            return Err(ExplainError::ShapeError {
                expected: format!("y length = {}", n_samples),
                actual: format!("y length = {}", y.len()),
            });
        }
        if n_samples == 0 {
            return Err(ExplainError::InsufficientData(
                "cannot fit a tree on zero samples".to_string(),
            ));
        }

        self.n_features = n_features;
        self.n_classes = y.iter().copied().max().map_or(0, |m| m + 1);

        let mut importances = vec![0.0; n_features];
        let indices: Vec<usize> = (0..n_samples).collect();
        self.root = Some(self.build_tree(x, y, &indices, 0, &mut importances));

        let total: f64 = importances.iter().sum();
        if total > 0.0 {
            for imp in &mut importances {
                *imp /= total;
            }
        }
        self.feature_importances = Some(importances);

        Ok(self)
    }

    fn class_counts(&self, y: &[usize], indices: &[usize]) -> Vec<usize> {
        let mut counts = vec![0usize; self.n_classes];
        for &i in indices {
            counts[y[i]] += 1;
        }
        counts
    }

    /// Majority class and its share; lowest class index wins ties
    fn majority(counts: &[usize]) -> (usize, f64) {
        let total: usize = counts.iter().sum();
        let mut best = 0;
        for (k, &c) in counts.iter().enumerate() {
            if c > counts[best] {
                best = k;
            }
        }
        let purity = if total > 0 {
            counts.get(best).copied().unwrap_or(0) as f64 / total as f64
        } else {
            0.0
        };
        (best, purity)
    }

    fn build_tree(
        &self,
        x: &Array2<f64>,
        y: &[usize],
        indices: &[usize],
        depth: usize,
        importances: &mut [f64],
    ) -> TreeNode {
        let n_samples = indices.len();
        let counts = self.class_counts(y, indices);
        let (class, purity) = Self::majority(&counts);

        let should_stop = n_samples < self.min_samples_split
            || n_samples <= self.min_samples_leaf
            || self.max_depth.map_or(false, |d| depth >= d)
            || purity >= 1.0;

        if should_stop {
            return TreeNode::Leaf {
                class,
                n_samples,
                purity,
            };
        }

        let parent_impurity = self.impurity(&counts);
        match self.find_best_split(x, y, indices, parent_impurity) {
            Some((best_feature, best_threshold, best_gain)) => {
                let (left_indices, right_indices): (Vec<usize>, Vec<usize>) = indices
                    .iter()
                    .partition(|&&i| x[[i, best_feature]] <= best_threshold);

                importances[best_feature] += n_samples as f64 * best_gain;

                let left = Box::new(self.build_tree(x, y, &left_indices, depth + 1, importances));
                let right = Box::new(self.build_tree(x, y, &right_indices, depth + 1, importances));

                TreeNode::Split {
                    feature_idx: best_feature,
                    threshold: best_threshold,
                    left,
                    right,
                    n_samples,
                    impurity: parent_impurity,
                    class,
                    purity,
                }
            }
            None => TreeNode::Leaf {
                class,
                n_samples,
                purity,
            },
        }
    }

    fn find_best_split(
        &self,
        x: &Array2<f64>,
        y: &[usize],
        indices: &[usize],
        parent_impurity: f64,
    ) -> Option<(usize, f64, f64)> {
        let n = indices.len() as f64;

        // Each feature independently finds its best split; collect keeps feature order
        let feature_results: Vec<Option<(usize, f64, f64)>> = (0..self.n_features)
            .into_par_iter()
            .map(|feature_idx| {
                let mut sorted: Vec<(f64, usize)> = indices
                    .iter()
                    .map(|&i| (x[[i, feature_idx]], y[i]))
                    .collect();
                sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

                let mut left_counts = vec![0usize; self.n_classes];
                let mut right_counts = vec![0usize; self.n_classes];
                for &(_, label) in &sorted {
                    right_counts[label] += 1;
                }

                let mut best_gain = 0.0f64;
                let mut best_threshold = None;

                // Sweep split positions left to right, moving one sample at a time
                for pos in 0..sorted.len().saturating_sub(1) {
                    let (value, label) = sorted[pos];
                    left_counts[label] += 1;
                    right_counts[label] -= 1;

                    let next_value = sorted[pos + 1].0;
                    if next_value <= value {
                        continue;
                    }
                    let left_count = pos + 1;
                    let right_count = sorted.len() - left_count;
                    if left_count < self.min_samples_leaf || right_count < self.min_samples_leaf {
                        continue;
                    }

                    let weighted = (left_count as f64 * self.impurity(&left_counts)
                        + right_count as f64 * self.impurity(&right_counts))
                        / n;
                    let gain = parent_impurity - weighted;
                    if gain > best_gain + 1e-12 {
                        best_gain = gain;
                        best_threshold = Some((value + next_value) / 2.0);
                    }
                }

                best_threshold.map(|t| (feature_idx, t, best_gain))
            })
            .collect();

        // Strictly better gain wins; earlier features win ties
        let mut best: Option<(usize, f64, f64)> = None;
        for candidate in feature_results.into_iter().flatten() {
            match best {
                Some((_, _, gain)) if candidate.2 <= gain + 1e-12 => {}
                _ => best = Some(candidate),
            }
        }
        best
    }

    fn impurity(&self, counts: &[usize]) -> f64 {
        let total: usize = counts.iter().sum();
        if total == 0 {
            return 0.0;
        }
        let n = total as f64;
        match self.criterion {
            Criterion::Gini => {
                1.0 - counts
                    .iter()
                    .map(|&c| (c as f64 / n).powi(2))
                    .sum::<f64>()
            }
            Criterion::Entropy => -counts
                .iter()
                .filter(|&&c| c > 0)
                .map(|&c| {
                    let p = c as f64 / n;
                    p * p.ln()
                })
                .sum::<f64>(),
        }
    }

    /// Predict a class for every row
    pub fn predict(&self, x: &Array2<f64>) -> Result<Vec<usize>> {
        let root = self.root.as_ref().ok_or(ExplainError::ModelNotFitted)?;
        if x.ncols() != self.n_features {
            return Err(ExplainError::ShapeError {
                expected: format!("{} features", self.n_features),
                actual: format!("{} features", x.ncols()),
            });
        }

        Ok(x.rows()
            .into_iter()
            .map(|row| Self::predict_sample(root, &row.to_vec()))
            .collect())
    }

    fn predict_sample(node: &TreeNode, sample: &[f64]) -> usize {
        match node {
            TreeNode::Leaf { class, .. } => *class,
            TreeNode::Split {
                feature_idx,
                threshold,
                left,
                right,
                ..
            } => {
                if sample[*feature_idx] <= *threshold {
                    Self::predict_sample(left, sample)
                } else {
                    Self::predict_sample(right, sample)
                }
            }
        }
    }

    /// Copy of this tree limited to `depth` levels of splits.
    ///
    /// Greedy growth does not depend on the depth limit, so the result is the
    /// tree that fitting with `max_depth = depth` would have produced.
    pub fn truncated(&self, depth: usize) -> Result<DecisionTree> {
        let root = self.root.as_ref().ok_or(ExplainError::ModelNotFitted)?;
        let mut tree = self.clone();
        tree.max_depth = Some(depth);
        // `truncated` counts node levels, a depth-d tree has d + 1 of them
        tree.root = Some(root.truncated(depth + 1));
        Ok(tree)
    }

    pub fn root(&self) -> Option<&TreeNode> {
        self.root.as_ref()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Get feature importances
    pub fn feature_importances(&self) -> Option<&[f64]> {
        self.feature_importances.as_deref()
    }

    /// Number of split levels on the longest root-to-leaf path
    pub fn get_depth(&self) -> usize {
        match &self.root {
            None => 0,
            Some(node) => Self::node_depth(node),
        }
    }

    fn node_depth(node: &TreeNode) -> usize {
        match node {
            TreeNode::Leaf { .. } => 0,
            TreeNode::Split { left, right, .. } => {
                1 + Self::node_depth(left).max(Self::node_depth(right))
            }
        }
    }

    /// Get number of leaves
    pub fn get_n_leaves(&self) -> usize {
        match &self.root {
            None => 0,
            Some(node) => Self::count_leaves(node),
        }
    }

    fn count_leaves(node: &TreeNode) -> usize {
        match node {
            TreeNode::Leaf { .. } => 1,
            TreeNode::Split { left, right, .. } => {
                Self::count_leaves(left) + Self::count_leaves(right)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_classifier_simple() {
        let x = array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
        let y = vec![0, 0, 1, 1];

        let mut tree = DecisionTree::new();
        tree.fit(&x, &y).unwrap();

        assert_eq!(tree.predict(&x).unwrap(), y);
        assert_eq!(tree.get_depth(), 1);
    }

    #[test]
    fn test_xor_needs_two_levels() {
        let x = array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
        let y = vec![0, 1, 1, 0];

        let mut stump = DecisionTree::new().with_max_depth(1);
        stump.fit(&x, &y).unwrap();
        let stump_correct = stump
            .predict(&x)
            .unwrap()
            .iter()
            .zip(&y)
            .filter(|(p, a)| p == a)
            .count();
        assert!(stump_correct < 4);
    }

    #[test]
    fn test_max_depth() {
        let x = array![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0], [4.0, 4.0], [5.0, 1.0]];
        let y = vec![0, 1, 0, 1, 0];

        let mut tree = DecisionTree::new().with_max_depth(2);
        tree.fit(&x, &y).unwrap();

        assert!(tree.get_depth() <= 2);
    }

    #[test]
    fn test_truncation_matches_depth_limited_fit() {
        let x = array![[1.0], [2.0], [3.0], [4.0], [5.0], [6.0], [7.0], [8.0]];
        let y = vec![0, 1, 0, 1, 1, 0, 1, 0];

        let mut deep = DecisionTree::new().with_max_depth(6);
        deep.fit(&x, &y).unwrap();
        let mut shallow = DecisionTree::new().with_max_depth(2);
        shallow.fit(&x, &y).unwrap();

        let cut = deep.truncated(2).unwrap();
        assert_eq!(cut.predict(&x).unwrap(), shallow.predict(&x).unwrap());
        assert_eq!(cut.get_n_leaves(), shallow.get_n_leaves());
    }

    #[test]
    fn test_feature_importances() {
        let x = array![[1.0, 0.0], [2.0, 0.0], [3.0, 0.0], [4.0, 0.0]];
        let y = vec![0, 0, 1, 1];

        let mut tree = DecisionTree::new();
        tree.fit(&x, &y).unwrap();

        let importances = tree.feature_importances().unwrap();
        assert!(importances[0] > importances[1]);
    }

    #[test]
    fn test_predict_before_fit() {
        let tree = DecisionTree::new();
        assert!(matches!(
            tree.predict(&array![[1.0]]),
            Err(ExplainError::ModelNotFitted)
        ));
    }

    #[test]
    fn test_entropy_criterion() {
        let x = array![[1.0], [2.0], [3.0], [4.0]];
        let y = vec![0, 0, 1, 1];
        let mut tree = DecisionTree::new().with_criterion(Criterion::Entropy);
        tree.fit(&x, &y).unwrap();
        assert_eq!(tree.predict(&array![[1.5], [3.5]]).unwrap(), vec![0, 1]);
    }
}
