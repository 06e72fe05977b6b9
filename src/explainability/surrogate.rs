//! Global surrogate: a shallow decision tree that mimics the oracle
//!
//! The tree is fit to the oracle's own labels on the background set, never to
//! the true labels, so it describes what the model does rather than what the
//! world does. Fidelity is the agreement rate between tree and oracle on a
//! held-out slice of the background.

use crate::data::{Dataset, FeatureKind, FeatureVector, Schema};
use crate::error::{ExplainError, Result};
use crate::explainability::config::SurrogateConfig;
use crate::oracle::OracleAdapter;
use crate::training::decision_tree::{DecisionTree, TreeNode};
use ndarray::{Array2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Fidelity below which a surrogate is flagged as unreliable
pub const LOW_FIDELITY_THRESHOLD: f64 = 0.7;

/// One root-to-leaf path of the surrogate tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurrogateRule {
    /// Conditions joined by AND, in root-to-leaf order
    pub conditions: Vec<String>,
    /// Class predicted at the leaf
    pub class: usize,
    /// Training rows reaching the leaf
    pub n_samples: usize,
    /// Share of those rows carrying `class`
    pub purity: f64,
}

impl fmt::Display for SurrogateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conditions.is_empty() {
            write!(f, "ALWAYS")?;
        } else {
            write!(f, "IF {}", self.conditions.join(" AND "))?;
        }
        write!(
            f,
            " THEN class {} (purity {:.3}, n = {})",
            self.class, self.purity, self.n_samples
        )
    }
}

/// Interpretable tree approximating the oracle's global behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSurrogate {
    schema: Schema,
    tree: DecisionTree,
    /// Agreement with the oracle on the held-out slice.
    ///
    /// The same slice picks the truncation depth, so this is an optimistic estimate
    /// of agreement on unseen rows.
    pub fidelity: f64,
    /// Agreement with the oracle on the rows the tree was fit on
    pub train_fidelity: f64,
    /// Depth limit requested by the caller
    pub max_depth: usize,
    /// Depth of the retained tree, at most `max_depth`
    pub selected_depth: usize,
    pub n_train: usize,
    pub n_holdout: usize,
    pub seed: u64,
}

impl GlobalSurrogate {
    pub fn tree(&self) -> &DecisionTree {
        &self.tree
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Whether the fidelity is too low to trust the rules
    pub fn low_fidelity(&self) -> bool {
        self.fidelity < LOW_FIDELITY_THRESHOLD
    }

    /// Predict classes for an encoded batch
    pub fn predict(&self, x: &Array2<f64>) -> Result<Vec<usize>> {
        self.tree.predict(x)
    }

    /// Predict the class of a single instance
    pub fn predict_one(&self, instance: &FeatureVector) -> Result<usize> {
        let row = self.schema.encode(instance)?.insert_axis(Axis(0));
        self.tree
            .predict(&row)?
            .into_iter()
            .next()
            .ok_or(ExplainError::ModelNotFitted)
    }

    /// Impurity-decrease importances by feature name
    pub fn feature_importances(&self) -> Vec<(String, f64)> {
        match self.tree.feature_importances() {
            Some(imp) => self.schema.names().into_iter().zip(imp.iter().copied()).collect(),
            None => Vec::new(),
        }
    }

    /// Path-to-leaf rules, left branches first
    pub fn rules(&self) -> Vec<SurrogateRule> {
        let mut rules = Vec::new();
        if let Some(root) = self.tree.root() {
            let mut path = Vec::new();
            self.collect_rules(root, &mut path, &mut rules);
        }
        rules
    }

    fn collect_rules(&self, node: &TreeNode, path: &mut Vec<String>, out: &mut Vec<SurrogateRule>) {
        match node {
            TreeNode::Leaf {
                class,
                n_samples,
                purity,
            } => out.push(SurrogateRule {
                conditions: path.clone(),
                class: *class,
                n_samples: *n_samples,
                purity: *purity,
            }),
            TreeNode::Split {
                feature_idx,
                threshold,
                left,
                right,
                ..
            } => {
                let (left_cond, right_cond) = self.split_conditions(*feature_idx, *threshold);
                path.push(left_cond);
                self.collect_rules(left, path, out);
                path.pop();
                path.push(right_cond);
                self.collect_rules(right, path, out);
                path.pop();
            }
        }
    }

    /// Text for the left (`<=`) and right (`>`) side of a split
    fn split_conditions(&self, feature_idx: usize, threshold: f64) -> (String, String) {
        let spec = match self.schema.feature(feature_idx) {
            Some(spec) => spec,
            None => {
                return (
                    format!("x[{}] <= {:.4}", feature_idx, threshold),
                    format!("x[{}] > {:.4}", feature_idx, threshold),
                )
            }
        };
        match &spec.kind {
            FeatureKind::Numeric => (
                format!("{} <= {:.4}", spec.name, threshold),
                format!("{} > {:.4}", spec.name, threshold),
            ),
            FeatureKind::Categorical { categories } => {
                let (left, right): (Vec<(usize, &String)>, Vec<(usize, &String)>) = categories
                    .iter()
                    .enumerate()
                    .partition(|(idx, _)| (*idx as f64) <= threshold);
                let join = |side: Vec<(usize, &String)>| {
                    side.into_iter()
                        .map(|(_, c)| c.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                (
                    format!("{} in {{{}}}", spec.name, join(left)),
                    format!("{} in {{{}}}", spec.name, join(right)),
                )
            }
        }
    }

    /// Indented text dump of the tree
    pub fn export_text(&self) -> String {
        let mut out = String::new();
        if let Some(root) = self.tree.root() {
            self.write_node(root, 0, &mut out);
        }
        out
    }

    fn write_node(&self, node: &TreeNode, depth: usize, out: &mut String) {
        let indent = "|   ".repeat(depth);
        match node {
            TreeNode::Leaf {
                class,
                n_samples,
                purity,
            } => {
                out.push_str(&format!(
                    "{}|--- class: {} (purity {:.3}, n = {})\n",
                    indent, class, purity, n_samples
                ));
            }
            TreeNode::Split {
                feature_idx,
                threshold,
                left,
                right,
                ..
            } => {
                let (left_cond, right_cond) = self.split_conditions(*feature_idx, *threshold);
                out.push_str(&format!("{}|--- {}\n", indent, left_cond));
                self.write_node(left, depth + 1, out);
                out.push_str(&format!("{}|--- {}\n", indent, right_cond));
                self.write_node(right, depth + 1, out);
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn agreement(predicted: &[usize], reference: &[usize]) -> f64 {
    if reference.is_empty() {
        return 0.0;
    }
    let hits = predicted
        .iter()
        .zip(reference)
        .filter(|(p, r)| p == r)
        .count();
    hits as f64 / reference.len() as f64
}

/// Fits [`GlobalSurrogate`]s against an oracle
#[derive(Debug, Clone, Default)]
pub struct SurrogateTrainer {
    config: SurrogateConfig,
}

impl SurrogateTrainer {
    pub fn new(config: SurrogateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SurrogateConfig {
        &self.config
    }

    pub fn train(&self, oracle: &OracleAdapter<'_>, background: &Dataset) -> Result<GlobalSurrogate> {
        self.config.validate()?;
        let n = background.len();
        if n < 2 {
            return Err(ExplainError::InsufficientData(format!(
                "surrogate needs at least 2 background rows, got {}",
                n
            )));
        }

        // 1. Oracle labels on the whole background
        let x = background.to_matrix();
        let labels = oracle.labels(x)?;

        // 2. Seeded train / holdout split
        let n_holdout = ((n as f64 * self.config.holdout_fraction).round() as usize).clamp(1, n - 1);
        let mut indices: Vec<usize> = (0..n).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        indices.shuffle(&mut rng);
        let (holdout_idx, train_idx) = indices.split_at(n_holdout);

        let x_train = x.select(Axis(0), train_idx);
        let y_train: Vec<usize> = train_idx.iter().map(|&i| labels[i]).collect();
        let x_holdout = x.select(Axis(0), holdout_idx);
        let y_holdout: Vec<usize> = holdout_idx.iter().map(|&i| labels[i]).collect();

        // 3. Grow to the depth limit
        let mut full = DecisionTree::new()
            .with_max_depth(self.config.max_depth)
            .with_min_samples_split(self.config.min_samples_split)
            .with_min_samples_leaf(self.config.min_samples_leaf);
        full.fit(&x_train, &y_train)?;

        // 4. Keep the shallowest truncation with the best holdout agreement
        let mut best: Option<(DecisionTree, f64)> = None;
        let grown_depth = full.get_depth().max(1);
        for depth in 1..=grown_depth.min(self.config.max_depth) {
            let candidate = full.truncated(depth)?;
            let fidelity = agreement(&candidate.predict(&x_holdout)?, &y_holdout);
            debug!(depth, fidelity, "surrogate truncation evaluated");
            let better = match &best {
                Some((_, best_fidelity)) => fidelity > *best_fidelity,
                None => true,
            };
            if better {
                best = Some((candidate, fidelity));
            }
        }
        let (tree, fidelity) = best.ok_or(ExplainError::ModelNotFitted)?;
        let train_fidelity = agreement(&tree.predict(&x_train)?, &y_train);
        let selected_depth = tree.get_depth();

        info!(
            fidelity,
            train_fidelity,
            selected_depth,
            max_depth = self.config.max_depth,
            "global surrogate trained"
        );
        if fidelity < LOW_FIDELITY_THRESHOLD {
            warn!(fidelity, "global surrogate fidelity is low; rules may not reflect the oracle");
        }

        Ok(GlobalSurrogate {
            schema: background.schema().clone(),
            tree,
            fidelity,
            train_fidelity,
            max_depth: self.config.max_depth,
            selected_depth,
            n_train: train_idx.len(),
            n_holdout,
            seed: self.config.seed,
        })
    }
}
