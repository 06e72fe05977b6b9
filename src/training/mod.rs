//! Interpretable models fitted by the explainers
//!
//! - CART decision tree (global surrogate)
//! - Weighted ridge regression (local surrogate)

pub mod decision_tree;
pub mod linear_models;

pub use decision_tree::{Criterion, DecisionTree, TreeNode};
pub use linear_models::WeightedRidge;
