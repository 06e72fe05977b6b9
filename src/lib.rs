//! Kolosal Explain - black-box model explainability engine
//!
//! This crate explains an opaque trained classifier (an "oracle") using only
//! its label and probability queries plus a background dataset:
//! - Global surrogate decision trees with fidelity scores
//! - LIME-like local surrogates
//! - Monte-Carlo Shapley attributions
//! - Counterfactual search
//! - Subgroup accuracy-divergence scans
//!
//! # Modules
//!
//! ## Core
//! - [`data`] - Feature schema, feature vectors and datasets
//! - [`oracle`] - Oracle trait and the validating adapter
//! - [`error`] - Error types
//!
//! ## Explainers
//! - [`explainability`] - Surrogates, Shapley, counterfactuals and reports
//! - [`fairness`] - Subgroup divergence scanning
//!
//! ## Support
//! - [`training`] - Interpretable models used by the surrogates
//! - [`cache`] - Bounded LRU set
//! - [`utils`] - Dataset loading through polars

pub mod error;

pub mod data;
pub mod oracle;

pub mod explainability;
pub mod fairness;

pub mod cache;
pub mod training;
pub mod utils;

pub use error::{ExplainError, Result};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::data::{Dataset, FeatureKind, FeatureSpec, FeatureValue, FeatureVector, Schema};
    pub use crate::error::{ExplainError, Result};
    pub use crate::explainability::{
        estimate_shapley, explain_local, find_counterfactual, train_global_surrogate,
        AttributionMap, CancelFlag, CounterfactualConfig, CounterfactualResult, ExplainerConfig,
        ExplanationReport, ExplanationReporter, FeatureSteps, GlobalSurrogate, LocalConfig,
        LocalExplanation, MinSize, ShapleyConfig, SubgroupConfig, SurrogateConfig,
    };
    pub use crate::fairness::{scan_subgroup_divergence, SubgroupRecord, SubgroupReport};
    pub use crate::oracle::{FnOracle, Oracle, OracleAdapter};
    pub use crate::utils::DatasetLoader;
}
