//! Black-box explainability
//!
//! Explains an opaque [`Oracle`] using only its label and probability
//! queries:
//! - Global surrogate decision tree with holdout fidelity
//! - LIME-like local surrogate (kernel-weighted ridge regression)
//! - Monte-Carlo Shapley attributions
//! - Breadth-first counterfactual search
//!
//! Each component is a small struct configured from [`ExplainerConfig`]; the
//! free functions below run one component with its default batching.

pub mod cancel;
pub mod config;
pub mod counterfactual;
pub mod local_surrogate;
pub mod report;
pub mod shapley;
pub mod surrogate;

pub use cancel::CancelFlag;
pub use config::{
    CounterfactualConfig, ExplainerConfig, LocalConfig, MinSize, OracleConfig, ShapleyConfig,
    SubgroupConfig, SurrogateConfig,
};
pub use counterfactual::{
    CounterfactualResult, CounterfactualSearch, FeatureChange, FeatureStepSet, FeatureSteps,
    PerturbationStep,
};
pub use local_surrogate::{FeatureCoefficient, LocalExplanation, LocalSurrogateExplainer};
pub use report::{ExplanationReport, ExplanationReporter};
pub use shapley::{AttributionMap, FeatureAttribution, ShapleyEstimator};
pub use surrogate::{GlobalSurrogate, SurrogateRule, SurrogateTrainer, LOW_FIDELITY_THRESHOLD};

use crate::data::{Dataset, FeatureVector, Schema};
use crate::error::Result;
use crate::oracle::{Oracle, OracleAdapter};

/// Fit a decision tree to the oracle's labels on `background`
pub fn train_global_surrogate(
    oracle: &dyn Oracle,
    background: &Dataset,
    config: &SurrogateConfig,
) -> Result<GlobalSurrogate> {
    let adapter = OracleAdapter::new(oracle);
    SurrogateTrainer::new(config.clone()).train(&adapter, background)
}

/// Local linear attribution around `instance`
pub fn explain_local(
    oracle: &dyn Oracle,
    instance: &FeatureVector,
    background: &Dataset,
    config: &LocalConfig,
) -> Result<LocalExplanation> {
    let adapter = OracleAdapter::new(oracle);
    LocalSurrogateExplainer::new(config.clone()).explain(&adapter, instance, background)
}

/// Monte-Carlo Shapley values for `instance`
pub fn estimate_shapley(
    oracle: &dyn Oracle,
    instance: &FeatureVector,
    background: &Dataset,
    config: &ShapleyConfig,
) -> Result<AttributionMap> {
    let adapter = OracleAdapter::new(oracle);
    ShapleyEstimator::new(config.clone()).estimate(&adapter, instance, background)
}

/// Smallest-step change to `instance` that moves the oracle to `target_class`.
///
/// Without a target, binary oracles flip the current label.
pub fn find_counterfactual(
    oracle: &dyn Oracle,
    schema: &Schema,
    instance: &FeatureVector,
    steps: &FeatureSteps,
    target_class: Option<usize>,
    config: &CounterfactualConfig,
) -> Result<CounterfactualResult> {
    let adapter = OracleAdapter::new(oracle);
    CounterfactualSearch::new(config.clone()).search(&adapter, schema, instance, steps, target_class)
}
