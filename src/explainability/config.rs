//! Explainer configuration
//!
//! Every knob is validated eagerly at the start of each operation so that a
//! bad value is reported before any oracle query is made.

use crate::error::{ExplainError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Maximum accepted surrogate depth
pub const MAX_SURROGATE_DEPTH: usize = 32;

/// Oracle adapter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Maximum rows per oracle call
    pub batch_size: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self { batch_size: 1024 }
    }
}

impl OracleConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ExplainError::invalid_parameter(
                "batch_size",
                self.batch_size,
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Global surrogate settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurrogateConfig {
    /// Maximum depth of the surrogate tree
    pub max_depth: usize,
    /// Share of the background held out for the fidelity score
    pub holdout_fraction: f64,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Seed for the holdout shuffle
    pub seed: u64,
}

impl Default for SurrogateConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            holdout_fraction: 0.25,
            min_samples_split: 2,
            min_samples_leaf: 1,
            seed: 42,
        }
    }
}

impl SurrogateConfig {
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_holdout_fraction(mut self, fraction: f64) -> Self {
        self.holdout_fraction = fraction;
        self
    }

    pub fn with_min_samples_leaf(mut self, min_samples: usize) -> Self {
        self.min_samples_leaf = min_samples;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 || self.max_depth > MAX_SURROGATE_DEPTH {
            return Err(ExplainError::invalid_parameter(
                "max_depth",
                self.max_depth,
                format!("must be between 1 and {}", MAX_SURROGATE_DEPTH),
            ));
        }
        if !(self.holdout_fraction > 0.0 && self.holdout_fraction < 1.0) {
            return Err(ExplainError::invalid_parameter(
                "holdout_fraction",
                self.holdout_fraction,
                "must lie strictly between 0 and 1",
            ));
        }
        if self.min_samples_split < 2 {
            return Err(ExplainError::invalid_parameter(
                "min_samples_split",
                self.min_samples_split,
                "must be at least 2",
            ));
        }
        if self.min_samples_leaf == 0 {
            return Err(ExplainError::invalid_parameter(
                "min_samples_leaf",
                self.min_samples_leaf,
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Local (LIME-style) surrogate settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Number of perturbed samples
    pub n_samples: usize,
    /// Proximity kernel width; `None` means √(n_features) · 0.75
    pub kernel_width: Option<f64>,
    /// L2 penalty of the local ridge fit
    pub alpha: f64,
    /// Class whose probability is explained; `None` explains the predicted class
    pub class: Option<usize>,
    pub seed: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            n_samples: 400,
            kernel_width: None,
            alpha: 1.0,
            class: None,
            seed: 42,
        }
    }
}

impl LocalConfig {
    pub fn with_n_samples(mut self, n: usize) -> Self {
        self.n_samples = n;
        self
    }

    pub fn with_kernel_width(mut self, width: f64) -> Self {
        self.kernel_width = Some(width);
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_class(mut self, class: usize) -> Self {
        self.class = Some(class);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Kernel width to use for `n_features` features
    pub fn resolved_kernel_width(&self, n_features: usize) -> f64 {
        self.kernel_width
            .unwrap_or_else(|| (n_features as f64).sqrt() * 0.75)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_samples < 2 {
            return Err(ExplainError::invalid_parameter(
                "n_samples",
                self.n_samples,
                "must be at least 2",
            ));
        }
        if let Some(width) = self.kernel_width {
            // An infinite width is allowed: it degenerates to uniform weighting
            if !(width > 0.0) {
                return Err(ExplainError::invalid_parameter(
                    "kernel_width",
                    width,
                    "must be positive",
                ));
            }
        }
        if !(self.alpha >= 0.0 && self.alpha.is_finite()) {
            return Err(ExplainError::invalid_parameter(
                "alpha",
                self.alpha,
                "must be a finite non-negative number",
            ));
        }
        Ok(())
    }
}

/// Shapley estimator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapleyConfig {
    /// Number of random feature orderings
    pub n_permutations: usize,
    /// Class whose probability is attributed; `None` attributes the predicted class
    pub class: Option<usize>,
    /// Evaluate permutations on the rayon pool
    pub parallel: bool,
    pub seed: u64,
}

impl Default for ShapleyConfig {
    fn default() -> Self {
        Self {
            n_permutations: 250,
            class: None,
            parallel: true,
            seed: 42,
        }
    }
}

impl ShapleyConfig {
    pub fn with_n_permutations(mut self, n: usize) -> Self {
        self.n_permutations = n;
        self
    }

    pub fn with_class(mut self, class: usize) -> Self {
        self.class = Some(class);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_permutations == 0 {
            return Err(ExplainError::invalid_parameter(
                "n_permutations",
                self.n_permutations,
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Counterfactual search settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterfactualConfig {
    /// Maximum number of state expansions
    pub max_iters: usize,
    /// Maximum number of changed features in a candidate; `None` is unbounded
    pub max_changes: Option<usize>,
    /// Capacity of the visited-state set
    pub visited_capacity: usize,
}

impl Default for CounterfactualConfig {
    fn default() -> Self {
        Self {
            max_iters: 1000,
            max_changes: None,
            visited_capacity: 100_000,
        }
    }
}

impl CounterfactualConfig {
    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    pub fn with_max_changes(mut self, max_changes: usize) -> Self {
        self.max_changes = Some(max_changes);
        self
    }

    pub fn with_visited_capacity(mut self, capacity: usize) -> Self {
        self.visited_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iters == 0 {
            return Err(ExplainError::invalid_parameter(
                "max_iters",
                self.max_iters,
                "must be at least 1",
            ));
        }
        if self.max_changes == Some(0) {
            return Err(ExplainError::invalid_parameter(
                "max_changes",
                0,
                "must be at least 1 when set",
            ));
        }
        if self.visited_capacity == 0 {
            return Err(ExplainError::invalid_parameter(
                "visited_capacity",
                self.visited_capacity,
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Minimum subgroup size, absolute or relative to the scanned population
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MinSize {
    Absolute(usize),
    Fraction(f64),
}

impl MinSize {
    /// Minimum row count for a population of `n` rows
    pub fn resolve(&self, n: usize) -> usize {
        match *self {
            MinSize::Absolute(k) => k,
            MinSize::Fraction(f) => ((n as f64) * f).ceil() as usize,
        }
        .max(1)
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            MinSize::Absolute(0) => Err(ExplainError::invalid_parameter(
                "min_size",
                0,
                "must be at least 1",
            )),
            MinSize::Fraction(f) if !(f > 0.0 && f <= 1.0) => Err(
                ExplainError::invalid_parameter("min_size", f, "fraction must lie in (0, 1]"),
            ),
            _ => Ok(()),
        }
    }
}

/// Subgroup divergence scan settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubgroupConfig {
    pub min_size: MinSize,
    /// Percentiles (0–100) used as numeric split points
    pub percentiles: Vec<f64>,
    /// Keep only the K most divergent subgroups; `None` keeps all
    pub top_k: Option<usize>,
    /// Scan features on the rayon pool
    pub parallel: bool,
}

impl Default for SubgroupConfig {
    fn default() -> Self {
        Self {
            min_size: MinSize::Fraction(0.05),
            percentiles: vec![10.0, 25.0, 50.0, 75.0, 90.0],
            top_k: None,
            parallel: true,
        }
    }
}

impl SubgroupConfig {
    pub fn with_min_size(mut self, min_size: MinSize) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn with_percentiles(mut self, percentiles: Vec<f64>) -> Self {
        self.percentiles = percentiles;
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.min_size.validate()?;
        if self.percentiles.is_empty() {
            return Err(ExplainError::invalid_parameter(
                "percentiles",
                "[]",
                "at least one percentile is required",
            ));
        }
        if let Some(p) = self
            .percentiles
            .iter()
            .find(|p| !(**p >= 0.0 && **p <= 100.0))
        {
            return Err(ExplainError::invalid_parameter(
                "percentiles",
                p,
                "must lie in [0, 100]",
            ));
        }
        if self.top_k == Some(0) {
            return Err(ExplainError::invalid_parameter(
                "top_k",
                0,
                "must be at least 1 when set",
            ));
        }
        Ok(())
    }
}

/// Configuration for the whole explainer suite
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainerConfig {
    pub oracle: OracleConfig,
    pub surrogate: SurrogateConfig,
    pub local: LocalConfig,
    pub shapley: ShapleyConfig,
    pub counterfactual: CounterfactualConfig,
    pub subgroup: SubgroupConfig,
}

impl ExplainerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ExplainError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.oracle.validate()?;
        self.surrogate.validate()?;
        self.local.validate()?;
        self.shapley.validate()?;
        self.counterfactual.validate()?;
        self.subgroup.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ExplainerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.surrogate.max_depth, 5);
        assert_eq!(config.local.n_samples, 400);
        assert_eq!(config.shapley.n_permutations, 250);
        assert_eq!(config.subgroup.percentiles, vec![10.0, 25.0, 50.0, 75.0, 90.0]);
    }

    #[test]
    fn test_default_kernel_width() {
        let config = LocalConfig::default();
        assert!((config.resolved_kernel_width(4) - 1.5).abs() < 1e-12);
        let config = config.with_kernel_width(3.0);
        assert_eq!(config.resolved_kernel_width(4), 3.0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(SurrogateConfig::default().with_max_depth(0).validate().is_err());
        assert!(SurrogateConfig::default().with_max_depth(64).validate().is_err());
        assert!(LocalConfig::default().with_n_samples(1).validate().is_err());
        assert!(LocalConfig::default().with_kernel_width(0.0).validate().is_err());
        assert!(LocalConfig::default().with_kernel_width(f64::INFINITY).validate().is_ok());
        assert!(ShapleyConfig::default().with_n_permutations(0).validate().is_err());
        assert!(CounterfactualConfig::default().with_max_iters(0).validate().is_err());
        assert!(SubgroupConfig::default()
            .with_percentiles(vec![50.0, 101.0])
            .validate()
            .is_err());
        assert!(MinSize::Fraction(1.5).validate().is_err());
        assert!(MinSize::Absolute(0).validate().is_err());
    }

    #[test]
    fn test_min_size_resolution() {
        assert_eq!(MinSize::Absolute(7).resolve(100), 7);
        assert_eq!(MinSize::Fraction(0.05).resolve(100), 5);
        assert_eq!(MinSize::Fraction(0.05).resolve(10), 1);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ExplainerConfig::from_json_str(
            r#"{ "local": { "n_samples": 120 }, "surrogate": { "max_depth": 3 } }"#,
        )
        .unwrap();
        assert_eq!(config.local.n_samples, 120);
        assert_eq!(config.local.alpha, 1.0);
        assert_eq!(config.surrogate.max_depth, 3);
        assert_eq!(config.shapley.n_permutations, 250);
    }

    #[test]
    fn test_invalid_json_config_rejected() {
        let result = ExplainerConfig::from_json_str(r#"{ "surrogate": { "max_depth": 0 } }"#);
        assert!(matches!(result, Err(ExplainError::InvalidParameter { .. })));

        let result = ExplainerConfig::from_json_str("{ not json");
        assert!(matches!(result, Err(ExplainError::ConfigError(_))));
    }

    #[test]
    fn test_json_round_trip() {
        let config = ExplainerConfig::default();
        let json = config.to_json().unwrap();
        assert_eq!(ExplainerConfig::from_json_str(&json).unwrap(), config);
    }
}
