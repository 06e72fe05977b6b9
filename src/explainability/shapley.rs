//! Monte-Carlo Shapley attribution
//!
//! Each sampled permutation reveals the instance's features one at a time on
//! top of a baseline row and credits every feature with the change in oracle
//! score its reveal caused. Within one permutation the credits telescope to
//! `f(instance) - f(baseline)`, so the averaged attributions keep that sum.

use crate::data::{Dataset, FeatureValue, FeatureVector};
use crate::error::{ExplainError, Result};
use crate::explainability::cancel::CancelFlag;
use crate::explainability::config::ShapleyConfig;
use crate::oracle::OracleAdapter;
use ndarray::{Array1, Array2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Permutations evaluated between cancellation checks
const PERMUTATION_CHUNK: usize = 32;

/// Estimated Shapley value of one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureAttribution {
    pub feature: String,
    /// Value of the feature on the explained instance
    pub value: FeatureValue,
    /// Mean marginal contribution
    pub attribution: f64,
    /// Standard error of the mean over permutations
    pub std_error: f64,
}

/// Per-feature Shapley estimates for one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionMap {
    /// Class whose score was attributed
    pub class: usize,
    /// Attributions in schema order
    pub attributions: Vec<FeatureAttribution>,
    /// Oracle score on the baseline row
    pub base_value: f64,
    /// Mean oracle score over the background
    pub expected_value: f64,
    /// Oracle score on the instance
    pub prediction: f64,
    /// Permutations actually evaluated
    pub n_permutations: usize,
    pub cancelled: bool,
    pub seed: u64,
}

impl AttributionMap {
    pub fn get(&self, feature: &str) -> Option<f64> {
        self.attributions
            .iter()
            .find(|a| a.feature == feature)
            .map(|a| a.attribution)
    }

    pub fn total(&self) -> f64 {
        self.attributions.iter().map(|a| a.attribution).sum()
    }

    /// Distance between the attribution sum and `prediction - base_value`
    pub fn additivity_gap(&self) -> f64 {
        (self.total() - (self.prediction - self.base_value)).abs()
    }

    /// Attributions by absolute value, largest first
    pub fn sorted(&self) -> Vec<&FeatureAttribution> {
        let mut sorted: Vec<&FeatureAttribution> = self.attributions.iter().collect();
        sorted.sort_by(|a, b| {
            b.attribution
                .abs()
                .partial_cmp(&a.attribution.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted
    }
}

/// Permutation-sampling Shapley estimator
#[derive(Debug, Clone, Default)]
pub struct ShapleyEstimator {
    config: ShapleyConfig,
    cancel: CancelFlag,
}

impl ShapleyEstimator {
    pub fn new(config: ShapleyConfig) -> Self {
        Self {
            config,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ShapleyConfig {
        &self.config
    }

    pub fn estimate(
        &self,
        oracle: &OracleAdapter<'_>,
        instance: &FeatureVector,
        background: &Dataset,
    ) -> Result<AttributionMap> {
        self.config.validate()?;
        let schema = background.schema();
        let x = background.encode_row(instance)?;
        let baseline = background.feature_means();
        let n_features = schema.len();

        let class = match self.config.class {
            Some(c) => {
                oracle.check_class("class", c)?;
                c
            }
            None => oracle.label_one(&x)?,
        };

        let anchors = ndarray::stack(Axis(0), &[x.view(), baseline.view()])?;
        let anchor_scores = oracle.class_score(&anchors, class)?;
        let (prediction, base_value) = (anchor_scores[0], anchor_scores[1]);
        let expected_value = oracle
            .class_score(background.to_matrix(), class)?
            .mean()
            .unwrap_or(base_value);

        // Orderings are drawn up front from one stream so evaluation order cannot change them
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.config.seed);
        let permutations: Vec<Vec<usize>> = (0..self.config.n_permutations)
            .map(|_| {
                let mut order: Vec<usize> = (0..n_features).collect();
                order.shuffle(&mut rng);
                order
            })
            .collect();

        let mut contributions: Vec<Vec<f64>> = Vec::with_capacity(permutations.len());
        let mut cancelled = false;
        for chunk in permutations.chunks(PERMUTATION_CHUNK) {
            if self.cancel.is_cancelled() {
                cancelled = true;
                warn!(
                    completed = contributions.len(),
                    requested = self.config.n_permutations,
                    "shapley estimation cancelled"
                );
                break;
            }
            let evaluated: Vec<Vec<f64>> = if self.config.parallel {
                chunk
                    .par_iter()
                    .map(|order| marginal_contributions(oracle, &x, &baseline, order, base_value, class))
                    .collect::<Result<Vec<_>>>()?
            } else {
                chunk
                    .iter()
                    .map(|order| marginal_contributions(oracle, &x, &baseline, order, base_value, class))
                    .collect::<Result<Vec<_>>>()?
            };
            contributions.extend(evaluated);
        }

        if contributions.is_empty() {
            return Err(ExplainError::InsufficientData(
                "shapley estimation cancelled before any permutation completed".to_string(),
            ));
        }

        // Sequential reduction in permutation order
        let m = contributions.len() as f64;
        let mut sums = vec![0.0; n_features];
        for row in &contributions {
            for (s, c) in sums.iter_mut().zip(row) {
                *s += c;
            }
        }
        let means: Vec<f64> = sums.iter().map(|s| s / m).collect();
        let mut sq = vec![0.0; n_features];
        for row in &contributions {
            for j in 0..n_features {
                sq[j] += (row[j] - means[j]).powi(2);
            }
        }
        let std_errors: Vec<f64> = sq
            .iter()
            .map(|s| {
                if contributions.len() > 1 {
                    (s / (m - 1.0)).sqrt() / m.sqrt()
                } else {
                    0.0
                }
            })
            .collect();

        let attributions = schema
            .features()
            .iter()
            .enumerate()
            .map(|(j, spec)| FeatureAttribution {
                feature: spec.name.clone(),
                value: spec.decode(x[j]),
                attribution: means[j],
                std_error: std_errors[j],
            })
            .collect();

        let result = AttributionMap {
            class,
            attributions,
            base_value,
            expected_value,
            prediction,
            n_permutations: contributions.len(),
            cancelled,
            seed: self.config.seed,
        };
        debug!(stats = ?oracle.stats(), "shapley oracle usage");
        info!(
            n_permutations = result.n_permutations,
            additivity_gap = result.additivity_gap(),
            "shapley attribution estimated"
        );
        Ok(result)
    }
}

/// Marginal contribution of every feature along one ordering.
///
/// The revealed rows are scored in a single oracle batch.
fn marginal_contributions(
    oracle: &OracleAdapter<'_>,
    x: &Array1<f64>,
    baseline: &Array1<f64>,
    order: &[usize],
    base_value: f64,
    class: usize,
) -> Result<Vec<f64>> {
    let n_features = x.len();
    let mut current = baseline.clone();
    let mut revealed = Array2::zeros((order.len(), n_features));
    for (step, &j) in order.iter().enumerate() {
        current[j] = x[j];
        revealed.row_mut(step).assign(&current);
    }
    let scores = oracle.class_score(&revealed, class)?;

    let mut contributions = vec![0.0; n_features];
    let mut previous = base_value;
    for (step, &j) in order.iter().enumerate() {
        contributions[j] = scores[step] - previous;
        previous = scores[step];
    }
    Ok(contributions)
}
