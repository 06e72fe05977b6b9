//! Local surrogate explanations (LIME-like)
//!
//! A synthetic neighbourhood is built by mixing background rows with the
//! instance under a Bernoulli(0.5) mask. The oracle scores every neighbour,
//! neighbours are weighted by an exponential proximity kernel, and a weighted
//! ridge regression on the centred features yields the local attributions.

use crate::data::{Dataset, FeatureKind, FeatureValue, FeatureVector};
use crate::error::{ExplainError, Result};
use crate::explainability::cancel::CancelFlag;
use crate::explainability::config::LocalConfig;
use crate::oracle::OracleAdapter;
use crate::training::linear_models::WeightedRidge;
use ndarray::{s, Array1, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Local weight of one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCoefficient {
    pub feature: String,
    /// Value of the feature on the explained instance
    pub value: FeatureValue,
    /// Signed slope of the local linear model
    pub coefficient: f64,
    /// Coefficient times the instance's centred value
    pub contribution: f64,
}

/// Result of a local surrogate fit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalExplanation {
    /// Class whose score was explained
    pub class: usize,
    /// Per-feature coefficients in schema order
    pub coefficients: Vec<FeatureCoefficient>,
    pub intercept: f64,
    /// Raw proximity weights of the neighbourhood samples
    pub sample_weights: Vec<f64>,
    /// Kernel width in background standard deviations: numeric distances are divided by
    /// each feature's background std, categorical mismatches count 1
    pub kernel_width: f64,
    /// Weighted R² of the local model on its neighbourhood
    pub score: f64,
    /// Local model output at the instance
    pub local_prediction: f64,
    /// Oracle score of `class` at the instance
    pub oracle_prediction: f64,
    /// Neighbourhood samples actually scored
    pub n_samples: usize,
    /// Set when the kernel weights were degenerate and uniform weights were used
    pub used_uniform_weights: bool,
    /// Set when the query was cancelled before the full neighbourhood was scored
    pub cancelled: bool,
    pub seed: u64,
}

impl LocalExplanation {
    pub fn coefficient(&self, feature: &str) -> Option<f64> {
        self.coefficients
            .iter()
            .find(|c| c.feature == feature)
            .map(|c| c.coefficient)
    }

    /// Coefficients by absolute value, largest first
    pub fn sorted_coefficients(&self) -> Vec<&FeatureCoefficient> {
        let mut sorted: Vec<&FeatureCoefficient> = self.coefficients.iter().collect();
        sorted.sort_by(|a, b| {
            b.coefficient
                .abs()
                .partial_cmp(&a.coefficient.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted
    }

    pub fn top_k(&self, k: usize) -> Vec<&FeatureCoefficient> {
        self.sorted_coefficients().into_iter().take(k).collect()
    }
}

/// LIME-style explainer
#[derive(Debug, Clone, Default)]
pub struct LocalSurrogateExplainer {
    config: LocalConfig,
    cancel: CancelFlag,
}

impl LocalSurrogateExplainer {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            config,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    pub fn explain(
        &self,
        oracle: &OracleAdapter<'_>,
        instance: &FeatureVector,
        background: &Dataset,
    ) -> Result<LocalExplanation> {
        self.config.validate()?;
        let schema = background.schema();
        let x = background.encode_row(instance)?;
        let bg = background.to_matrix();
        let n_features = schema.len();
        let n_bg = background.len();
        let n_samples = self.config.n_samples;
        let kernel_width = self.config.resolved_kernel_width(n_features);

        let class = match self.config.class {
            Some(c) => {
                oracle.check_class("class", c)?;
                c
            }
            None => oracle.label_one(&x)?,
        };

        // 1-2. Background seeds mixed with the instance under a Bernoulli(0.5) mask
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.config.seed);
        let mut neighbourhood = Array2::zeros((n_samples, n_features));
        for mut row in neighbourhood.rows_mut() {
            let seed_row = bg.row(rng.gen_range(0..n_bg));
            for j in 0..n_features {
                row[j] = if rng.gen_bool(0.5) { x[j] } else { seed_row[j] };
            }
        }

        // 3. Score the neighbourhood, one oracle batch at a time
        let mut scored = 0;
        let mut scores = Vec::with_capacity(n_samples);
        let mut cancelled = false;
        while scored < n_samples {
            if self.cancel.is_cancelled() {
                cancelled = true;
                warn!(scored, n_samples, "local explanation cancelled");
                break;
            }
            let end = (scored + oracle.batch_size()).min(n_samples);
            let batch = neighbourhood.slice(s![scored..end, ..]).to_owned();
            scores.extend(oracle.class_score(&batch, class)?.iter().copied());
            scored = end;
        }
        if scored < 2 {
            return Err(ExplainError::InsufficientData(format!(
                "local surrogate needs at least 2 scored samples, got {}",
                scored
            )));
        }
        let neighbourhood = neighbourhood.slice(s![..scored, ..]).to_owned();
        let y = Array1::from_vec(scores);

        // 4. Proximity kernel
        let scales = background.feature_stds();
        let sample_weights: Array1<f64> = neighbourhood
            .rows()
            .into_iter()
            .map(|z| {
                let d2: f64 = schema
                    .features()
                    .iter()
                    .enumerate()
                    .map(|(j, spec)| match spec.kind {
                        FeatureKind::Numeric => {
                            let scale = if scales[j] > f64::EPSILON { scales[j] } else { 1.0 };
                            ((z[j] - x[j]) / scale).powi(2)
                        }
                        FeatureKind::Categorical { .. } => {
                            if z[j] == x[j] {
                                0.0
                            } else {
                                1.0
                            }
                        }
                    })
                    .sum();
                (-d2 / (2.0 * kernel_width * kernel_width)).exp()
            })
            .collect();

        // 5. Weighted ridge on centred features
        let centres = self.centres(background, &x);
        let design = self.design_matrix(background, &neighbourhood, &x, &centres);
        let instance_row = self
            .design_matrix(background, &x.clone().insert_axis(Axis(0)), &x, &centres);

        let mut ridge = WeightedRidge::new(self.config.alpha);
        ridge.fit(&design, &y, &sample_weights)?;
        let score = ridge.score(&design, &y, &sample_weights)?;
        let local_prediction = ridge.predict(&instance_row)?[0];
        let oracle_prediction = oracle.class_score(&x.clone().insert_axis(Axis(0)), class)?[0];

        // 6. Attributions
        let coef = ridge.coefficients.clone().ok_or(ExplainError::ModelNotFitted)?;
        let intercept = ridge.intercept.ok_or(ExplainError::ModelNotFitted)?;
        let coefficients = schema
            .features()
            .iter()
            .enumerate()
            .map(|(j, spec)| FeatureCoefficient {
                feature: spec.name.clone(),
                value: spec.decode(x[j]),
                coefficient: coef[j],
                contribution: coef[j] * instance_row[[0, j]],
            })
            .collect();

        debug!(n_samples = scored, kernel_width, class, "local neighbourhood scored");
        info!(score, local_prediction, oracle_prediction, "local explanation fitted");

        Ok(LocalExplanation {
            class,
            coefficients,
            intercept,
            sample_weights: sample_weights.to_vec(),
            kernel_width,
            score,
            local_prediction,
            oracle_prediction,
            n_samples: scored,
            used_uniform_weights: ridge.used_uniform_weights,
            cancelled,
            seed: self.config.seed,
        })
    }

    /// Column centres: background mean for numeric features, background share
    /// of the instance's category for categorical ones
    fn centres(&self, background: &Dataset, x: &Array1<f64>) -> Vec<f64> {
        let means = background.feature_means();
        let bg = background.to_matrix();
        let n = background.len() as f64;
        background
            .schema()
            .features()
            .iter()
            .enumerate()
            .map(|(j, spec)| match spec.kind {
                FeatureKind::Numeric => means[j],
                FeatureKind::Categorical { .. } => {
                    bg.column(j).iter().filter(|&&v| v == x[j]).count() as f64 / n
                }
            })
            .collect()
    }

    /// Centred regression inputs; categorical columns become "matches the instance" indicators
    fn design_matrix(
        &self,
        background: &Dataset,
        rows: &Array2<f64>,
        x: &Array1<f64>,
        centres: &[f64],
    ) -> Array2<f64> {
        let mut design = rows.clone();
        for (j, spec) in background.schema().features().iter().enumerate() {
            let centre = centres[j];
            let is_categorical = spec.is_categorical();
            let target = x[j];
            design.column_mut(j).mapv_inplace(|v| {
                if is_categorical {
                    (if v == target { 1.0 } else { 0.0 }) - centre
                } else {
                    v - centre
                }
            });
        }
        design
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FeatureSpec, Schema};
    use crate::oracle::FnOracle;

    fn logistic_oracle() -> FnOracle {
        FnOracle::binary(|row: &[f64]| 1.0 / (1.0 + (-(2.0 * row[0] - 0.5 * row[1])).exp()))
    }

    fn background() -> Dataset {
        let schema = Schema::numeric(["a", "b"]).unwrap();
        let rows = (0..60)
            .map(|i| {
                FeatureVector::new()
                    .with("a", (i % 10) as f64 / 5.0 - 1.0)
                    .with("b", (i % 7) as f64 / 3.0 - 1.0)
            })
            .collect();
        Dataset::new(schema, rows, None).unwrap()
    }

    #[test]
    fn test_signs_follow_oracle() {
        let oracle = logistic_oracle();
        let adapter = OracleAdapter::new(&oracle);
        let instance = FeatureVector::new().with("a", 0.2).with("b", 0.1);
        let explanation = LocalSurrogateExplainer::new(LocalConfig::default().with_alpha(0.1))
            .explain(&adapter, &instance, &background())
            .unwrap();

        assert_eq!(explanation.class, 1);
        assert!(explanation.coefficient("a").unwrap() > 0.0);
        assert!(explanation.coefficient("b").unwrap() < 0.0);
        assert_eq!(explanation.top_k(1)[0].feature, "a");
        assert_eq!(explanation.sample_weights.len(), 400);
        assert!(!explanation.cancelled);
    }

    #[test]
    fn test_same_seed_is_bit_identical() {
        let oracle = logistic_oracle();
        let adapter = OracleAdapter::new(&oracle);
        let instance = FeatureVector::new().with("a", 0.4).with("b", -0.3);
        let explainer = LocalSurrogateExplainer::new(LocalConfig::default().with_seed(7));
        let first = explainer.explain(&adapter, &instance, &background()).unwrap();
        let second = explainer.explain(&adapter, &instance, &background()).unwrap();
        let bits = |e: &LocalExplanation| {
            e.coefficients
                .iter()
                .map(|c| c.coefficient.to_bits())
                .collect::<Vec<_>>()
        };
        assert_eq!(bits(&first), bits(&second));
        assert_eq!(first.intercept.to_bits(), second.intercept.to_bits());
    }

    #[test]
    fn test_infinite_width_gives_uniform_weights() {
        let oracle = logistic_oracle();
        let adapter = OracleAdapter::new(&oracle);
        let instance = FeatureVector::new().with("a", 0.0).with("b", 0.0);
        let explanation = LocalSurrogateExplainer::new(
            LocalConfig::default().with_kernel_width(f64::INFINITY),
        )
        .explain(&adapter, &instance, &background())
        .unwrap();
        assert!(explanation.sample_weights.iter().all(|&w| w == 1.0));
        assert!(explanation.coefficients.iter().all(|c| c.coefficient.is_finite()));
    }

    #[test]
    fn test_categorical_indicator() {
        let schema = Schema::new(vec![
            FeatureSpec::numeric("x"),
            FeatureSpec::categorical("colour", ["red", "green"]),
        ])
        .unwrap();
        let rows = (0..40)
            .map(|i| {
                FeatureVector::new()
                    .with("x", (i % 5) as f64)
                    .with("colour", if i % 2 == 0 { "red" } else { "green" })
            })
            .collect();
        let background = Dataset::new(schema, rows, None).unwrap();
        // Positive only for green rows
        let oracle = FnOracle::binary(|row: &[f64]| if row[1] == 1.0 { 0.9 } else { 0.1 });
        let adapter = OracleAdapter::new(&oracle);
        let instance = FeatureVector::new().with("x", 2.0).with("colour", "green");
        let explanation = LocalSurrogateExplainer::new(LocalConfig::default().with_class(1))
            .explain(&adapter, &instance, &background)
            .unwrap();
        assert!(explanation.coefficient("colour").unwrap() > 0.5);
        assert!(explanation.coefficient("x").unwrap().abs() < 0.1);
    }

    #[test]
    fn test_cancelled_before_start() {
        let oracle = logistic_oracle();
        let adapter = OracleAdapter::new(&oracle);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let instance = FeatureVector::new().with("a", 0.0).with("b", 0.0);
        let result = LocalSurrogateExplainer::new(LocalConfig::default().with_class(1))
            .with_cancel_flag(cancel)
            .explain(&adapter, &instance, &background());
        assert!(matches!(result, Err(ExplainError::InsufficientData(_))));
    }

    #[test]
    fn test_invalid_sample_count() {
        let oracle = logistic_oracle();
        let adapter = OracleAdapter::new(&oracle);
        let instance = FeatureVector::new().with("a", 0.0).with("b", 0.0);
        let result = LocalSurrogateExplainer::new(LocalConfig::default().with_n_samples(0))
            .explain(&adapter, &instance, &background());
        assert!(matches!(result, Err(ExplainError::InvalidParameter { .. })));
    }

    #[test]
    fn test_class_outside_oracle_rejected() {
        let label_only = FnOracle::new(|x: &ndarray::Array2<f64>| {
            Ok(x.rows().into_iter().map(|r| usize::from(r[0] > 0.0)).collect())
        });
        let instance = FeatureVector::new().with("a", 0.2).with("b", 0.1);
        let explainer = LocalSurrogateExplainer::new(LocalConfig::default().with_class(7));

        let adapter = OracleAdapter::new(&label_only);
        let result = explainer.explain(&adapter, &instance, &background());
        assert!(matches!(result, Err(ExplainError::InvalidParameter { .. })));

        let declared = FnOracle::new(|x: &ndarray::Array2<f64>| Ok(vec![0; x.nrows()])).with_n_classes(2);
        let adapter = OracleAdapter::new(&declared);
        let result = explainer.explain(&adapter, &instance, &background());
        assert!(matches!(result, Err(ExplainError::InvalidParameter { .. })));
        assert_eq!(adapter.stats().invocations, 0);
    }

    #[test]
    fn test_kernel_distance_is_std_scaled() {
        let oracle = logistic_oracle();
        let adapter = OracleAdapter::new(&oracle);
        let instance = FeatureVector::new().with("a", 0.2).with("b", 0.1);
        let config = LocalConfig::default().with_kernel_width(0.75).with_seed(5);
        let base = LocalSurrogateExplainer::new(config.clone())
            .explain(&adapter, &instance, &background())
            .unwrap();

        // Same data with `a` in hundredths: weights must not move
        let schema = Schema::numeric(["a", "b"]).unwrap();
        let rows = background()
            .rows()
            .iter()
            .map(|r| {
                FeatureVector::new()
                    .with("a", r.get("a").and_then(FeatureValue::as_f64).unwrap() * 100.0)
                    .with("b", r.get("b").cloned().unwrap())
            })
            .collect();
        let scaled_bg = Dataset::new(schema, rows, None).unwrap();
        let scaled_instance = FeatureVector::new().with("a", 20.0).with("b", 0.1);
        let rescaled = LocalSurrogateExplainer::new(config)
            .explain(&adapter, &scaled_instance, &scaled_bg)
            .unwrap();

        for (w, v) in base.sample_weights.iter().zip(&rescaled.sample_weights) {
            assert!((w - v).abs() < 1e-9);
        }
    }
}
