//! Explanation reports
//!
//! Runs any subset of the explainers for one instance and gathers their
//! outputs into a single serialisable record.

use crate::data::{Dataset, FeatureVector};
use crate::error::{ExplainError, Result};
use crate::explainability::cancel::CancelFlag;
use crate::explainability::config::ExplainerConfig;
use crate::explainability::counterfactual::{CounterfactualResult, CounterfactualSearch, FeatureSteps};
use crate::explainability::local_surrogate::{LocalExplanation, LocalSurrogateExplainer};
use crate::explainability::shapley::{AttributionMap, ShapleyEstimator};
use crate::explainability::surrogate::{GlobalSurrogate, SurrogateTrainer};
use crate::fairness::subgroup::{SubgroupReport, SubgroupScanner};
use crate::oracle::{Oracle, OracleAdapter, OracleStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Everything known about one instance's prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplanationReport {
    pub id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub instance: FeatureVector,
    /// Oracle label for the instance
    pub predicted_class: usize,
    pub global_surrogate: Option<GlobalSurrogate>,
    pub local: Option<LocalExplanation>,
    pub shapley: Option<AttributionMap>,
    pub counterfactual: Option<CounterfactualResult>,
    pub subgroups: Option<SubgroupReport>,
    /// Oracle usage across all components of this report
    pub oracle_stats: OracleStats,
}

impl ExplanationReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Short plain-text summary, one line per component
    pub fn summary(&self) -> Vec<String> {
        let mut lines = vec![format!("predicted class: {}", self.predicted_class)];
        if let Some(surrogate) = &self.global_surrogate {
            lines.push(format!(
                "global surrogate: depth {}, fidelity {:.3}{}",
                surrogate.selected_depth,
                surrogate.fidelity,
                if surrogate.low_fidelity() { " (low)" } else { "" }
            ));
        }
        if let Some(local) = &self.local {
            if let Some(top) = local.top_k(1).first() {
                lines.push(format!(
                    "local: strongest feature {} ({:+.4}), R² {:.3}",
                    top.feature, top.coefficient, local.score
                ));
            }
        }
        if let Some(shapley) = &self.shapley {
            if let Some(top) = shapley.sorted().first() {
                lines.push(format!(
                    "shapley: largest attribution {} ({:+.4}) over {} permutations",
                    top.feature, top.attribution, shapley.n_permutations
                ));
            }
        }
        if let Some(cf) = &self.counterfactual {
            if cf.found {
                let changes: Vec<String> = cf
                    .changes
                    .iter()
                    .map(|c| format!("{}: {} -> {}", c.feature, c.from, c.to))
                    .collect();
                lines.push(format!(
                    "counterfactual to class {}: {}",
                    cf.target_class,
                    changes.join(", ")
                ));
            } else {
                lines.push(format!(
                    "counterfactual to class {}: none within {} expansions",
                    cf.target_class, cf.expansions
                ));
            }
        }
        if let Some(subgroups) = &self.subgroups {
            if let Some(worst) = subgroups.worst() {
                lines.push(format!(
                    "subgroups: {} diverges by {:+.3} (n = {})",
                    worst.description, worst.divergence, worst.size
                ));
            }
        }
        lines
    }
}

/// Builds [`ExplanationReport`]s against one oracle and background
pub struct ExplanationReporter<'a> {
    oracle: &'a dyn Oracle,
    background: &'a Dataset,
    config: ExplainerConfig,
    cancel: CancelFlag,
    global_surrogate: bool,
    local: bool,
    shapley: bool,
    counterfactual: Option<(FeatureSteps, Option<usize>)>,
    subgroup_data: Option<&'a Dataset>,
}

impl<'a> ExplanationReporter<'a> {
    /// Reporter running local and Shapley explanations by default
    pub fn new(oracle: &'a dyn Oracle, background: &'a Dataset) -> Self {
        Self {
            oracle,
            background,
            config: ExplainerConfig::default(),
            cancel: CancelFlag::new(),
            global_surrogate: false,
            local: true,
            shapley: true,
            counterfactual: None,
            subgroup_data: None,
        }
    }

    pub fn with_config(mut self, config: ExplainerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_global_surrogate(mut self, enabled: bool) -> Self {
        self.global_surrogate = enabled;
        self
    }

    pub fn with_local(mut self, enabled: bool) -> Self {
        self.local = enabled;
        self
    }

    pub fn with_shapley(mut self, enabled: bool) -> Self {
        self.shapley = enabled;
        self
    }

    /// Search for a counterfactual with these steps
    pub fn with_counterfactual(mut self, steps: FeatureSteps, target_class: Option<usize>) -> Self {
        self.counterfactual = Some((steps, target_class));
        self
    }

    /// Scan subgroups of this labelled dataset
    pub fn with_subgroup_scan(mut self, data: &'a Dataset) -> Self {
        self.subgroup_data = Some(data);
        self
    }

    pub fn report(&self, instance: &FeatureVector) -> Result<ExplanationReport> {
        self.config.validate()?;
        let adapter = OracleAdapter::new(self.oracle).with_batch_size(self.config.oracle.batch_size);
        let encoded = self.background.encode_row(instance)?;
        let predicted_class = adapter.label_one(&encoded)?;

        let global_surrogate = if self.global_surrogate {
            Some(SurrogateTrainer::new(self.config.surrogate.clone()).train(&adapter, self.background)?)
        } else {
            None
        };

        let local = if self.local {
            Some(
                LocalSurrogateExplainer::new(self.config.local.clone())
                    .with_cancel_flag(self.cancel.clone())
                    .explain(&adapter, instance, self.background)?,
            )
        } else {
            None
        };

        let shapley = if self.shapley {
            Some(
                ShapleyEstimator::new(self.config.shapley.clone())
                    .with_cancel_flag(self.cancel.clone())
                    .estimate(&adapter, instance, self.background)?,
            )
        } else {
            None
        };

        let counterfactual = match &self.counterfactual {
            Some((steps, target)) => Some(
                CounterfactualSearch::new(self.config.counterfactual.clone())
                    .with_cancel_flag(self.cancel.clone())
                    .search(&adapter, self.background.schema(), instance, steps, *target)?,
            ),
            None => None,
        };

        let subgroups = match self.subgroup_data {
            Some(data) => {
                if data.schema() != self.background.schema() {
                    return Err(ExplainError::SchemaMismatch(
                        "subgroup data and background use different schemas".to_string(),
                    ));
                }
                Some(
                    SubgroupScanner::new(self.config.subgroup.clone())
                        .with_cancel_flag(self.cancel.clone())
                        .scan(&adapter, data)?,
                )
            }
            None => None,
        };

        let report = ExplanationReport {
            id: Uuid::new_v4(),
            generated_at: Utc::now(),
            instance: instance.clone(),
            predicted_class,
            global_surrogate,
            local,
            shapley,
            counterfactual,
            subgroups,
            oracle_stats: adapter.stats(),
        };
        info!(
            report_id = %report.id,
            invocations = report.oracle_stats.invocations,
            rows_queried = report.oracle_stats.rows_queried,
            "explanation report assembled"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Schema;
    use crate::oracle::FnOracle;

    fn setup() -> (FnOracle, Dataset) {
        let oracle = FnOracle::binary(|row: &[f64]| {
            1.0 / (1.0 + (-(row[0] - 650.0) / 20.0).exp())
        });
        let schema = Schema::numeric(["credit_score", "income"]).unwrap();
        let rows: Vec<FeatureVector> = (0..80)
            .map(|i| {
                FeatureVector::new()
                    .with("credit_score", 500.0 + 4.0 * i as f64)
                    .with("income", 20_000.0 + 500.0 * (i % 9) as f64)
            })
            .collect();
        let labels = (0..80).map(|i| usize::from(500.0 + 4.0 * i as f64 > 640.0)).collect();
        let background = Dataset::new(schema, rows, Some(labels)).unwrap();
        (oracle, background)
    }

    #[test]
    fn test_full_report() {
        let (oracle, background) = setup();
        let instance = FeatureVector::new()
            .with("credit_score", 600.0)
            .with("income", 30_000.0);
        let config = ExplainerConfig {
            shapley: crate::explainability::config::ShapleyConfig::default().with_n_permutations(40),
            ..ExplainerConfig::default()
        };
        let report = ExplanationReporter::new(&oracle, &background)
            .with_config(config)
            .with_global_surrogate(true)
            .with_counterfactual(FeatureSteps::new().numeric("credit_score", [10.0, 25.0, 50.0]), None)
            .with_subgroup_scan(&background)
            .report(&instance)
            .unwrap();

        assert_eq!(report.predicted_class, 0);
        assert!(report.global_surrogate.is_some());
        assert!(report.local.is_some());
        assert!(report.shapley.is_some());
        assert!(report.counterfactual.as_ref().unwrap().found);
        assert!(report.subgroups.is_some());
        assert!(report.oracle_stats.invocations > 0);
        assert_eq!(report.summary().len(), 6);

        let json = report.to_json().unwrap();
        let restored = ExplanationReport::from_json(&json).unwrap();
        assert_eq!(restored.id, report.id);
        assert_eq!(restored.predicted_class, report.predicted_class);
    }

    #[test]
    fn test_components_can_be_disabled() {
        let (oracle, background) = setup();
        let instance = FeatureVector::new()
            .with("credit_score", 700.0)
            .with("income", 30_000.0);
        let report = ExplanationReporter::new(&oracle, &background)
            .with_local(false)
            .with_shapley(false)
            .report(&instance)
            .unwrap();
        assert_eq!(report.predicted_class, 1);
        assert!(report.local.is_none());
        assert!(report.shapley.is_none());
        assert_eq!(report.summary(), vec!["predicted class: 1".to_string()]);
    }

    #[test]
    fn test_invalid_config_fails_before_querying() {
        let (oracle, background) = setup();
        let instance = FeatureVector::new()
            .with("credit_score", 700.0)
            .with("income", 30_000.0);
        let mut config = ExplainerConfig::default();
        config.local.n_samples = 0;
        let result = ExplanationReporter::new(&oracle, &background)
            .with_config(config)
            .report(&instance);
        assert!(matches!(result, Err(ExplainError::InvalidParameter { .. })));
    }
}
