//! Counterfactual search
//!
//! Breadth-first search over "instance plus cumulative changes". Children of a
//! state apply every step of every mutable feature, in the order the steps
//! were declared, so the search order is fully determined by the step set.
//! States are deduplicated by their sorted change list; the visited set is
//! bounded and evicts least recently seen states.

use crate::cache::LruSet;
use crate::data::{FeatureKind, FeatureValue, FeatureVector, Schema};
use crate::error::{ExplainError, Result};
use crate::explainability::cancel::CancelFlag;
use crate::explainability::config::CounterfactualConfig;
use crate::oracle::OracleAdapter;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use tracing::{debug, info, warn};

/// One discrete move applied to a feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PerturbationStep {
    /// Add a delta to a numeric feature
    Delta(f64),
    /// Replace the feature's value
    Set(FeatureValue),
}

/// Steps allowed for one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStepSet {
    pub feature: String,
    pub steps: Vec<PerturbationStep>,
    /// Inclusive range a numeric feature must stay in
    pub bounds: Option<(f64, f64)>,
}

/// Mutable features and their perturbation steps, in search order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSteps {
    entries: Vec<FeatureStepSet>,
}

impl FeatureSteps {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, feature: &str) -> &mut FeatureStepSet {
        let idx = match self.entries.iter().position(|e| e.feature == feature) {
            Some(idx) => idx,
            None => {
                self.entries.push(FeatureStepSet {
                    feature: feature.to_string(),
                    steps: Vec::new(),
                    bounds: None,
                });
                self.entries.len() - 1
            }
        };
        &mut self.entries[idx]
    }

    /// Numeric deltas for `feature`
    pub fn numeric(mut self, feature: &str, deltas: impl IntoIterator<Item = f64>) -> Self {
        self.entry(feature)
            .steps
            .extend(deltas.into_iter().map(PerturbationStep::Delta));
        self
    }

    /// Replacement categories for `feature`
    pub fn categorical<S: Into<String>>(
        mut self,
        feature: &str,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        self.entry(feature).steps.extend(
            values
                .into_iter()
                .map(|v| PerturbationStep::Set(FeatureValue::Categorical(v.into()))),
        );
        self
    }

    /// Add an arbitrary step
    pub fn step(mut self, feature: &str, step: PerturbationStep) -> Self {
        self.entry(feature).steps.push(step);
        self
    }

    /// Keep a numeric feature inside `[min, max]`
    pub fn with_bounds(mut self, feature: &str, min: f64, max: f64) -> Self {
        self.entry(feature).bounds = Some((min, max));
        self
    }

    pub fn entries(&self) -> &[FeatureStepSet] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.steps.is_empty())
    }

    /// Validate against `schema` and encode every step
    fn resolve(&self, schema: &Schema) -> Result<Vec<ResolvedSteps>> {
        if self.is_empty() {
            return Err(ExplainError::invalid_parameter(
                "feature_steps",
                "{}",
                "at least one perturbation step is required",
            ));
        }
        let mut resolved = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let feature_idx = schema.index_of(&entry.feature)?;
            let spec = schema
                .feature(feature_idx)
                .ok_or_else(|| ExplainError::FeatureNotFound(entry.feature.clone()))?;

            let mut moves = Vec::with_capacity(entry.steps.len());
            for step in &entry.steps {
                let mv = match (step, &spec.kind) {
                    (PerturbationStep::Delta(d), FeatureKind::Numeric) => {
                        if !d.is_finite() || *d == 0.0 {
                            return Err(ExplainError::invalid_parameter(
                                format!("feature_steps.{}", entry.feature),
                                d,
                                "deltas must be finite and non-zero",
                            ));
                        }
                        Move::Delta(*d)
                    }
                    (PerturbationStep::Delta(d), FeatureKind::Categorical { .. }) => {
                        return Err(ExplainError::invalid_parameter(
                            format!("feature_steps.{}", entry.feature),
                            d,
                            "categorical features only accept replacement values",
                        ))
                    }
                    (PerturbationStep::Set(value), _) => Move::Set(spec.encode(value)?),
                };
                moves.push(mv);
            }

            if let Some((min, max)) = entry.bounds {
                if spec.is_categorical() || !(min <= max) {
                    return Err(ExplainError::invalid_parameter(
                        format!("feature_steps.{}.bounds", entry.feature),
                        format!("[{}, {}]", min, max),
                        "bounds need a numeric feature and min <= max",
                    ));
                }
            }

            resolved.push(ResolvedSteps {
                feature_idx,
                moves,
                bounds: entry.bounds,
            });
        }
        Ok(resolved)
    }
}

#[derive(Debug, Clone, Copy)]
enum Move {
    Delta(f64),
    Set(f64),
}

#[derive(Debug, Clone)]
struct ResolvedSteps {
    feature_idx: usize,
    moves: Vec<Move>,
    bounds: Option<(f64, f64)>,
}

/// One changed feature of a counterfactual
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureChange {
    pub feature: String,
    pub from: FeatureValue,
    pub to: FeatureValue,
}

/// Outcome of a counterfactual search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterfactualResult {
    pub found: bool,
    /// The counterfactual when found, otherwise the original instance
    pub instance: FeatureVector,
    /// Changed features in schema order; empty when not found
    pub changes: Vec<FeatureChange>,
    pub original_class: usize,
    pub target_class: usize,
    /// States expanded
    pub expansions: usize,
    /// Rows sent to the oracle during the search
    pub oracle_queries: usize,
    /// L1 size of the changes; a changed category counts 1
    pub distance: f64,
    /// Visited states dropped to honour the capacity
    pub visited_evictions: u64,
    pub cancelled: bool,
}

impl CounterfactualResult {
    /// New value of `feature`, if it was changed
    pub fn change(&self, feature: &str) -> Option<&FeatureValue> {
        self.changes
            .iter()
            .find(|c| c.feature == feature)
            .map(|c| &c.to)
    }

    pub fn n_changes(&self) -> usize {
        self.changes.len()
    }
}

/// Search node: the encoded row and its sorted change list
#[derive(Debug, Clone)]
struct State {
    row: Vec<f64>,
    changes: Vec<(usize, f64)>,
}

fn state_key(changes: &[(usize, f64)]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (idx, value) in changes {
        idx.hash(&mut hasher);
        value.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

/// Bounded breadth-first counterfactual search
#[derive(Debug, Clone, Default)]
pub struct CounterfactualSearch {
    config: CounterfactualConfig,
    cancel: CancelFlag,
}

impl CounterfactualSearch {
    pub fn new(config: CounterfactualConfig) -> Self {
        Self {
            config,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &CounterfactualConfig {
        &self.config
    }

    pub fn search(
        &self,
        oracle: &OracleAdapter<'_>,
        schema: &Schema,
        instance: &FeatureVector,
        steps: &FeatureSteps,
        target_class: Option<usize>,
    ) -> Result<CounterfactualResult> {
        self.config.validate()?;
        if let Some(t) = target_class {
            oracle.check_class("target_class", t)?;
        }
        let resolved = steps.resolve(schema)?;
        let original = schema.encode(instance)?;
        let queries_before = oracle.stats().rows_queried;

        let original_class = oracle.label_one(&original)?;
        let target_class = match target_class {
            Some(t) => t,
            None if oracle.is_binary(original_class) => 1 - original_class,
            None => {
                return Err(ExplainError::invalid_parameter(
                    "target_class",
                    "None",
                    format!(
                        "a target is required when the oracle is not binary (current class {})",
                        original_class
                    ),
                ))
            }
        };

        let finish = |found: Option<&State>, expansions: usize, evictions: u64, cancelled: bool| {
            self.build_result(
                schema,
                instance,
                &original,
                found,
                original_class,
                target_class,
                expansions,
                oracle.stats().rows_queried - queries_before,
                evictions,
                cancelled,
            )
        };

        if original_class == target_class {
            debug!(target_class, "instance already has the target class");
            let root = State {
                row: original.to_vec(),
                changes: Vec::new(),
            };
            return finish(Some(&root), 0, 0, false);
        }

        let mut visited = LruSet::new(self.config.visited_capacity);
        let mut queue = VecDeque::new();
        visited.insert(state_key(&[]));
        queue.push_back(State {
            row: original.to_vec(),
            changes: Vec::new(),
        });

        let mut expansions = 0;
        let mut cancelled = false;
        while expansions < self.config.max_iters {
            if self.cancel.is_cancelled() {
                cancelled = true;
                warn!(expansions, "counterfactual search cancelled");
                break;
            }
            let state = match queue.pop_front() {
                Some(state) => state,
                None => break,
            };
            expansions += 1;

            let children = self.expand(&state, &original, &resolved, &mut visited);
            if children.is_empty() {
                continue;
            }

            // One oracle batch per expansion; the first hit in child order wins
            let n_features = original.len();
            let flat: Vec<f64> = children.iter().flat_map(|c| c.row.iter().copied()).collect();
            let batch = Array2::from_shape_vec((children.len(), n_features), flat)?;
            let labels = oracle.labels(&batch)?;
            if let Some(pos) = labels.iter().position(|&l| l == target_class) {
                let hit = &children[pos];
                info!(
                    expansions,
                    n_changes = hit.changes.len(),
                    "counterfactual found"
                );
                return finish(Some(hit), expansions, visited.evictions(), false);
            }
            queue.extend(children);
        }

        if visited.evictions() > 0 {
            warn!(
                evictions = visited.evictions(),
                capacity = visited.capacity(),
                "counterfactual visited set overflowed; some states may have been revisited"
            );
        }
        info!(expansions, cancelled, "no counterfactual found within budget");
        finish(None, expansions, visited.evictions(), cancelled)
    }

    /// Unvisited children of `state`, in declared step order
    fn expand(
        &self,
        state: &State,
        original: &Array1<f64>,
        resolved: &[ResolvedSteps],
        visited: &mut LruSet<u64>,
    ) -> Vec<State> {
        let mut children = Vec::new();
        for feature in resolved {
            let j = feature.feature_idx;
            for mv in &feature.moves {
                let value = match *mv {
                    Move::Delta(d) => state.row[j] + d,
                    Move::Set(v) => v,
                };
                if value == state.row[j] || !value.is_finite() {
                    continue;
                }
                if let Some((min, max)) = feature.bounds {
                    if value < min || value > max {
                        continue;
                    }
                }

                let mut changes: Vec<(usize, f64)> =
                    state.changes.iter().copied().filter(|(idx, _)| *idx != j).collect();
                if value != original[j] {
                    let at = changes.partition_point(|(idx, _)| *idx < j);
                    changes.insert(at, (j, value));
                }
                if let Some(limit) = self.config.max_changes {
                    if changes.len() > limit {
                        continue;
                    }
                }
                if !visited.insert(state_key(&changes)) {
                    continue;
                }

                let mut row = state.row.clone();
                row[j] = value;
                children.push(State { row, changes });
            }
        }
        children
    }

    #[allow(clippy::too_many_arguments)]
    fn build_result(
        &self,
        schema: &Schema,
        instance: &FeatureVector,
        original: &Array1<f64>,
        found: Option<&State>,
        original_class: usize,
        target_class: usize,
        expansions: usize,
        oracle_queries: usize,
        visited_evictions: u64,
        cancelled: bool,
    ) -> Result<CounterfactualResult> {
        let (instance, changes, distance) = match found {
            Some(state) => {
                let mut changes = Vec::with_capacity(state.changes.len());
                let mut distance = 0.0;
                for &(j, value) in &state.changes {
                    let spec = schema
                        .feature(j)
                        .ok_or_else(|| ExplainError::FeatureNotFound(format!("index {}", j)))?;
                    distance += if spec.is_categorical() {
                        1.0
                    } else {
                        (value - original[j]).abs()
                    };
                    changes.push(FeatureChange {
                        feature: spec.name.clone(),
                        from: spec.decode(original[j]),
                        to: spec.decode(value),
                    });
                }
                (schema.decode(&state.row)?, changes, distance)
            }
            None => (instance.clone(), Vec::new(), 0.0),
        };

        Ok(CounterfactualResult {
            found: found.is_some(),
            instance,
            changes,
            original_class,
            target_class,
            expansions,
            oracle_queries,
            distance,
            visited_evictions,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FeatureSpec;
    use crate::oracle::FnOracle;

    fn credit_oracle() -> FnOracle {
        FnOracle::new(|x: &Array2<f64>| {
            Ok(x.rows()
                .into_iter()
                .map(|r| usize::from(r[0] > 650.0))
                .collect())
        })
        .with_n_classes(2)
    }

    fn credit_schema() -> Schema {
        Schema::numeric(["credit_score", "debt"]).unwrap()
    }

    fn applicant(score: f64) -> FeatureVector {
        FeatureVector::new()
            .with("credit_score", score)
            .with("debt", 1_000.0)
    }

    #[test]
    fn test_first_expansion_hit() {
        let oracle = credit_oracle();
        let adapter = OracleAdapter::new(&oracle);
        let steps = FeatureSteps::new().numeric("credit_score", [10.0, 25.0, 50.0]);
        let result = CounterfactualSearch::default()
            .search(&adapter, &credit_schema(), &applicant(605.0), &steps, Some(1))
            .unwrap();

        assert!(result.found);
        assert_eq!(result.expansions, 1);
        assert_eq!(result.change("credit_score"), Some(&FeatureValue::Numeric(655.0)));
        assert_eq!(result.n_changes(), 1);
        assert_eq!(result.distance, 50.0);
    }

    #[test]
    fn test_default_target_flips_binary_label() {
        let oracle = credit_oracle();
        let adapter = OracleAdapter::new(&oracle);
        let steps = FeatureSteps::new().numeric("credit_score", [10.0, 25.0, 50.0]);
        let result = CounterfactualSearch::default()
            .search(&adapter, &credit_schema(), &applicant(600.0), &steps, None)
            .unwrap();
        assert_eq!(result.original_class, 0);
        assert_eq!(result.target_class, 1);
        assert!(result.found);
        assert_eq!(result.expansions, 2);
        assert_eq!(result.change("credit_score"), Some(&FeatureValue::Numeric(660.0)));
    }

    #[test]
    fn test_budget_exhaustion_returns_original() {
        let oracle = credit_oracle();
        let adapter = OracleAdapter::new(&oracle);
        let steps = FeatureSteps::new().numeric("credit_score", [1.0]);
        let instance = applicant(100.0);
        let result = CounterfactualSearch::new(CounterfactualConfig::default().with_max_iters(5))
            .search(&adapter, &credit_schema(), &instance, &steps, Some(1))
            .unwrap();
        assert!(!result.found);
        assert_eq!(result.instance, instance);
        assert!(result.changes.is_empty());
        assert_eq!(result.expansions, 5);
    }

    #[test]
    fn test_bounds_are_respected() {
        let oracle = credit_oracle();
        let adapter = OracleAdapter::new(&oracle);
        let steps = FeatureSteps::new()
            .numeric("credit_score", [50.0])
            .with_bounds("credit_score", 300.0, 640.0);
        let result = CounterfactualSearch::default()
            .search(&adapter, &credit_schema(), &applicant(600.0), &steps, Some(1))
            .unwrap();
        assert!(!result.found);
    }

    #[test]
    fn test_dedup_prevents_revisits() {
        // +10 then -10 returns to the original state, which is already visited
        let oracle = FnOracle::new(|x: &Array2<f64>| Ok(vec![0; x.nrows()])).with_n_classes(2);
        let adapter = OracleAdapter::new(&oracle);
        let steps = FeatureSteps::new().numeric("credit_score", [10.0, -10.0]);
        let result = CounterfactualSearch::new(CounterfactualConfig::default().with_max_iters(3))
            .search(&adapter, &credit_schema(), &applicant(600.0), &steps, Some(1))
            .unwrap();
        // root: 2 children; 610: only 620 is new; 590: only 580 is new
        assert_eq!(result.oracle_queries, 1 + 2 + 1 + 1);
    }

    #[test]
    fn test_categorical_steps() {
        let schema = Schema::new(vec![
            FeatureSpec::numeric("income"),
            FeatureSpec::categorical("housing", ["rent", "own", "mortgage"]),
        ])
        .unwrap();
        let oracle = FnOracle::new(|x: &Array2<f64>| {
            Ok(x.rows().into_iter().map(|r| usize::from(r[1] == 1.0)).collect())
        })
        .with_n_classes(2);
        let adapter = OracleAdapter::new(&oracle);
        let steps = FeatureSteps::new()
            .numeric("income", [1_000.0])
            .categorical("housing", ["mortgage", "own"]);
        let instance = FeatureVector::new().with("income", 40_000.0).with("housing", "rent");
        let result = CounterfactualSearch::default()
            .search(&adapter, &schema, &instance, &steps, None)
            .unwrap();
        assert!(result.found);
        assert_eq!(result.n_changes(), 1);
        assert_eq!(result.change("housing"), Some(&FeatureValue::from("own")));
        assert_eq!(result.distance, 1.0);
    }

    #[test]
    fn test_max_changes_limits_depth() {
        // Needs both features changed; a limit of one change makes it unreachable
        let oracle = FnOracle::new(|x: &Array2<f64>| {
            Ok(x.rows()
                .into_iter()
                .map(|r| usize::from(r[0] > 650.0 && r[1] < 1_000.0))
                .collect())
        })
        .with_n_classes(2);
        let adapter = OracleAdapter::new(&oracle);
        let steps = FeatureSteps::new()
            .numeric("credit_score", [100.0])
            .numeric("debt", [-500.0]);
        let limited = CounterfactualSearch::new(CounterfactualConfig::default().with_max_changes(1))
            .search(&adapter, &credit_schema(), &applicant(600.0), &steps, Some(1))
            .unwrap();
        assert!(!limited.found);

        let unlimited = CounterfactualSearch::default()
            .search(&adapter, &credit_schema(), &applicant(600.0), &steps, Some(1))
            .unwrap();
        assert!(unlimited.found);
        assert_eq!(unlimited.n_changes(), 2);
    }

    #[test]
    fn test_invalid_steps_rejected() {
        let oracle = credit_oracle();
        let adapter = OracleAdapter::new(&oracle);
        let search = CounterfactualSearch::default();

        let empty = FeatureSteps::new();
        assert!(matches!(
            search.search(&adapter, &credit_schema(), &applicant(600.0), &empty, Some(1)),
            Err(ExplainError::InvalidParameter { .. })
        ));

        let unknown = FeatureSteps::new().numeric("age", [1.0]);
        assert!(matches!(
            search.search(&adapter, &credit_schema(), &applicant(600.0), &unknown, Some(1)),
            Err(ExplainError::FeatureNotFound(_))
        ));

        let zero = FeatureSteps::new().numeric("credit_score", [0.0]);
        assert!(search
            .search(&adapter, &credit_schema(), &applicant(600.0), &zero, Some(1))
            .is_err());
    }

    #[test]
    fn test_multiclass_requires_target() {
        let oracle = FnOracle::new(|x: &Array2<f64>| Ok(vec![2; x.nrows()])).with_n_classes(3);
        let adapter = OracleAdapter::new(&oracle);
        let steps = FeatureSteps::new().numeric("credit_score", [10.0]);
        let result = CounterfactualSearch::default()
            .search(&adapter, &credit_schema(), &applicant(600.0), &steps, None);
        assert!(matches!(result, Err(ExplainError::InvalidParameter { .. })));
    }

    #[test]
    fn test_target_outside_declared_classes_rejected() {
        let oracle = credit_oracle();
        let adapter = OracleAdapter::new(&oracle);
        let steps = FeatureSteps::new().numeric("credit_score", [10.0, 25.0, 50.0]);
        let result = CounterfactualSearch::default().search(
            &adapter,
            &credit_schema(),
            &applicant(600.0),
            &steps,
            Some(5),
        );
        assert!(matches!(
            result,
            Err(ExplainError::InvalidParameter { ref name, .. }) if name == "target_class"
        ));
        assert_eq!(adapter.stats().rows_queried, 0);
    }

    #[test]
    fn test_cancelled_search_returns_original() {
        let oracle = credit_oracle();
        let adapter = OracleAdapter::new(&oracle);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let steps = FeatureSteps::new().numeric("credit_score", [10.0]);
        let result = CounterfactualSearch::default()
            .with_cancel_flag(cancel)
            .search(&adapter, &credit_schema(), &applicant(600.0), &steps, Some(1))
            .unwrap();
        assert!(result.cancelled);
        assert!(!result.found);
        assert_eq!(result.expansions, 0);
    }
}
