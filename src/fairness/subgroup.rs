//! Subgroup divergence scan
//!
//! Exhaustive single-feature scan: every numeric feature is cut at a set of
//! percentiles (`feature <= threshold`) and every categorical feature is split
//! by value (`feature == value`). Each subgroup's oracle accuracy is compared
//! with the overall accuracy.

use crate::data::{Dataset, FeatureKind};
use crate::error::{ExplainError, Result};
use crate::explainability::cancel::CancelFlag;
use crate::explainability::config::SubgroupConfig;
use crate::oracle::OracleAdapter;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Row filter defining a subgroup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubgroupPredicate {
    /// Numeric feature at or below a threshold
    AtMost { feature: String, threshold: f64 },
    /// Categorical feature equal to a value
    Equals { feature: String, value: String },
}

impl SubgroupPredicate {
    pub fn feature(&self) -> &str {
        match self {
            SubgroupPredicate::AtMost { feature, .. } | SubgroupPredicate::Equals { feature, .. } => {
                feature
            }
        }
    }
}

impl fmt::Display for SubgroupPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubgroupPredicate::AtMost { feature, threshold } => {
                write!(f, "{} <= {:.4}", feature, threshold)
            }
            SubgroupPredicate::Equals { feature, value } => write!(f, "{} == {}", feature, value),
        }
    }
}

/// Accuracy of one subgroup against the whole population
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgroupRecord {
    pub predicate: SubgroupPredicate,
    /// Predicate rendered as text
    pub description: String,
    pub size: usize,
    pub accuracy: f64,
    pub overall_accuracy: f64,
    /// `overall_accuracy - accuracy`; positive means the model does worse on the subgroup
    pub divergence: f64,
}

/// Result of a subgroup scan, records sorted by |divergence| descending
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgroupReport {
    pub records: Vec<SubgroupRecord>,
    pub overall_accuracy: f64,
    pub n_rows: usize,
    /// Minimum subgroup size after resolving fractions
    pub min_size: usize,
    /// Candidate subgroups skipped for being too small
    pub n_skipped: usize,
    pub cancelled: bool,
}

impl SubgroupReport {
    /// Record with the largest |divergence|
    pub fn worst(&self) -> Option<&SubgroupRecord> {
        self.records.first()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Linear-interpolated percentile of pre-sorted values, `p` in [0, 100]
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + frac * (sorted[hi] - sorted[lo]))
}

/// Distinct thresholds for `values`, in percentile order
fn candidate_thresholds(values: &[f64], percentiles: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mut thresholds: Vec<f64> = Vec::with_capacity(percentiles.len());
    for &p in percentiles {
        if let Some(t) = percentile(&sorted, p) {
            if !thresholds.iter().any(|&seen| seen == t) {
                thresholds.push(t);
            }
        }
    }
    thresholds
}

/// Single-feature subgroup scanner
#[derive(Debug, Clone, Default)]
pub struct SubgroupScanner {
    config: SubgroupConfig,
    cancel: CancelFlag,
}

impl SubgroupScanner {
    pub fn new(config: SubgroupConfig) -> Self {
        Self {
            config,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &SubgroupConfig {
        &self.config
    }

    /// Scan `data`, which must carry true labels
    pub fn scan(&self, oracle: &OracleAdapter<'_>, data: &Dataset) -> Result<SubgroupReport> {
        self.config.validate()?;
        let labels = data.labels().ok_or_else(|| {
            ExplainError::InsufficientData("subgroup scan requires true labels".to_string())
        })?;
        let n = data.len();
        let min_size = self.config.min_size.resolve(n);

        let predicted = oracle.labels(data.to_matrix())?;
        let correct: Vec<bool> = predicted.iter().zip(labels).map(|(p, y)| p == y).collect();
        let overall_accuracy = correct.iter().filter(|&&c| c).count() as f64 / n as f64;

        let n_features = data.n_features();
        let scan_feature = |j: usize| -> Option<(Vec<SubgroupRecord>, usize)> {
            if self.cancel.is_cancelled() {
                return None;
            }
            Some(self.scan_feature(data, j, &correct, overall_accuracy, min_size))
        };
        let per_feature: Vec<Option<(Vec<SubgroupRecord>, usize)>> = if self.config.parallel {
            (0..n_features).into_par_iter().map(scan_feature).collect()
        } else {
            (0..n_features).map(scan_feature).collect()
        };

        let cancelled = per_feature.iter().any(Option::is_none);
        if cancelled {
            warn!(
                scanned = per_feature.iter().filter(|r| r.is_some()).count(),
                n_features,
                "subgroup scan cancelled"
            );
        }

        let mut records = Vec::new();
        let mut n_skipped = 0;
        for (feature_records, skipped) in per_feature.into_iter().flatten() {
            records.extend(feature_records);
            n_skipped += skipped;
        }

        // Stable: equal magnitudes keep feature / candidate order
        records.sort_by(|a, b| {
            b.divergence
                .abs()
                .partial_cmp(&a.divergence.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(k) = self.config.top_k {
            records.truncate(k);
        }

        debug!(n_skipped, min_size, "subgroup candidates below minimum size skipped");
        info!(
            overall_accuracy,
            n_records = records.len(),
            worst_divergence = records.first().map(|r| r.divergence),
            "subgroup scan complete"
        );

        Ok(SubgroupReport {
            records,
            overall_accuracy,
            n_rows: n,
            min_size,
            n_skipped,
            cancelled,
        })
    }

    /// Records for one feature plus the number of candidates skipped
    fn scan_feature(
        &self,
        data: &Dataset,
        j: usize,
        correct: &[bool],
        overall_accuracy: f64,
        min_size: usize,
    ) -> (Vec<SubgroupRecord>, usize) {
        let spec = match data.schema().feature(j) {
            Some(spec) => spec,
            None => return (Vec::new(), 0),
        };
        let column = data.column(j);

        let candidates: Vec<(SubgroupPredicate, Vec<bool>)> = match &spec.kind {
            FeatureKind::Numeric => candidate_thresholds(&column, &self.config.percentiles)
                .into_iter()
                .map(|t| {
                    let mask = column.iter().map(|&v| v <= t).collect();
                    (
                        SubgroupPredicate::AtMost {
                            feature: spec.name.clone(),
                            threshold: t,
                        },
                        mask,
                    )
                })
                .collect(),
            FeatureKind::Categorical { categories } => categories
                .iter()
                .enumerate()
                .filter(|(code, _)| column.iter().any(|&v| v == *code as f64))
                .map(|(code, category)| {
                    let mask = column.iter().map(|&v| v == code as f64).collect();
                    (
                        SubgroupPredicate::Equals {
                            feature: spec.name.clone(),
                            value: category.clone(),
                        },
                        mask,
                    )
                })
                .collect(),
        };

        let mut records = Vec::new();
        let mut skipped = 0;
        for (predicate, mask) in candidates {
            let size = mask.iter().filter(|&&m| m).count();
            if size < min_size {
                skipped += 1;
                continue;
            }
            let hits = mask
                .iter()
                .zip(correct)
                .filter(|(&m, &c)| m && c)
                .count();
            let accuracy = hits as f64 / size as f64;
            records.push(SubgroupRecord {
                description: predicate.to_string(),
                predicate,
                size,
                accuracy,
                overall_accuracy,
                divergence: overall_accuracy - accuracy,
            });
        }
        (records, skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FeatureSpec, FeatureVector, Schema};
    use crate::explainability::config::MinSize;
    use crate::oracle::FnOracle;
    use ndarray::Array2;

    /// Oracle that is right except for young applicants, where it always says 1
    fn biased_setup() -> (FnOracle, Dataset) {
        let schema = Schema::new(vec![
            FeatureSpec::numeric("age"),
            FeatureSpec::categorical("region", ["north", "south"]),
        ])
        .unwrap();
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..100 {
            let age = 18.0 + i as f64;
            rows.push(
                FeatureVector::new()
                    .with("age", age)
                    .with("region", if i % 2 == 0 { "north" } else { "south" }),
            );
            labels.push(i % 2);
        }
        let data = Dataset::new(schema, rows, Some(labels)).unwrap();
        let oracle = FnOracle::new(|x: &Array2<f64>| {
            Ok(x.rows()
                .into_iter()
                .map(|r| if r[0] < 30.0 { 1 } else { r[1] as usize })
                .collect())
        });
        (oracle, data)
    }

    #[test]
    fn test_percentile_interpolation() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 50.0), Some(3.0));
        assert_eq!(percentile(&sorted, 25.0), Some(2.0));
        assert!((percentile(&sorted, 10.0).unwrap() - 1.4).abs() < 1e-12);
        assert_eq!(percentile(&sorted, 100.0), Some(5.0));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_duplicate_thresholds_collapsed() {
        let values = vec![1.0; 20];
        assert_eq!(candidate_thresholds(&values, &[10.0, 50.0, 90.0]), vec![1.0]);
    }

    #[test]
    fn test_finds_young_subgroup() {
        let (oracle, data) = biased_setup();
        let adapter = OracleAdapter::new(&oracle);
        let report = SubgroupScanner::default().scan(&adapter, &data).unwrap();

        // Ages 18..=29 are half wrong
        assert!((report.overall_accuracy - 0.94).abs() < 1e-12);
        let worst = report.worst().unwrap();
        assert_eq!(worst.predicate.feature(), "age");
        assert!(worst.divergence > 0.0);
        for pair in report.records.windows(2) {
            assert!(pair[0].divergence.abs() >= pair[1].divergence.abs());
        }
    }

    #[test]
    fn test_min_size_skips_small_groups() {
        let (oracle, data) = biased_setup();
        let adapter = OracleAdapter::new(&oracle);
        let report = SubgroupScanner::new(
            SubgroupConfig::default().with_min_size(MinSize::Absolute(60)),
        )
        .scan(&adapter, &data)
        .unwrap();
        assert!(report.records.iter().all(|r| r.size >= 60));
        assert!(report.n_skipped > 0);
    }

    #[test]
    fn test_top_k_and_serial_match() {
        let (oracle, data) = biased_setup();
        let adapter = OracleAdapter::new(&oracle);
        let parallel = SubgroupScanner::default().scan(&adapter, &data).unwrap();
        let serial = SubgroupScanner::new(SubgroupConfig::default().with_parallel(false).with_top_k(2))
            .scan(&adapter, &data)
            .unwrap();
        assert_eq!(serial.records.len(), 2);
        assert_eq!(serial.records[..], parallel.records[..2]);
    }

    #[test]
    fn test_categorical_predicates() {
        let (oracle, data) = biased_setup();
        let adapter = OracleAdapter::new(&oracle);
        let report = SubgroupScanner::default().scan(&adapter, &data).unwrap();
        let north = report
            .records
            .iter()
            .find(|r| r.description == "region == north")
            .unwrap();
        assert_eq!(north.size, 50);
        // Young north rows have label 0 but are predicted 1
        assert!(north.divergence > 0.0);
    }

    #[test]
    fn test_requires_labels() {
        let schema = Schema::numeric(["a"]).unwrap();
        let data = Dataset::new(schema, vec![FeatureVector::new().with("a", 1.0)], None).unwrap();
        let oracle = FnOracle::new(|x: &Array2<f64>| Ok(vec![0; x.nrows()]));
        let adapter = OracleAdapter::new(&oracle);
        let result = SubgroupScanner::default().scan(&adapter, &data);
        assert!(matches!(result, Err(ExplainError::InsufficientData(_))));
    }
}
