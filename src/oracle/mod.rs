//! Oracle abstraction over opaque classifiers
//!
//! An [`Oracle`] is any trained classifier that can label a batch of encoded
//! rows and, optionally, return per-class probabilities. The explainers never
//! see the oracle directly: they go through [`OracleAdapter`], which chunks
//! large batches, validates every response against the query and synthesises
//! one-hot probabilities when the oracle has no probability output.

use crate::error::{ExplainError, Result};
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Tolerance used when checking that probabilities lie in [0, 1]
const PROBA_TOLERANCE: f64 = 1e-6;

/// Largest label accepted from an oracle that does not declare its class count
pub const MAX_UNDECLARED_CLASSES: usize = 4096;

/// Capability set of a black-box classifier.
///
/// Implementations must be side-effect free from the caller's point of view;
/// the engine may call them concurrently from worker threads.
pub trait Oracle: Send + Sync {
    /// Predict a class index for every row of `batch`
    fn predict_label(&self, batch: &Array2<f64>) -> Result<Vec<usize>>;

    /// Whether [`Oracle::predict_proba`] is available
    fn supports_proba(&self) -> bool {
        false
    }

    /// Per-class probabilities, one row per input row
    fn predict_proba(&self, batch: &Array2<f64>) -> Result<Array2<f64>> {
        let _ = batch;
        Err(ExplainError::OracleInvocation(
            "oracle does not provide probabilities".to_string(),
        ))
    }

    /// Number of classes, when known
    fn n_classes(&self) -> Option<usize> {
        None
    }
}

type LabelFn = dyn Fn(&Array2<f64>) -> Result<Vec<usize>> + Send + Sync;
type ProbaFn = dyn Fn(&Array2<f64>) -> Result<Array2<f64>> + Send + Sync;

/// Oracle built from closures
pub struct FnOracle {
    label_fn: Box<LabelFn>,
    proba_fn: Option<Box<ProbaFn>>,
    n_classes: Option<usize>,
}

impl FnOracle {
    /// Create an oracle from a labelling closure
    pub fn new<F>(label_fn: F) -> Self
    where
        F: Fn(&Array2<f64>) -> Result<Vec<usize>> + Send + Sync + 'static,
    {
        Self {
            label_fn: Box::new(label_fn),
            proba_fn: None,
            n_classes: None,
        }
    }

    /// Attach a probability closure
    pub fn with_proba<F>(mut self, proba_fn: F) -> Self
    where
        F: Fn(&Array2<f64>) -> Result<Array2<f64>> + Send + Sync + 'static,
    {
        self.proba_fn = Some(Box::new(proba_fn));
        self
    }

    /// Declare the number of classes
    pub fn with_n_classes(mut self, n: usize) -> Self {
        self.n_classes = Some(n);
        self
    }

    /// Binary oracle from a row-wise probability of the positive class.
    ///
    /// Labels are `1` when the probability is at least 0.5.
    pub fn binary<F>(positive_proba: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + Clone + 'static,
    {
        let label_p = positive_proba.clone();
        Self::new(move |x: &Array2<f64>| {
            Ok(x.rows()
                .into_iter()
                .map(|row| usize::from(label_p(&row.to_vec()) >= 0.5))
                .collect())
        })
        .with_proba(move |x: &Array2<f64>| {
            let mut out = Array2::zeros((x.nrows(), 2));
            for (i, row) in x.rows().into_iter().enumerate() {
                let p = positive_proba(&row.to_vec());
                out[[i, 0]] = 1.0 - p;
                out[[i, 1]] = p;
            }
            Ok(out)
        })
        .with_n_classes(2)
    }
}

impl Oracle for FnOracle {
    fn predict_label(&self, batch: &Array2<f64>) -> Result<Vec<usize>> {
        (self.label_fn)(batch)
    }

    fn supports_proba(&self) -> bool {
        self.proba_fn.is_some()
    }

    fn predict_proba(&self, batch: &Array2<f64>) -> Result<Array2<f64>> {
        match &self.proba_fn {
            Some(f) => f(batch),
            None => Err(ExplainError::OracleInvocation(
                "oracle does not provide probabilities".to_string(),
            )),
        }
    }

    fn n_classes(&self) -> Option<usize> {
        self.n_classes
    }
}

/// Query counters of an adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OracleStats {
    /// Number of calls forwarded to the oracle
    pub invocations: usize,
    /// Number of rows sent to the oracle
    pub rows_queried: usize,
}

/// Validating, batching front-end to an [`Oracle`]
pub struct OracleAdapter<'a> {
    oracle: &'a dyn Oracle,
    batch_size: usize,
    invocations: AtomicUsize,
    rows_queried: AtomicUsize,
}

impl<'a> OracleAdapter<'a> {
    pub fn new(oracle: &'a dyn Oracle) -> Self {
        Self {
            oracle,
            batch_size: 1024,
            invocations: AtomicUsize::new(0),
            rows_queried: AtomicUsize::new(0),
        }
    }

    /// Maximum rows per oracle call; larger batches are split
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn supports_proba(&self) -> bool {
        self.oracle.supports_proba()
    }

    pub fn n_classes(&self) -> Option<usize> {
        self.oracle.n_classes()
    }

    pub fn stats(&self) -> OracleStats {
        OracleStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            rows_queried: self.rows_queried.load(Ordering::Relaxed),
        }
    }

    fn record(&self, rows: usize) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.rows_queried.fetch_add(rows, Ordering::Relaxed);
    }

    /// Predicted labels, validated against the batch size
    pub fn labels(&self, batch: &Array2<f64>) -> Result<Vec<usize>> {
        let n = batch.nrows();
        let mut out = Vec::with_capacity(n);
        let mut start = 0;
        while start < n {
            let end = (start + self.batch_size).min(n);
            let chunk = batch.slice(s![start..end, ..]).to_owned();
            self.record(chunk.nrows());
            let labels = self.oracle.predict_label(&chunk).map_err(wrap_oracle_error)?;
            if labels.len() != chunk.nrows() {
                return Err(ExplainError::OracleInvocation(format!(
                    "oracle returned {} labels for {} rows",
                    labels.len(),
                    chunk.nrows()
                )));
            }
            match self.oracle.n_classes() {
                Some(k) => {
                    if let Some(&bad) = labels.iter().find(|&&l| l >= k) {
                        return Err(ExplainError::OracleInvocation(format!(
                            "oracle returned label {} but declares {} classes",
                            bad, k
                        )));
                    }
                }
                None => {
                    if let Some(&bad) = labels.iter().find(|&&l| l >= MAX_UNDECLARED_CLASSES) {
                        return Err(ExplainError::OracleInvocation(format!(
                            "oracle returned label {} without declaring a class count (limit {})",
                            bad, MAX_UNDECLARED_CLASSES
                        )));
                    }
                }
            }
            out.extend(labels);
            start = end;
        }
        debug!(rows = n, "oracle labels queried");
        Ok(out)
    }

    /// Label of a single encoded row
    pub fn label_one(&self, row: &Array1<f64>) -> Result<usize> {
        let batch = row.clone().insert_axis(ndarray::Axis(0));
        self.labels(&batch)?
            .into_iter()
            .next()
            .ok_or_else(|| ExplainError::OracleInvocation("oracle returned no label".to_string()))
    }

    /// Class probabilities.
    ///
    /// Oracles without probability output yield a degenerate one-hot matrix.
    pub fn proba(&self, batch: &Array2<f64>) -> Result<Array2<f64>> {
        if !self.oracle.supports_proba() {
            let labels = self.labels(batch)?;
            let width = labels
                .iter()
                .map(|&l| l + 1)
                .max()
                .unwrap_or(0)
                .max(self.oracle.n_classes().unwrap_or(2));
            let mut out = Array2::zeros((labels.len(), width));
            for (i, &l) in labels.iter().enumerate() {
                out[[i, l]] = 1.0;
            }
            return Ok(out);
        }

        let n = batch.nrows();
        let mut chunks = Vec::new();
        let mut start = 0;
        let mut width: Option<usize> = None;
        while start < n {
            let end = (start + self.batch_size).min(n);
            let chunk = batch.slice(s![start..end, ..]).to_owned();
            self.record(chunk.nrows());
            let proba = self.oracle.predict_proba(&chunk).map_err(wrap_oracle_error)?;
            self.validate_proba(&proba, chunk.nrows(), width)?;
            width = Some(proba.ncols());
            chunks.push(proba);
            start = end;
        }

        let width = width.unwrap_or_else(|| self.oracle.n_classes().unwrap_or(2));
        let mut out = Array2::zeros((n, width));
        let mut row = 0;
        for chunk in chunks {
            let rows = chunk.nrows();
            out.slice_mut(s![row..row + rows, ..]).assign(&chunk);
            row += rows;
        }
        debug!(rows = n, "oracle probabilities queried");
        Ok(out)
    }

    fn validate_proba(&self, proba: &Array2<f64>, expected_rows: usize, width: Option<usize>) -> Result<()> {
        if proba.nrows() != expected_rows {
            return Err(ExplainError::OracleInvocation(format!(
                "oracle returned {} probability rows for {} rows",
                proba.nrows(),
                expected_rows
            )));
        }
        if proba.ncols() == 0 {
            return Err(ExplainError::OracleInvocation(
                "oracle returned probability rows with no classes".to_string(),
            ));
        }
        if let Some(w) = width.or(self.oracle.n_classes()) {
            if proba.ncols() != w {
                return Err(ExplainError::OracleInvocation(format!(
                    "oracle returned {} probability columns, expected {}",
                    proba.ncols(),
                    w
                )));
            }
        }
        if let Some(bad) = proba
            .iter()
            .find(|p| !p.is_finite() || **p < -PROBA_TOLERANCE || **p > 1.0 + PROBA_TOLERANCE)
        {
            return Err(ExplainError::OracleInvocation(format!(
                "oracle returned probability {} outside [0, 1]",
                bad
            )));
        }
        Ok(())
    }

    /// Reject a class index outside the oracle's declared class count.
    ///
    /// Oracles that declare no count pass; their classes are checked once scored.
    pub fn check_class(&self, name: &str, class: usize) -> Result<()> {
        match self.oracle.n_classes() {
            Some(k) if class >= k => Err(ExplainError::invalid_parameter(
                name,
                class,
                format!("oracle declares {} classes", k),
            )),
            _ => Ok(()),
        }
    }

    /// Probability of `class` for every row.
    ///
    /// Without probability support this is 1.0 where the label equals `class`.
    /// The class must then be below the declared class count or, for undeclared
    /// oracles, below `max(2, largest label + 1)`.
    pub fn class_score(&self, batch: &Array2<f64>, class: usize) -> Result<Array1<f64>> {
        if !self.oracle.supports_proba() {
            self.check_class("class", class)?;
            let labels = self.labels(batch)?;
            let known = labels
                .iter()
                .map(|&l| l + 1)
                .max()
                .unwrap_or(0)
                .max(self.oracle.n_classes().unwrap_or(2));
            if class >= known {
                return Err(ExplainError::invalid_parameter(
                    "class",
                    class,
                    format!("oracle labels only cover {} classes", known),
                ));
            }
            return Ok(labels
                .into_iter()
                .map(|l| if l == class { 1.0 } else { 0.0 })
                .collect());
        }
        let proba = self.proba(batch)?;
        if class >= proba.ncols() {
            return Err(ExplainError::invalid_parameter(
                "class",
                class,
                format!("oracle reports {} classes", proba.ncols()),
            ));
        }
        Ok(proba.column(class).to_owned())
    }

    /// Whether `label` can be flipped by complementing it
    pub fn is_binary(&self, label: usize) -> bool {
        match self.oracle.n_classes() {
            Some(k) => k == 2,
            None => label <= 1,
        }
    }
}

fn wrap_oracle_error(err: ExplainError) -> ExplainError {
    match err {
        e @ ExplainError::OracleInvocation(_) => e,
        other => ExplainError::OracleInvocation(other.to_string()),
    }
}
