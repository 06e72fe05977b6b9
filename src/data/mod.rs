//! Feature schema, feature vectors and background datasets
//!
//! Every explainer works on a fixed [`Schema`] shared by all instances of a
//! session. Numeric features are carried as-is; categorical features are
//! encoded as the index of their category when a row is handed to the oracle.

use crate::error::{ExplainError, Result};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Kind of a feature column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureKind {
    /// Continuous or integer-valued feature
    Numeric,
    /// Feature taking one of a fixed set of categories
    Categorical { categories: Vec<String> },
}

/// Name and kind of a single feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: String,
    pub kind: FeatureKind,
}

impl FeatureSpec {
    pub fn numeric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FeatureKind::Numeric,
        }
    }

    pub fn categorical<S: Into<String>>(
        name: impl Into<String>,
        categories: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: FeatureKind::Categorical {
                categories: categories.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self.kind, FeatureKind::Categorical { .. })
    }

    /// Encode a value of this feature to its numeric representation
    pub fn encode(&self, value: &FeatureValue) -> Result<f64> {
        match (&self.kind, value) {
            (FeatureKind::Numeric, FeatureValue::Numeric(v)) => {
                if v.is_finite() {
                    Ok(*v)
                } else {
                    Err(ExplainError::DataError(format!(
                        "feature '{}' has non-finite value {}",
                        self.name, v
                    )))
                }
            }
            (FeatureKind::Categorical { categories }, FeatureValue::Categorical(c)) => categories
                .iter()
                .position(|cat| cat == c)
                .map(|idx| idx as f64)
                .ok_or_else(|| {
                    ExplainError::SchemaMismatch(format!(
                        "unknown category '{}' for feature '{}'",
                        c, self.name
                    ))
                }),
            (FeatureKind::Numeric, FeatureValue::Categorical(c)) => {
                Err(ExplainError::SchemaMismatch(format!(
                    "feature '{}' is numeric, got category '{}'",
                    self.name, c
                )))
            }
            (FeatureKind::Categorical { .. }, FeatureValue::Numeric(v)) => {
                Err(ExplainError::SchemaMismatch(format!(
                    "feature '{}' is categorical, got number {}",
                    self.name, v
                )))
            }
        }
    }

    /// Decode a numeric representation back to a feature value.
    ///
    /// Categorical codes are rounded and clamped to the known categories.
    pub fn decode(&self, encoded: f64) -> FeatureValue {
        match &self.kind {
            FeatureKind::Numeric => FeatureValue::Numeric(encoded),
            FeatureKind::Categorical { categories } => {
                let max_idx = categories.len().saturating_sub(1) as f64;
                let idx = encoded.round().clamp(0.0, max_idx) as usize;
                FeatureValue::Categorical(categories.get(idx).cloned().unwrap_or_default())
            }
        }
    }
}

/// A single feature value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    Numeric(f64),
    Categorical(String),
}

impl FeatureValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Numeric(v) => Some(*v),
            FeatureValue::Categorical(_) => None,
        }
    }

    pub fn as_category(&self) -> Option<&str> {
        match self {
            FeatureValue::Numeric(_) => None,
            FeatureValue::Categorical(c) => Some(c.as_str()),
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Numeric(v) => write!(f, "{}", v),
            FeatureValue::Categorical(c) => write!(f, "{}", c),
        }
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Numeric(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        FeatureValue::Categorical(v.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(v: String) -> Self {
        FeatureValue::Categorical(v)
    }
}

/// Ordered mapping from feature name to value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    entries: Vec<(String, FeatureValue)>,
}

impl FeatureVector {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Builder-style insert, keeping insertion order
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FeatureValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Insert or overwrite a value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FeatureValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FeatureValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Into<String>, V: Into<FeatureValue>> FromIterator<(N, V)> for FeatureVector {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut fv = FeatureVector::new();
        for (name, value) in iter {
            fv.set(name, value);
        }
        fv
    }
}

/// Ordered feature schema shared by every row of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    features: Vec<FeatureSpec>,
}

impl Schema {
    /// Create a schema, rejecting empty or duplicate feature lists
    pub fn new(features: Vec<FeatureSpec>) -> Result<Self> {
        if features.is_empty() {
            return Err(ExplainError::SchemaMismatch(
                "schema must contain at least one feature".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for spec in &features {
            if !seen.insert(spec.name.as_str()) {
                return Err(ExplainError::SchemaMismatch(format!(
                    "duplicate feature '{}'",
                    spec.name
                )));
            }
            if let FeatureKind::Categorical { categories } = &spec.kind {
                if categories.is_empty() {
                    return Err(ExplainError::SchemaMismatch(format!(
                        "categorical feature '{}' has no categories",
                        spec.name
                    )));
                }
            }
        }
        Ok(Self { features })
    }

    /// Schema with only numeric features
    pub fn numeric<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Result<Self> {
        Self::new(names.into_iter().map(FeatureSpec::numeric).collect())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn features(&self) -> &[FeatureSpec] {
        &self.features
    }

    pub fn feature(&self, idx: usize) -> Option<&FeatureSpec> {
        self.features.get(idx)
    }

    pub fn names(&self) -> Vec<String> {
        self.features.iter().map(|f| f.name.clone()).collect()
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.features
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| ExplainError::FeatureNotFound(name.to_string()))
    }

    /// Encode a feature vector in schema order
    pub fn encode(&self, row: &FeatureVector) -> Result<Array1<f64>> {
        if row.len() != self.features.len() {
            return Err(ExplainError::SchemaMismatch(format!(
                "expected {} features, got {}",
                self.features.len(),
                row.len()
            )));
        }
        self.features
            .iter()
            .map(|spec| {
                let value = row
                    .get(&spec.name)
                    .ok_or_else(|| ExplainError::FeatureNotFound(spec.name.clone()))?;
                spec.encode(value)
            })
            .collect::<Result<Vec<f64>>>()
            .map(Array1::from_vec)
    }

    /// Decode an encoded row back into a feature vector
    pub fn decode(&self, encoded: &[f64]) -> Result<FeatureVector> {
        if encoded.len() != self.features.len() {
            return Err(ExplainError::ShapeError {
                expected: format!("{} values", self.features.len()),
                actual: format!("{} values", encoded.len()),
            });
        }
        Ok(self
            .features
            .iter()
            .zip(encoded)
            .map(|(spec, &v)| (spec.name.clone(), spec.decode(v)))
            .collect())
    }
}

/// Background / reference dataset: rows plus optional true labels
#[derive(Debug, Clone)]
pub struct Dataset {
    schema: Schema,
    rows: Vec<FeatureVector>,
    labels: Option<Vec<usize>>,
    /// Encoded rows, cached at construction
    matrix: Array2<f64>,
}

impl Dataset {
    /// Build a dataset, validating non-emptiness and schema uniformity
    pub fn new(schema: Schema, rows: Vec<FeatureVector>, labels: Option<Vec<usize>>) -> Result<Self> {
        if rows.is_empty() {
            return Err(ExplainError::InsufficientData(
                "dataset must contain at least one row".to_string(),
            ));
        }
        if let Some(ref y) = labels {
            if y.len() != rows.len() {
                return Err(ExplainError::ShapeError {
                    expected: format!("{} labels", rows.len()),
                    actual: format!("{} labels", y.len()),
                });
            }
        }

        let n_features = schema.len();
        let mut flat = Vec::with_capacity(rows.len() * n_features);
        for (i, row) in rows.iter().enumerate() {
            let encoded = schema.encode(row).map_err(|e| {
                ExplainError::SchemaMismatch(format!("row {}: {}", i, e))
            })?;
            flat.extend(encoded.iter());
        }
        let matrix = Array2::from_shape_vec((rows.len(), n_features), flat)?;

        Ok(Self {
            schema,
            rows,
            labels,
            matrix,
        })
    }

    /// Build a dataset directly from an encoded matrix
    pub fn from_matrix(schema: Schema, matrix: Array2<f64>, labels: Option<Vec<usize>>) -> Result<Self> {
        if matrix.ncols() != schema.len() {
            return Err(ExplainError::ShapeError {
                expected: format!("{} columns", schema.len()),
                actual: format!("{} columns", matrix.ncols()),
            });
        }
        let rows = matrix
            .rows()
            .into_iter()
            .map(|r| schema.decode(&r.to_vec()))
            .collect::<Result<Vec<_>>>()?;
        Self::new(schema, rows, labels)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rows(&self) -> &[FeatureVector] {
        &self.rows
    }

    pub fn labels(&self) -> Option<&[usize]> {
        self.labels.as_deref()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.schema.len()
    }

    /// Encoded rows as a matrix (n_rows × n_features)
    pub fn to_matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    /// Encode an instance against this dataset's schema
    pub fn encode_row(&self, row: &FeatureVector) -> Result<Array1<f64>> {
        self.schema.encode(row)
    }

    /// Encoded values of one column
    pub fn column(&self, idx: usize) -> Vec<f64> {
        self.matrix.column(idx).to_vec()
    }

    /// Per-feature centre: mean for numeric features, mode index for categorical ones
    pub fn feature_means(&self) -> Array1<f64> {
        let n = self.matrix.nrows() as f64;
        self.schema
            .features()
            .iter()
            .enumerate()
            .map(|(j, spec)| match &spec.kind {
                FeatureKind::Numeric => self.matrix.column(j).sum() / n,
                FeatureKind::Categorical { categories } => {
                    let mut counts = vec![0usize; categories.len()];
                    for &v in self.matrix.column(j) {
                        counts[v as usize] += 1;
                    }
                    // Lowest index wins ties
                    let mut best = 0;
                    for (k, &c) in counts.iter().enumerate() {
                        if c > counts[best] {
                            best = k;
                        }
                    }
                    best as f64
                }
            })
            .collect()
    }

    /// Per-feature population standard deviation of the encoded values
    pub fn feature_stds(&self) -> Array1<f64> {
        let n = self.matrix.nrows() as f64;
        (0..self.n_features())
            .map(|j| {
                let col = self.matrix.column(j);
                let mean = col.sum() / n;
                (col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
            })
            .collect()
    }

    /// Split into (first `at` rows, remaining rows)
    pub fn split_at(&self, at: usize) -> Result<(Dataset, Dataset)> {
        if at == 0 || at >= self.len() {
            return Err(ExplainError::InsufficientData(format!(
                "cannot split {} rows at {}",
                self.len(),
                at
            )));
        }
        let (left_rows, right_rows) = self.rows.split_at(at);
        let (left_labels, right_labels) = match &self.labels {
            Some(y) => {
                let (l, r) = y.split_at(at);
                (Some(l.to_vec()), Some(r.to_vec()))
            }
            None => (None, None),
        };
        Ok((
            Dataset::new(self.schema.clone(), left_rows.to_vec(), left_labels)?,
            Dataset::new(self.schema.clone(), right_rows.to_vec(), right_labels)?,
        ))
    }
}
