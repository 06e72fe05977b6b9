//! Loading background and evaluation datasets through polars

use crate::data::{Dataset, FeatureSpec, Schema};
use crate::error::{ExplainError, Result};
use ndarray::Array2;
use polars::prelude::*;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// Converts polars frames into [`Dataset`]s.
///
/// String columns become categorical features with sorted categories; every
/// other column is cast to `Float64`. Nulls are rejected.
#[derive(Debug, Clone, Default)]
pub struct DatasetLoader {
    /// Column holding the true class labels
    label_column: Option<String>,
    /// Restrict features to these columns, in this order
    feature_columns: Option<Vec<String>>,
}

impl DatasetLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_column(mut self, name: impl Into<String>) -> Self {
        self.label_column = Some(name.into());
        self
    }

    pub fn with_feature_columns<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.feature_columns = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Read a CSV file with a header row
    pub fn load_csv(&self, path: impl AsRef<Path>) -> Result<Dataset> {
        let file = File::open(path.as_ref())?;
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(100))
            .into_reader_with_file_handle(file)
            .finish()?;
        debug!(
            path = %path.as_ref().display(),
            rows = df.height(),
            cols = df.width(),
            "csv loaded"
        );
        self.from_dataframe(&df)
    }

    pub fn from_dataframe(&self, df: &DataFrame) -> Result<Dataset> {
        let feature_names: Vec<String> = match &self.feature_columns {
            Some(names) => names.clone(),
            None => df
                .get_column_names()
                .into_iter()
                .map(|n| n.to_string())
                .filter(|n| Some(n) != self.label_column.as_ref())
                .collect(),
        };
        if feature_names.is_empty() {
            return Err(ExplainError::DataError("no feature columns".to_string()));
        }

        let n_rows = df.height();
        let mut specs = Vec::with_capacity(feature_names.len());
        let mut col_data: Vec<Vec<f64>> = Vec::with_capacity(feature_names.len());
        for name in &feature_names {
            let column = df
                .column(name)
                .map_err(|_| ExplainError::FeatureNotFound(name.clone()))?;
            if column.null_count() > 0 {
                return Err(ExplainError::DataError(format!(
                    "column '{}' contains {} null values",
                    name,
                    column.null_count()
                )));
            }
            let (spec, values) = if matches!(column.dtype(), DataType::String) {
                categorical_column(name, column)?
            } else {
                (FeatureSpec::numeric(name.as_str()), numeric_column(name, column)?)
            };
            specs.push(spec);
            col_data.push(values);
        }

        let labels = match &self.label_column {
            Some(name) => Some(label_column(df, name)?),
            None => None,
        };

        let schema = Schema::new(specs)?;
        let matrix = Array2::from_shape_fn((n_rows, col_data.len()), |(r, c)| col_data[c][r]);
        Dataset::from_matrix(schema, matrix, labels)
    }
}

fn numeric_column(name: &str, column: &Column) -> Result<Vec<f64>> {
    let cast = column.cast(&DataType::Float64)?;
    let values: Vec<f64> = cast.f64()?.into_iter().flatten().collect();
    if values.len() != column.len() {
        return Err(ExplainError::DataError(format!(
            "column '{}' has values that cannot be read as numbers",
            name
        )));
    }
    Ok(values)
}

fn categorical_column(name: &str, column: &Column) -> Result<(FeatureSpec, Vec<f64>)> {
    let values: Vec<&str> = column.str()?.into_iter().flatten().collect();
    let categories: Vec<String> = values
        .iter()
        .map(|v| v.to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let codes = values
        .iter()
        .map(|v| categories.iter().position(|c| c == v).unwrap_or(0) as f64)
        .collect();
    Ok((FeatureSpec::categorical(name, categories), codes))
}

fn label_column(df: &DataFrame, name: &str) -> Result<Vec<usize>> {
    let column = df
        .column(name)
        .map_err(|_| ExplainError::FeatureNotFound(name.to_string()))?;
    if column.null_count() > 0 {
        return Err(ExplainError::DataError(format!(
            "label column '{}' contains null values",
            name
        )));
    }
    numeric_column(name, column)?
        .into_iter()
        .map(|v| {
            if v >= 0.0 && v.fract() == 0.0 {
                Ok(v as usize)
            } else {
                Err(ExplainError::DataError(format!(
                    "label column '{}' has non-class value {}",
                    name, v
                )))
            }
        })
        .collect()
}
