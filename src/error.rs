//! Error types for the Kolosal explainability engine

use thiserror::Error;

/// Result type alias for explainability operations
pub type Result<T> = std::result::Result<T, ExplainError>;

/// Main error type for the explainability engine
#[derive(Error, Debug)]
pub enum ExplainError {
    /// The oracle failed or returned output that does not match the query batch
    #[error("Oracle invocation error: {0}")]
    OracleInvocation(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Invalid parameter: {name} = {value}, {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Feature not found: {0}")]
    FeatureNotFound(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Computation error: {0}")]
    ComputationError(String),

    #[error("Model not fitted")]
    ModelNotFitted,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl ExplainError {
    /// Shorthand for an [`ExplainError::InvalidParameter`]
    pub fn invalid_parameter(
        name: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        ExplainError::InvalidParameter {
            name: name.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<polars::error::PolarsError> for ExplainError {
    fn from(err: polars::error::PolarsError) -> Self {
        ExplainError::DataError(err.to_string())
    }
}

impl From<serde_json::Error> for ExplainError {
    fn from(err: serde_json::Error) -> Self {
        ExplainError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for ExplainError {
    fn from(err: ndarray::ShapeError) -> Self {
        ExplainError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ExplainError::OracleInvocation("returned 3 labels for 4 rows".to_string());
        assert_eq!(
            err.to_string(),
            "Oracle invocation error: returned 3 labels for 4 rows"
        );
    }

    #[test]
    fn test_invalid_parameter_display() {
        let err = ExplainError::invalid_parameter("max_depth", 0, "must be at least 1");
        assert_eq!(
            err.to_string(),
            "Invalid parameter: max_depth = 0, must be at least 1"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ExplainError = io_err.into();
        assert!(matches!(err, ExplainError::IoError(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: ExplainError = json_err.into();
        assert!(matches!(err, ExplainError::SerializationError(_)));
    }
}
