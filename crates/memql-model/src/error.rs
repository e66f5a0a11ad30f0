//! Errors raised while building or evaluating a model descriptor

use memql_sql::Value;
use thiserror::Error;

use crate::family::{ModelType, Operation};

#[derive(Debug, Error)]
pub enum ModelError {
    /// Missing or malformed attribute, or an unknown model type.
    #[error("Invalid attributes for {model_type}: {message}")]
    Validation { model_type: String, message: String },

    #[error("Length mismatch for {what}: expected {expected}, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Method '{operation}' is not available for model type '{model_type}'")]
    UnsupportedOperation {
        model_type: ModelType,
        operation: Operation,
    },

    #[error("Feature index {index} is out of range for {width} input columns")]
    Index { index: usize, width: usize },

    #[error("Value '{value}' cannot be read as a number")]
    InvalidValue { value: Value },

    #[error("Rotation failed: {0}")]
    Rotation(String),
}

impl ModelError {
    pub(crate) fn validation(model_type: impl Into<String>, message: impl Into<String>) -> Self {
        ModelError::Validation {
            model_type: model_type.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
