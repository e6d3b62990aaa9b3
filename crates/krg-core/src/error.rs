//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid ResourceGraphDefinition: {message}")]
    InvalidDefinition { message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Errors raised while turning the shorthand type grammar into a structural schema
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("unknown type '{token}' for field '{field}'")]
    UnknownTypeToken { field: String, token: String },

    #[error("invalid marker for field '{field}': {message}")]
    InvalidMarker { field: String, message: String },

    #[error("invalid default for field '{field}': {message}")]
    InvalidDefault { field: String, message: String },

    #[error("invalid shorthand for field '{field}': {message}")]
    InvalidShorthand { field: String, message: String },

    #[error("custom type '{name}' refers to itself")]
    CyclicType { name: String },

    #[error("invalid schema: {message}")]
    InvalidSchema { message: String },

    #[error("{operation} is not supported")]
    Unsupported { operation: String },
}

/// Validation error info with context, one per offending path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrorInfo {
    /// JSON pointer of the offending value
    pub path: String,
    /// Error message
    pub message: String,
}

impl std::fmt::Display for ValidationErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
