//! CLI error types with exit code handling
//!
//! This module provides a unified error type for CLI operations that
//! maps errors to appropriate exit codes.

use krg_core::CoreError;
use krg_engine::CompileError;
use krg_kube::ControllerError;
use miette::Diagnostic;
use thiserror::Error;

use crate::exit_codes;

/// CLI-specific error type that includes exit code information
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// The file does not hold a usable ResourceGraphDefinition
    #[error("Invalid definition: {message}")]
    #[diagnostic(code(krg::cli::definition))]
    Definition {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// The definition does not compile
    #[error(transparent)]
    #[diagnostic(transparent)]
    Compile(#[from] CompileError),

    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(krg::cli::config))]
    Config { message: String },

    /// IO error (file not found, permissions, etc.)
    #[error("IO error: {message}")]
    #[diagnostic(code(krg::cli::io))]
    Io { message: String },

    /// The controller could not start or stopped with an error
    #[error("Controller error: {message}")]
    #[diagnostic(code(krg::cli::controller))]
    Controller { message: String },

    /// Internal error (runtime, unexpected failure)
    #[error("Internal error: {message}")]
    #[diagnostic(code(krg::cli::internal))]
    Internal { message: String },
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Definition { .. } => exit_codes::DEFINITION_ERROR,
            CliError::Compile(_) => exit_codes::COMPILE_ERROR,
            CliError::Config { .. } => exit_codes::CONFIG_ERROR,
            CliError::Io { .. } => exit_codes::IO_ERROR,
            CliError::Controller { .. } | CliError::Internal { .. } => exit_codes::ERROR,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a definition error with help text
    pub fn definition_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Definition {
            message: message.into(),
            help: Some(help.into()),
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io {
            message: err.to_string(),
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Io(e) => e.into(),
            CoreError::Schema(e) => CompileError::Schema(e).into(),
            e @ (CoreError::YamlParse(_) | CoreError::JsonParse(_)) => CliError::Definition {
                message: e.to_string(),
                help: Some("the file must contain a single ResourceGraphDefinition document".into()),
            },
            other => CliError::Definition {
                message: other.to_string(),
                help: None,
            },
        }
    }
}

impl From<ControllerError> for CliError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::InvalidConfig(message) => CliError::Config { message },
            ControllerError::Io(e) => e.into(),
            ControllerError::Serialization(message) => CliError::Config { message },
            other => CliError::Controller {
                message: other.to_string(),
            },
        }
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
