//! Error types for krg-kube

use krg_engine::{CompileError, ExpressionError};
use thiserror::Error;

/// Result type for krg-kube operations
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Errors raised while talking to the cluster or reconciling objects
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    /// The API server rejected the object; retrying the same document will not help
    #[error("{kind} '{name}' rejected: {message}")]
    Invalid {
        kind: String,
        name: String,
        message: String,
    },

    /// The API server could not be reached or answered with a server error
    #[error("API server unavailable: {0}")]
    Unavailable(String),

    /// No API resource serves this type (yet)
    #[error("unknown resource type {0}")]
    UnknownType(String),

    #[error("watch failed: {0}")]
    Watch(String),

    /// A template could not be rendered against the live sibling values
    #[error("failed to render resource '{node}': {source}")]
    Render {
        node: String,
        #[source]
        source: ExpressionError,
    },

    /// The instance spec does not match the synthesized schema
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Deleting a managed resource failed; the finalizer stays
    #[error("cleanup of {resource} failed: {message}")]
    Cleanup { resource: String, message: String },

    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ControllerError {
    fn from(e: serde_json::Error) -> Self {
        ControllerError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for ControllerError {
    fn from(e: serde_yaml::Error) -> Self {
        ControllerError::Serialization(e.to_string())
    }
}

impl ControllerError {
    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        match self {
            ControllerError::NotFound { .. } => true,
            ControllerError::Api(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Check if no API resource serves the type
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, ControllerError::UnknownType(_))
    }

    /// Check if this is a conflict error (409)
    pub fn is_conflict(&self) -> bool {
        match self {
            ControllerError::AlreadyExists { .. } => true,
            ControllerError::Api(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Whether retrying the same work later may succeed
    ///
    /// Permanent failures wait for the object itself to change.
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Api(kube::Error::Api(resp)) => {
                resp.code >= 500 || resp.code == 429 || resp.code == 409 || resp.code == 404
            }
            ControllerError::Api(_) => true,
            ControllerError::Invalid { .. }
            | ControllerError::InvalidSpec(_)
            | ControllerError::Compile(_)
            | ControllerError::InvalidConfig(_)
            | ControllerError::Serialization(_) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> ControllerError {
        ControllerError::Api(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: "Test".into(),
            code,
        }))
    }

    #[test]
    fn test_status_code_classification() {
        assert!(api_error(404).is_not_found());
        assert!(api_error(409).is_conflict());
        assert!(api_error(503).is_transient());
        assert!(!api_error(422).is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(!ControllerError::InvalidSpec("name is required".into()).is_transient());
        assert!(
            !ControllerError::Invalid {
                kind: "Deployment".into(),
                name: "web".into(),
                message: "bad".into(),
            }
            .is_transient()
        );
        assert!(
            ControllerError::Cleanup {
                resource: "Deployment/web".into(),
                message: "timeout".into(),
            }
            .is_transient()
        );
        assert!(ControllerError::Unavailable("connection refused".into()).is_transient());
    }
}
