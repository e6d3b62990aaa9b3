//! Compile and expression errors

use krg_core::SchemaError;
use miette::Diagnostic;
use thiserror::Error;

use crate::expression::Reference;

/// Errors raised while resolving `${...}` expressions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    /// No binding for the target, or the bound document lacks the path
    #[error("unresolved reference ${{{reference}}}")]
    Unresolved { reference: Reference },

    /// A non-scalar value was interpolated into a string
    #[error("type mismatch in ${{{expression}}}: {message}")]
    TypeMismatch { expression: String, message: String },

    #[error("invalid expression '{expression}': {message}")]
    Syntax { expression: String, message: String },
}

impl ExpressionError {
    /// Whether the error only means "not available yet"
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved { .. })
    }
}

/// Deterministic compilation failures of a ResourceGraphDefinition
///
/// None of these are retried: the definition itself has to change.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq)]
pub enum CompileError {
    #[error("invalid schema: {0}")]
    #[diagnostic(code(krg::compile::schema))]
    Schema(#[from] SchemaError),

    #[error("resource '{resource}' references undeclared resource '{target}'")]
    #[diagnostic(code(krg::compile::undeclared_reference))]
    UndeclaredReference {
        resource: String,
        target: String,
        #[help]
        suggestion: Option<String>,
    },

    #[error("resource '{resource}' references unknown schema field '{path}'")]
    #[diagnostic(code(krg::compile::unknown_schema_field))]
    UnknownSchemaField {
        resource: String,
        path: String,
        #[help]
        suggestion: Option<String>,
    },

    #[error("dependency cycle detected: {}", format_cycle(members))]
    #[diagnostic(
        code(krg::compile::cycle),
        help("break the cycle by removing one of the references between these resources")
    )]
    Cycle { members: Vec<String> },

    #[error("invalid resource id '{id}': {message}")]
    #[diagnostic(code(krg::compile::resource_id))]
    InvalidResourceId { id: String, message: String },

    #[error("resource id '{id}' is declared more than once")]
    #[diagnostic(code(krg::compile::duplicate_id))]
    DuplicateResourceId { id: String },

    #[error("invalid template for resource '{resource}': {message}")]
    #[diagnostic(code(krg::compile::template))]
    InvalidTemplate { resource: String, message: String },

    #[error("invalid status field '{field}': {message}")]
    #[diagnostic(code(krg::compile::status_field))]
    InvalidStatusField { field: String, message: String },

    #[error("resource '{resource}': {source}")]
    #[diagnostic(code(krg::compile::expression))]
    Expression {
        resource: String,
        source: ExpressionError,
    },
}

impl CompileError {
    /// Resource the error is about, if it concerns a single one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Self::UndeclaredReference { resource, .. }
            | Self::UnknownSchemaField { resource, .. }
            | Self::InvalidTemplate { resource, .. }
            | Self::Expression { resource, .. } => Some(resource),
            Self::InvalidResourceId { id, .. } | Self::DuplicateResourceId { id } => Some(id),
            _ => None,
        }
    }
}

/// `a -> b -> c -> a`
fn format_cycle(members: &[String]) -> String {
    let mut parts: Vec<&str> = members.iter().map(String::as_str).collect();
    if let Some(first) = members.first() {
        parts.push(first);
    }
    parts.join(" -> ")
}

pub type Result<T> = std::result::Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display() {
        let err = CompileError::Cycle {
            members: vec!["a".into(), "b".into(), "c".into()],
        };
        insta::assert_snapshot!(err.to_string(), @"dependency cycle detected: a -> b -> c -> a");
    }

    #[test]
    fn test_resource_of_error() {
        let err = CompileError::UndeclaredReference {
            resource: "service".into(),
            target: "ghost".into(),
            suggestion: None,
        };
        assert_eq!(err.resource(), Some("service"));
        assert!(err.to_string().contains("ghost"));
        assert_eq!(CompileError::Cycle { members: vec![] }.resource(), None);
    }
}
