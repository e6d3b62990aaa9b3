//! krg Core - API types shared by the graph compiler and the controller
//!
//! This crate provides the foundational types used throughout krg:
//! - `ResourceGraphDefinition`: the custom resource declaring a composite type
//! - `TypeIdentity` / `ObjectKey`: how types and objects are addressed
//! - `InstanceStatus`: the status written on every composite instance
//! - `schema`: shorthand schema synthesis, defaulting and validation

pub mod error;
pub mod identity;
pub mod rgd;
pub mod schema;
pub mod status;

pub use error::{CoreError, SchemaError, ValidationErrorInfo};
pub use identity::{InstanceKey, ObjectKey, TypeIdentity};
pub use rgd::{
    CompiledResourceState, DefinitionState, DeletionPolicy, GraphSchema, ResourceGraphDefinition,
    ResourceGraphDefinitionSpec, ResourceGraphDefinitionStatus, ResourceInformation,
    ResourceTemplate,
};
pub use schema::{SpecValidator, ValidationResult, apply_defaults, to_structural_schema};
pub use status::{Condition, InstanceState, InstanceStatus, ManagedResourceRef, Progress};
