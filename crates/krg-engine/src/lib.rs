//! krg Engine - compiles ResourceGraphDefinitions into executable graphs
//!
//! This crate turns the declarative RGD into a `CompiledGraph`:
//! - `${...}` expression extraction and rendering
//! - Dependency DAG with cycle detection and a stable topological order
//! - Status schema, emulated instance and CRD synthesis
//! - Human-readable compile errors with "did you mean" suggestions

pub mod builder;
pub mod crd;
pub mod dag;
pub mod emulator;
pub mod error;
pub mod expression;
pub mod graph;
pub mod suggestions;

pub use builder::{GraphBuilder, CRD_OWNER_LABEL};
pub use error::{CompileError, ExpressionError};
pub use expression::{
    evaluate_condition, extract_fields, extract_references, render, Bindings, FieldDescriptor,
    FieldPath, PathSegment, Reference,
};
pub use graph::{CompiledGraph, Node};
