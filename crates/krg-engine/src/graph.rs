//! The compiled, immutable form of a ResourceGraphDefinition

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, JSONSchemaProps,
};
use krg_core::{SpecValidator, TypeIdentity};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;

use crate::error::ExpressionError;
use crate::expression::{render, render_string, Bindings, FieldDescriptor};

/// One resource template of the graph
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    /// Position in declaration order
    pub index: usize,
    /// Type of the objects this node materializes
    pub identity: TypeIdentity,
    pub template: JsonValue,
    /// Indices of the nodes this one references
    pub dependencies: BTreeSet<usize>,
    /// Expression-bearing fields of the template
    pub fields: Vec<FieldDescriptor>,
    pub ready_when: Vec<String>,
    pub include_when: Vec<String>,
}

impl Node {
    /// Render the template against the values gathered so far
    pub fn render(&self, bindings: &Bindings) -> Result<JsonValue, ExpressionError> {
        render(&self.template, bindings)
    }

    pub fn is_conditional(&self) -> bool {
        !self.include_when.is_empty()
    }
}

/// Everything needed to serve one composite type
///
/// Built once per RGD generation and shared behind an `Arc`; a new
/// generation produces a new graph instead of mutating this one.
#[derive(Debug)]
pub struct CompiledGraph {
    /// Name of the owning RGD
    pub name: String,
    pub generation: i64,
    pub identity: TypeIdentity,
    pub spec_schema: JSONSchemaProps,
    pub status_schema: JSONSchemaProps,
    pub crd: CustomResourceDefinition,
    /// Static preview of an instance; never read on the reconcile path
    pub emulated: JsonValue,
    /// Nodes in declaration order
    pub nodes: Vec<Node>,
    /// Node indices in topological order
    pub order: Vec<usize>,
    pub status_fields: Vec<FieldDescriptor>,
    /// sha256 of the RGD spec
    pub fingerprint: String,
    pub validator: SpecValidator,
}

impl CompiledGraph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Nodes in the order instances materialize them
    pub fn ordered_nodes(&self) -> impl DoubleEndedIterator<Item = &Node> + '_ {
        self.order.iter().map(move |&i| &self.nodes[i])
    }

    pub fn topological_ids(&self) -> Vec<String> {
        self.ordered_nodes().map(|n| n.id.clone()).collect()
    }

    pub fn dependency_ids(&self, node: &Node) -> Vec<String> {
        node.dependencies
            .iter()
            .map(|&i| self.nodes[i].id.clone())
            .collect()
    }

    /// Short fingerprint for log lines
    pub fn short_fingerprint(&self) -> &str {
        &self.fingerprint[..self.fingerprint.len().min(12)]
    }

    /// User-declared status fields that can be computed from `bindings`
    ///
    /// Fields whose references are not available yet are left out.
    pub fn render_status(
        &self,
        bindings: &Bindings,
    ) -> Result<serde_json::Map<String, JsonValue>, ExpressionError> {
        let mut status = JsonValue::Object(Default::default());
        for field in &self.status_fields {
            match render_string(&field.source, bindings) {
                Ok(value) => field.location.set(&mut status, value),
                Err(e) if e.is_unresolved() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(match status {
            JsonValue::Object(map) => map,
            _ => Default::default(),
        })
    }
}
