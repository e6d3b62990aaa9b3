//! The ResourceGraphDefinition custom resource
//!
//! An RGD declares a new composite type (its shorthand schema) and the
//! templates of the resources every instance of that type is made of.
//!
//! ```yaml
//! apiVersion: krg.dev/v1alpha1
//! kind: ResourceGraphDefinition
//! metadata:
//!   name: webapp
//! spec:
//!   schema:
//!     apiVersion: v1alpha1
//!     kind: WebApp
//!     spec:
//!       name: string | required=true
//!       replicas: integer | default=3
//!     status:
//!       availableReplicas: ${deployment.status.availableReplicas}
//!   resources:
//!     - id: deployment
//!       template:
//!         apiVersion: apps/v1
//!         kind: Deployment
//!         metadata:
//!           name: ${schema.spec.name}
//!         spec:
//!           replicas: ${schema.spec.replicas}
//! ```

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{CoreError, Result};
use crate::identity::TypeIdentity;
use crate::status::Condition;

/// API group of the RGD type itself and default group of generated types
pub const GROUP: &str = "krg.dev";

/// API version of the RGD type
pub const VERSION: &str = "v1alpha1";

/// Identifier reserved for references into the instance itself
pub const SCHEMA_ROOT: &str = "schema";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "krg.dev",
    version = "v1alpha1",
    kind = "ResourceGraphDefinition",
    plural = "resourcegraphdefinitions",
    shortname = "rgd",
    status = "ResourceGraphDefinitionStatus",
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.schema.kind"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGraphDefinitionSpec {
    /// Shape of the generated composite type
    pub schema: GraphSchema,

    /// Resource templates, in declaration order
    #[serde(default)]
    pub resources: Vec<ResourceTemplate>,

    /// Whether the generated CRD goes away with the RGD
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
}

/// Declared shape of the composite type
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GraphSchema {
    /// Version of the generated type, e.g. `v1alpha1`
    pub api_version: String,

    /// Kind of the generated type, e.g. `WebApp`
    pub kind: String,

    #[serde(default = "default_group")]
    pub group: String,

    /// Shorthand spec description (field -> type token or nested map)
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub spec: BTreeMap<String, JsonValue>,

    /// Status fields (field -> expression or nested map)
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub status: BTreeMap<String, JsonValue>,

    /// Reusable named types usable from `spec`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub types: BTreeMap<String, JsonValue>,
}

fn default_group() -> String {
    GROUP.to_string()
}

impl GraphSchema {
    /// Identity of the generated composite type
    pub fn identity(&self) -> TypeIdentity {
        TypeIdentity::new(&self.group, &self.api_version, &self.kind)
    }
}

/// One named resource template
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    /// Identifier other templates use to reference this resource
    pub id: String,

    /// The object to create, with embedded `${...}` expressions
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub template: JsonValue,

    /// Expressions that must all be true before dependents proceed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready_when: Vec<String>,

    /// Expressions that must all be true for the resource to exist
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_when: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// Keep the generated CRD (and every instance) when the RGD is deleted
    Retain,
    /// Delete the generated CRD when the RGD is deleted
    Delete,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGraphDefinitionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DefinitionState>,

    /// Resource ids in the order instances materialize them
    #[serde(default)]
    pub topological_order: Vec<String>,

    /// Compiled state of each resource
    #[serde(default)]
    pub resources: Vec<ResourceInformation>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Lifecycle state of an RGD as seen by the controller
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum DefinitionState {
    /// Not (or no longer) handled by the controller
    Unmanaged,
    /// Compiled, CRD installed and instance controller running
    Managing,
    /// Compilation or installation failed
    Error,
}

/// Per-resource compiled state published on the RGD
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInformation {
    pub id: String,
    pub state: CompiledResourceState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum CompiledResourceState {
    Pending,
    Resolved,
    Error,
}

impl ResourceGraphDefinition {
    /// Load an RGD from a YAML or JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse an RGD from a YAML (or JSON) string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rgd: Self = serde_yaml::from_str(yaml)?;
        if rgd.metadata.name.as_deref().unwrap_or("").is_empty() {
            return Err(CoreError::InvalidDefinition {
                message: "metadata.name is required".to_string(),
            });
        }
        Ok(rgd)
    }

    /// Name of the RGD (empty if unset)
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    /// Generation, 0 when the object has not been persisted yet
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|x| x == finalizer))
            .unwrap_or(false)
    }
}

/// Schema for fields holding arbitrary documents
fn preserve_unknown_fields(_: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut obj = schemars::schema::SchemaObject::default();
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        JsonValue::Bool(true),
    );
    schemars::schema::Schema::Object(obj)
}
