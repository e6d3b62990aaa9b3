//! Access to the target cluster
//!
//! The reconcilers only talk to the cluster through [`ClusterClient`], which
//! works on untyped JSON documents addressed by [`TypeIdentity`]:
//! - **KubeCluster**: kube-rs client, types resolved through discovery
//! - **MockCluster**: in-memory store for tests, with operation counters

mod client;
mod mock;

pub use client::KubeCluster;
pub use mock::{MockCluster, OperationCounts};

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use krg_core::{ObjectKey, TypeIdentity};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::error::Result;

/// Change observed on a watched type
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Object created or modified (also emitted for every object on (re)list)
    Applied(JsonValue),
    Deleted(JsonValue),
}

impl WatchEvent {
    pub fn object(&self) -> &JsonValue {
        match self {
            WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

/// Cluster object store used by the reconcilers
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get one object, `None` when it does not exist
    async fn get(&self, identity: &TypeIdentity, key: &ObjectKey) -> Result<Option<JsonValue>>;

    /// List objects, optionally in one namespace, matching every label of `selector`
    async fn list(
        &self,
        identity: &TypeIdentity,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<JsonValue>>;

    /// Stream changes to every object of a type
    async fn watch(&self, identity: &TypeIdentity) -> Result<BoxStream<'static, Result<WatchEvent>>>;

    /// Whether objects of the type live in a namespace
    async fn is_namespaced(&self, identity: &TypeIdentity) -> Result<bool>;

    /// Create an object; fails when it already exists
    async fn create(&self, identity: &TypeIdentity, object: &JsonValue) -> Result<JsonValue>;

    /// Server-side apply of the fields in `object`
    async fn apply(
        &self,
        identity: &TypeIdentity,
        object: &JsonValue,
        field_manager: &str,
    ) -> Result<JsonValue>;

    /// Replace the status subresource
    async fn patch_status(
        &self,
        identity: &TypeIdentity,
        key: &ObjectKey,
        status: &JsonValue,
    ) -> Result<()>;

    async fn set_finalizers(
        &self,
        identity: &TypeIdentity,
        key: &ObjectKey,
        finalizers: &[String],
    ) -> Result<()>;

    /// Request deletion; succeeds when the object is already gone
    async fn delete(&self, identity: &TypeIdentity, key: &ObjectKey) -> Result<()>;

    async fn apply_crd(&self, crd: &CustomResourceDefinition, field_manager: &str) -> Result<()>;

    async fn delete_crd(&self, name: &str) -> Result<()>;
}

/// Identity of the CustomResourceDefinition type itself
pub fn crd_identity() -> TypeIdentity {
    TypeIdentity::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition")
}

/// Namespace/name of a JSON object
pub fn object_key(object: &JsonValue) -> Option<ObjectKey> {
    let metadata = object.get("metadata")?;
    let name = metadata.get("name")?.as_str()?;
    let namespace = metadata.get("namespace").and_then(JsonValue::as_str);
    Some(ObjectKey::new(namespace, name))
}

/// Labels of a JSON object
pub fn object_labels(object: &JsonValue) -> BTreeMap<String, String> {
    object
        .pointer("/metadata/labels")
        .and_then(|l| serde_json::from_value(l.clone()).ok())
        .unwrap_or_default()
}

/// Finalizers of a JSON object
pub fn object_finalizers(object: &JsonValue) -> Vec<String> {
    object
        .pointer("/metadata/finalizers")
        .and_then(|f| serde_json::from_value(f.clone()).ok())
        .unwrap_or_default()
}

pub fn is_deleting(object: &JsonValue) -> bool {
    object
        .pointer("/metadata/deletionTimestamp")
        .is_some_and(|t| !t.is_null())
}
