//! In-memory cluster for testing
//!
//! Stores objects as JSON, assigns uids, resource versions and generations,
//! and honours finalizers the way the API server does: deleting an object
//! that still carries finalizers only marks it with a deletion timestamp.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use krg_core::rgd::GROUP;
use krg_core::{ObjectKey, TypeIdentity};
use serde_json::{Value as JsonValue, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use super::{ClusterClient, WatchEvent, crd_identity, object_finalizers, object_key};
use crate::diff;
use crate::error::{ControllerError, Result};
use crate::labels;

type StoreKey = (TypeIdentity, ObjectKey);

/// In-memory cluster for testing
#[derive(Clone)]
pub struct MockCluster {
    /// Storage: (type, namespace/name) -> object
    store: Arc<RwLock<BTreeMap<StoreKey, JsonValue>>>,
    /// Track operation counts for assertions
    operations: Arc<RwLock<OperationCounts>>,
    /// Deletion requests, in the order they were made
    deletions: Arc<RwLock<Vec<StoreKey>>>,
    /// (group, kind) of the cluster-scoped types
    cluster_scoped: Arc<RwLock<BTreeSet<(String, String)>>>,
    /// (group, kind) of the types the cluster does not serve
    unknown: Arc<RwLock<BTreeSet<(String, String)>>>,
    events: broadcast::Sender<(TypeIdentity, WatchEvent)>,
    next_uid: Arc<RwLock<u64>>,
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub lists: usize,
    pub watches: usize,
    pub creates: usize,
    pub applies: usize,
    pub status_patches: usize,
    pub deletes: usize,
}

impl OperationCounts {
    /// Number of operations that changed something
    pub fn writes(&self) -> usize {
        self.creates + self.applies + self.status_patches + self.deletes
    }
}

impl MockCluster {
    /// Create a new empty mock cluster
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        let cluster_scoped = BTreeSet::from([
            ("".to_string(), "Namespace".to_string()),
            ("".to_string(), "PersistentVolume".to_string()),
            ("rbac.authorization.k8s.io".to_string(), "ClusterRole".to_string()),
            (
                "apiextensions.k8s.io".to_string(),
                "CustomResourceDefinition".to_string(),
            ),
            (GROUP.to_string(), "ResourceGraphDefinition".to_string()),
        ]);
        Self {
            store: Arc::new(RwLock::new(BTreeMap::new())),
            operations: Arc::new(RwLock::new(OperationCounts::default())),
            deletions: Arc::new(RwLock::new(Vec::new())),
            cluster_scoped: Arc::new(RwLock::new(cluster_scoped)),
            unknown: Arc::new(RwLock::new(BTreeSet::new())),
            events,
            next_uid: Arc::new(RwLock::new(0)),
        }
    }

    /// Declare an additional cluster-scoped type
    pub fn with_cluster_scoped(self, group: &str, kind: &str) -> Self {
        self.cluster_scoped
            .write()
            .unwrap()
            .insert((group.to_string(), kind.to_string()));
        self
    }

    /// Stop serving a type: every call on it fails with `UnknownType`
    pub fn with_unknown_type(self, group: &str, kind: &str) -> Self {
        self.unknown
            .write()
            .unwrap()
            .insert((group.to_string(), kind.to_string()));
        self
    }

    /// Get operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        self.operations.read().unwrap().clone()
    }

    /// Reset operation counts
    pub fn reset_counts(&self) {
        *self.operations.write().unwrap() = OperationCounts::default();
    }

    /// Store an object without counting an operation
    pub fn insert(&self, identity: &TypeIdentity, object: JsonValue) {
        let _ = self.write(identity, object, false);
    }

    /// Current state of one object (for testing)
    pub fn object(&self, identity: &TypeIdentity, key: &ObjectKey) -> Option<JsonValue> {
        let key = self.normalize(identity, key);
        self.store
            .read()
            .unwrap()
            .get(&(identity.clone(), key))
            .cloned()
    }

    /// All objects of one type (for testing)
    pub fn objects(&self, identity: &TypeIdentity) -> Vec<JsonValue> {
        self.store
            .read()
            .unwrap()
            .iter()
            .filter(|((t, _), _)| same_type(t, identity))
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// Count stored objects
    pub fn object_count(&self) -> usize {
        self.store.read().unwrap().len()
    }

    /// Kinds and keys of the deletion requests, in order
    pub fn deletions(&self) -> Vec<(String, ObjectKey)> {
        self.deletions
            .read()
            .unwrap()
            .iter()
            .map(|(t, k)| (t.kind.clone(), k.clone()))
            .collect()
    }

    fn count(&self, f: impl FnOnce(&mut OperationCounts)) {
        f(&mut self.operations.write().unwrap());
    }

    fn scoped(&self, identity: &TypeIdentity) -> bool {
        !self
            .cluster_scoped
            .read()
            .unwrap()
            .contains(&(identity.group.clone(), identity.kind.clone()))
    }

    fn served(&self, identity: &TypeIdentity) -> Result<()> {
        let unknown = self
            .unknown
            .read()
            .unwrap()
            .contains(&(identity.group.clone(), identity.kind.clone()));
        if unknown {
            return Err(ControllerError::UnknownType(identity.to_string()));
        }
        Ok(())
    }

    fn normalize(&self, identity: &TypeIdentity, key: &ObjectKey) -> ObjectKey {
        if self.scoped(identity) {
            ObjectKey::new(Some(key.namespace.as_deref().unwrap_or("default")), &key.name)
        } else {
            ObjectKey::cluster(&key.name)
        }
    }

    fn emit(&self, identity: &TypeIdentity, event: WatchEvent) {
        // No receivers is fine
        let _ = self.events.send((identity.clone(), event));
    }

    /// Insert or replace an object, filling in server-managed metadata
    fn write(&self, identity: &TypeIdentity, mut object: JsonValue, bump: bool) -> Result<JsonValue> {
        let key = object_key(&object).ok_or_else(|| ControllerError::Invalid {
            kind: identity.kind.clone(),
            name: String::new(),
            message: "metadata.name is required".to_string(),
        })?;
        let key = self.normalize(identity, &key);

        let previous = self.object(identity, &key);
        let uid = match previous.as_ref().and_then(|p| p.pointer("/metadata/uid")) {
            Some(uid) => uid.clone(),
            None => {
                let mut next = self.next_uid.write().unwrap();
                *next += 1;
                JsonValue::String(format!("uid-{}", next))
            }
        };
        let version = previous
            .as_ref()
            .and_then(|p| p.pointer("/metadata/resourceVersion"))
            .and_then(JsonValue::as_str)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let generation = match &previous {
            Some(p) => {
                let current = p.pointer("/metadata/generation").and_then(JsonValue::as_i64);
                let spec_changed = p.get("spec") != object.get("spec");
                current.unwrap_or(1) + i64::from(bump && spec_changed)
            }
            None => 1,
        };

        object["apiVersion"] = json!(identity.api_version());
        object["kind"] = json!(identity.kind);
        let metadata = &mut object["metadata"];
        metadata["uid"] = uid;
        metadata["resourceVersion"] = json!(version.to_string());
        metadata["generation"] = json!(generation);
        match &key.namespace {
            Some(ns) => metadata["namespace"] = json!(ns),
            None => {
                if let Some(m) = metadata.as_object_mut() {
                    m.remove("namespace");
                }
            }
        }
        if metadata.get("creationTimestamp").is_none() {
            metadata["creationTimestamp"] = json!("2024-01-01T00:00:00Z");
        }

        self.store
            .write()
            .unwrap()
            .insert((identity.clone(), key), object.clone());
        self.emit(identity, WatchEvent::Applied(object.clone()));
        Ok(object)
    }

    fn remove(&self, identity: &TypeIdentity, key: &ObjectKey) {
        let removed = self
            .store
            .write()
            .unwrap()
            .remove(&(identity.clone(), key.clone()));
        if let Some(object) = removed {
            self.emit(identity, WatchEvent::Deleted(object));
        }
    }

    fn not_found(identity: &TypeIdentity, key: &ObjectKey) -> ControllerError {
        ControllerError::NotFound {
            kind: identity.kind.clone(),
            name: key.to_string(),
        }
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn same_type(a: &TypeIdentity, b: &TypeIdentity) -> bool {
    a.group == b.group && a.kind == b.kind
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn get(&self, identity: &TypeIdentity, key: &ObjectKey) -> Result<Option<JsonValue>> {
        self.served(identity)?;
        self.count(|ops| ops.gets += 1);
        Ok(self.object(identity, key))
    }

    async fn list(
        &self,
        identity: &TypeIdentity,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<JsonValue>> {
        self.served(identity)?;
        self.count(|ops| ops.lists += 1);
        let store = self.store.read().unwrap();
        Ok(store
            .iter()
            .filter(|((t, k), _)| {
                same_type(t, identity)
                    && namespace.is_none_or(|ns| k.namespace.as_deref() == Some(ns))
            })
            .map(|(_, o)| o)
            .filter(|o| labels::matches(&super::object_labels(o), selector))
            .cloned()
            .collect())
    }

    async fn watch(&self, identity: &TypeIdentity) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        self.served(identity)?;
        self.count(|ops| ops.watches += 1);
        let receiver = self.events.subscribe();
        let existing: Vec<Result<WatchEvent>> = self
            .objects(identity)
            .into_iter()
            .map(|o| Ok(WatchEvent::Applied(o)))
            .collect();

        let identity = identity.clone();
        let live = stream::unfold(receiver, move |mut receiver| {
            let identity = identity.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok((t, event)) if same_type(&t, &identity) => {
                            return Some((Ok(event), receiver));
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::iter(existing).chain(live).boxed())
    }

    async fn is_namespaced(&self, identity: &TypeIdentity) -> Result<bool> {
        self.served(identity)?;
        Ok(self.scoped(identity))
    }

    async fn create(&self, identity: &TypeIdentity, object: &JsonValue) -> Result<JsonValue> {
        self.served(identity)?;
        self.count(|ops| ops.creates += 1);
        let key = object_key(object).ok_or_else(|| ControllerError::Invalid {
            kind: identity.kind.clone(),
            name: String::new(),
            message: "metadata.name is required".to_string(),
        })?;
        if self.object(identity, &key).is_some() {
            return Err(ControllerError::AlreadyExists {
                kind: identity.kind.clone(),
                name: key.to_string(),
            });
        }

        // The status subresource is never set on create
        let mut object = object.clone();
        if let Some(o) = object.as_object_mut() {
            o.remove("status");
        }
        self.write(identity, object, true)
    }

    async fn apply(
        &self,
        identity: &TypeIdentity,
        object: &JsonValue,
        _field_manager: &str,
    ) -> Result<JsonValue> {
        self.served(identity)?;
        self.count(|ops| ops.applies += 1);
        let key = object_key(object).ok_or_else(|| ControllerError::Invalid {
            kind: identity.kind.clone(),
            name: String::new(),
            message: "metadata.name is required".to_string(),
        })?;

        let mut patch = object.clone();
        if let Some(o) = patch.as_object_mut() {
            o.remove("status");
        }
        let merged = match self.object(identity, &key) {
            Some(live) => {
                let mut merged = live.clone();
                diff::merge(&mut merged, &patch);
                // A no-op apply changes nothing and emits no event
                if merged == live {
                    return Ok(live);
                }
                merged
            }
            None => patch,
        };
        self.write(identity, merged, true)
    }

    async fn patch_status(
        &self,
        identity: &TypeIdentity,
        key: &ObjectKey,
        status: &JsonValue,
    ) -> Result<()> {
        self.count(|ops| ops.status_patches += 1);
        let mut object = self
            .object(identity, key)
            .ok_or_else(|| Self::not_found(identity, key))?;
        object["status"] = status.clone();
        self.write(identity, object, false)?;
        Ok(())
    }

    async fn set_finalizers(
        &self,
        identity: &TypeIdentity,
        key: &ObjectKey,
        finalizers: &[String],
    ) -> Result<()> {
        self.count(|ops| ops.applies += 1);
        let key = self.normalize(identity, key);
        let mut object = self
            .object(identity, &key)
            .ok_or_else(|| Self::not_found(identity, &key))?;

        if finalizers.is_empty() && super::is_deleting(&object) {
            self.remove(identity, &key);
            return Ok(());
        }
        object["metadata"]["finalizers"] = json!(finalizers);
        self.write(identity, object, false)?;
        Ok(())
    }

    async fn delete(&self, identity: &TypeIdentity, key: &ObjectKey) -> Result<()> {
        self.served(identity)?;
        self.count(|ops| ops.deletes += 1);
        let key = self.normalize(identity, key);
        let Some(mut object) = self.object(identity, &key) else {
            return Ok(());
        };
        self.deletions
            .write()
            .unwrap()
            .push((identity.clone(), key.clone()));

        if object_finalizers(&object).is_empty() {
            self.remove(identity, &key);
        } else if !super::is_deleting(&object) {
            object["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
            self.write(identity, object, false)?;
        }
        Ok(())
    }

    async fn apply_crd(&self, crd: &CustomResourceDefinition, field_manager: &str) -> Result<()> {
        let object = serde_json::to_value(crd)?;
        self.apply(&crd_identity(), &object, field_manager).await?;
        Ok(())
    }

    async fn delete_crd(&self, name: &str) -> Result<()> {
        self.delete(&crd_identity(), &ObjectKey::cluster(name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn configmap() -> TypeIdentity {
        TypeIdentity::new("", "v1", "ConfigMap")
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let cluster = MockCluster::new();
        let created = cluster
            .create(&configmap(), &json!({"metadata": {"name": "cfg"}, "data": {"a": "1"}}))
            .await
            .unwrap();

        assert_eq!(created["metadata"]["namespace"], "default");
        assert_eq!(created["metadata"]["uid"], "uid-1");

        let fetched = cluster
            .get(&configmap(), &ObjectKey::namespaced("default", "cfg"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched["data"]["a"], "1");

        let err = cluster
            .create(&configmap(), &json!({"metadata": {"name": "cfg"}}))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_apply_merges_and_bumps_generation() {
        let cluster = MockCluster::new();
        let deployment = TypeIdentity::new("apps", "v1", "Deployment");
        let key = ObjectKey::namespaced("default", "web");

        cluster
            .apply(
                &deployment,
                &json!({"metadata": {"name": "web"}, "spec": {"replicas": 1}}),
                "test",
            )
            .await
            .unwrap();
        cluster
            .patch_status(&deployment, &key, &json!({"readyReplicas": 1}))
            .await
            .unwrap();
        let applied = cluster
            .apply(
                &deployment,
                &json!({"metadata": {"name": "web"}, "spec": {"replicas": 3}}),
                "test",
            )
            .await
            .unwrap();

        assert_eq!(applied["spec"]["replicas"], 3);
        assert_eq!(applied["metadata"]["generation"], 2);
        assert_eq!(applied["status"]["readyReplicas"], 1);

        let counts = cluster.operation_counts();
        assert_eq!(counts.applies, 2);
        assert_eq!(counts.status_patches, 1);

        let unchanged = cluster
            .apply(
                &deployment,
                &json!({"metadata": {"name": "web"}, "spec": {"replicas": 3}}),
                "test",
            )
            .await
            .unwrap();
        assert_eq!(
            unchanged["metadata"]["resourceVersion"],
            applied["metadata"]["resourceVersion"]
        );
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let cluster = MockCluster::new();
        let key = ObjectKey::namespaced("default", "cfg");
        cluster.insert(
            &configmap(),
            json!({"metadata": {"name": "cfg", "finalizers": ["keep"]}}),
        );

        cluster.delete(&configmap(), &key).await.unwrap();
        let marked = cluster.object(&configmap(), &key).unwrap();
        assert!(crate::cluster::is_deleting(&marked));

        cluster.set_finalizers(&configmap(), &key, &[]).await.unwrap();
        assert!(cluster.object(&configmap(), &key).is_none());

        // Deleting a missing object is not an error
        cluster.delete(&configmap(), &key).await.unwrap();
        assert_eq!(cluster.deletions().len(), 1);
    }

    #[tokio::test]
    async fn test_list_filters_by_labels_and_namespace() {
        let cluster = MockCluster::new();
        cluster.insert(
            &configmap(),
            json!({"metadata": {"name": "a", "namespace": "x", "labels": {"app": "web"}}}),
        );
        cluster.insert(
            &configmap(),
            json!({"metadata": {"name": "b", "namespace": "y", "labels": {"app": "web"}}}),
        );
        cluster.insert(&configmap(), json!({"metadata": {"name": "c", "namespace": "x"}}));

        let selector = BTreeMap::from([("app".to_string(), "web".to_string())]);
        assert_eq!(
            cluster.list(&configmap(), None, &selector).await.unwrap().len(),
            2
        );
        assert_eq!(
            cluster
                .list(&configmap(), Some("x"), &selector)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_cluster_scoped_types_drop_namespace() {
        let cluster = MockCluster::new();
        let namespace = TypeIdentity::new("", "v1", "Namespace");
        assert!(!cluster.is_namespaced(&namespace).await.unwrap());

        let created = cluster
            .create(&namespace, &json!({"metadata": {"name": "team", "namespace": "default"}}))
            .await
            .unwrap();
        assert!(created["metadata"].get("namespace").is_none());
    }

    #[tokio::test]
    async fn test_unknown_type_is_not_served() {
        let cluster = MockCluster::new().with_unknown_type("example.com", "Database");
        let database = TypeIdentity::new("example.com", "v1", "Database");

        let err = cluster
            .list(&database, None, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.is_unknown_type());
        assert!(cluster.watch(&database).await.is_err());
        assert!(cluster
            .create(&database, &json!({"metadata": {"name": "db"}}))
            .await
            .unwrap_err()
            .is_unknown_type());
        assert!(cluster.list(&configmap(), None, &BTreeMap::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_replays_existing_then_streams() {
        let cluster = MockCluster::new();
        cluster.insert(&configmap(), json!({"metadata": {"name": "a"}}));

        let mut events = cluster.watch(&configmap()).await.unwrap();
        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.object()["metadata"]["name"], "a");

        cluster
            .delete(&configmap(), &ObjectKey::namespaced("default", "a"))
            .await
            .unwrap();
        let second = events.next().await.unwrap().unwrap();
        assert!(matches!(second, WatchEvent::Deleted(_)));
    }
}
