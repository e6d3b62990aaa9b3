//! Instance reconciler
//!
//! Drives one composite instance towards its graph:
//!
//! 1. Attach the finalizer, default and validate the spec
//! 2. Walk the topological order: evaluate `includeWhen`, render the
//!    template against the instance and the siblings materialized so far,
//!    create or patch the object, then check `readyWhen`
//! 3. Prune objects whose node left the graph (or is excluded)
//! 4. Write the aggregated status, only when it changed
//!
//! An unresolved reference or an unready dependency stops the walk without
//! error: the instance stays `Progressing` and is looked at again later.
//! On deletion, managed objects are removed in reverse topological order,
//! each node's objects confirmed gone before the next node is touched.

use async_trait::async_trait;
use krg_core::status::set_condition;
use krg_core::{
    Condition, InstanceKey, InstanceState, InstanceStatus, ManagedResourceRef, ObjectKey,
    Progress, TypeIdentity, apply_defaults,
};
use krg_engine::{Bindings, CompiledGraph, ExpressionError, Node, evaluate_condition};
use serde_json::{Value as JsonValue, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{ClusterClient, is_deleting, object_finalizers, object_key};
use crate::config::ControllerConfig;
use crate::diff;
use crate::dynamic::{ReconcileAction, Reconciler};
use crate::error::{ControllerError, Result};
use crate::labels;

/// Condition summarizing the instance
pub const READY_CONDITION: &str = "Ready";

/// Result of handling one included node during a pass
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// Materialized and ready; dependents may proceed
    Ready,
    /// Waiting on a value or a readiness check; the walk stops here
    Pending { reason: String },
}

/// State gathered while walking the graph
struct Pass {
    bindings: Bindings,
    resources: Vec<ManagedResourceRef>,
    excluded: BTreeSet<String>,
    materialized: usize,
}

pub struct InstanceReconciler {
    cluster: Arc<dyn ClusterClient>,
    field_manager: String,
    pending_requeue: Duration,
}

impl InstanceReconciler {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: &ControllerConfig) -> Self {
        Self {
            cluster,
            field_manager: config.field_manager.clone(),
            pending_requeue: config.pending_requeue,
        }
    }

    async fn reconcile_instance(
        &self,
        graph: &CompiledGraph,
        key: &InstanceKey,
    ) -> Result<ReconcileAction> {
        let Some(mut instance) = self.cluster.get(&graph.identity, key).await? else {
            tracing::debug!(kind = %graph.identity.kind, instance = %key, "instance gone");
            return Ok(ReconcileAction::Done);
        };
        let previous = InstanceStatus::from_object(&instance).unwrap_or_default();

        if is_deleting(&instance) {
            if !object_finalizers(&instance).iter().any(|f| f == labels::FINALIZER) {
                return Ok(ReconcileAction::Done);
            }
            return self.cleanup(graph, key, &instance, previous).await;
        }

        self.ensure_finalizer(graph, key, &mut instance).await?;

        let mut spec = instance.get("spec").cloned().unwrap_or_else(|| json!({}));
        apply_defaults(&graph.spec_schema, &mut spec);
        let validation = graph.validator.validate(&spec);
        if !validation.is_valid {
            let message = validation.summary();
            let status = error_status(&previous, "InvalidSpec", &message);
            self.write_status(graph, key, &instance, status).await?;
            return Err(ControllerError::InvalidSpec(message));
        }
        instance["spec"] = spec;

        let mut pass = Pass {
            bindings: Bindings::from([(krg_core::rgd::SCHEMA_ROOT.to_string(), instance.clone())]),
            resources: Vec::new(),
            excluded: BTreeSet::new(),
            materialized: 0,
        };

        let mut pending = None;
        let mut failure = None;
        match excluded_nodes(graph, &pass.bindings) {
            Ok(excluded) => pass.excluded = excluded,
            Err(e) => failure = Some(e),
        }
        for node in graph.ordered_nodes() {
            if failure.is_some() {
                break;
            }
            if pass.excluded.contains(&node.id) {
                continue;
            }
            match self.reconcile_node(graph, node, key, &instance, &mut pass).await {
                Ok(NodeOutcome::Ready) => pass.materialized += 1,
                Ok(NodeOutcome::Pending { reason }) => {
                    tracing::debug!(instance = %key, node = %node.id, %reason, "pending");
                    pending = Some(reason);
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // Objects of removed or excluded nodes go away even if the walk stopped early
        let kept = self.prune(graph, &previous, &pass).await?;
        for reference in kept {
            if !pass.resources.iter().any(|r| r.id == reference.id) {
                pass.resources.push(reference);
            }
        }
        pass.resources.sort();

        let total = graph.nodes.len() - pass.excluded.len();
        let mut status = InstanceStatus {
            conditions: previous.conditions.clone(),
            progress: Progress {
                materialized: pass.materialized,
                total,
            },
            resources: pass.resources.clone(),
            ..Default::default()
        };
        status.fields = match graph.render_status(&pass.bindings) {
            Ok(fields) => fields,
            Err(e) if failure.is_none() => {
                failure = Some(ControllerError::Render {
                    node: "status".to_string(),
                    source: e,
                });
                previous.fields.clone()
            }
            Err(_) => previous.fields.clone(),
        };

        let action = match (&failure, &pending) {
            (Some(e), _) => {
                status.state = InstanceState::Error;
                set_condition(
                    &mut status.conditions,
                    Condition::new(READY_CONDITION, false, "ReconcileError", e.to_string()),
                );
                None
            }
            (None, Some(reason)) => {
                status.state = InstanceState::Progressing;
                set_condition(
                    &mut status.conditions,
                    Condition::new(READY_CONDITION, false, "Pending", reason.clone()),
                );
                Some(ReconcileAction::Requeue(self.pending_requeue))
            }
            (None, None) => {
                status.state = InstanceState::Active;
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        READY_CONDITION,
                        true,
                        "AllResourcesReady",
                        format!("{} of {} resources ready", pass.materialized, total),
                    ),
                );
                Some(ReconcileAction::Done)
            }
        };

        self.write_status(graph, key, &instance, status).await?;
        match (action, failure) {
            (Some(action), _) => Ok(action),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(ReconcileAction::Done),
        }
    }

    async fn ensure_finalizer(
        &self,
        graph: &CompiledGraph,
        key: &InstanceKey,
        instance: &mut JsonValue,
    ) -> Result<()> {
        let mut finalizers = object_finalizers(instance);
        if finalizers.iter().any(|f| f == labels::FINALIZER) {
            return Ok(());
        }
        finalizers.push(labels::FINALIZER.to_string());
        self.cluster
            .set_finalizers(&graph.identity, key, &finalizers)
            .await?;
        instance["metadata"]["finalizers"] = json!(finalizers);
        tracing::debug!(instance = %key, "finalizer attached");
        Ok(())
    }

    async fn reconcile_node(
        &self,
        graph: &CompiledGraph,
        node: &Node,
        key: &InstanceKey,
        instance: &JsonValue,
        pass: &mut Pass,
    ) -> Result<NodeOutcome> {
        let rendered = match node.render(&pass.bindings) {
            Ok(rendered) => rendered,
            Err(ExpressionError::Unresolved { reference }) => {
                return Ok(NodeOutcome::Pending {
                    reason: format!("resource '{}' waiting for ${{{}}}", node.id, reference),
                });
            }
            Err(e) => return Err(render_error(node, e)),
        };

        let desired = self.desired_object(graph, node, key, instance, rendered).await?;
        let target = object_key(&desired).ok_or_else(|| ControllerError::Invalid {
            kind: node.identity.kind.clone(),
            name: String::new(),
            message: format!("resource '{}' rendered without metadata.name", node.id),
        })?;

        let live = match self.cluster.get(&node.identity, &target).await? {
            None => match self.cluster.create(&node.identity, &desired).await {
                Ok(created) => {
                    tracing::info!(instance = %key, node = %node.id, object = %target, "created");
                    created
                }
                // Created behind our back since the get
                Err(e) if e.is_conflict() => {
                    self.cluster
                        .apply(&node.identity, &desired, &self.field_manager)
                        .await?
                }
                Err(e) => return Err(e),
            },
            Some(live) if diff::is_subset(&desired, &live) => live,
            Some(live) => {
                tracing::info!(
                    instance = %key,
                    node = %node.id,
                    object = %target,
                    fields = ?diff::drifted_fields(&desired, &live),
                    "patching drifted object"
                );
                tracing::debug!("{}", diff::text_diff(&live, &desired));
                self.cluster
                    .apply(&node.identity, &desired, &self.field_manager)
                    .await?
            }
        };

        pass.resources.push(ManagedResourceRef {
            id: node.id.clone(),
            api_version: node.identity.api_version(),
            kind: node.identity.kind.clone(),
            namespace: target.namespace.clone(),
            name: target.name.clone(),
        });
        pass.bindings.insert(node.id.clone(), live);

        for condition in &node.ready_when {
            match evaluate_condition(condition, &pass.bindings) {
                Ok(true) => {}
                Ok(false) | Err(ExpressionError::Unresolved { .. }) => {
                    return Ok(NodeOutcome::Pending {
                        reason: format!("resource '{}' not ready: {}", node.id, condition),
                    });
                }
                Err(e) => return Err(render_error(node, e)),
            }
        }
        Ok(NodeOutcome::Ready)
    }

    /// Rendered template plus namespace, ownership labels and owner reference
    async fn desired_object(
        &self,
        graph: &CompiledGraph,
        node: &Node,
        key: &InstanceKey,
        instance: &JsonValue,
        mut desired: JsonValue,
    ) -> Result<JsonValue> {
        let namespaced = self.cluster.is_namespaced(&node.identity).await?;
        let metadata = &mut desired["metadata"];

        if namespaced {
            if metadata.get("namespace").is_none_or(JsonValue::is_null) {
                metadata["namespace"] = json!(key.namespace.as_deref().unwrap_or("default"));
            }
        } else if let Some(m) = metadata.as_object_mut() {
            m.remove("namespace");
        }

        let mut object_labels: BTreeMap<String, JsonValue> = metadata
            .get("labels")
            .and_then(|l| serde_json::from_value(l.clone()).ok())
            .unwrap_or_default();
        for (k, v) in labels::managed_labels(&graph.name, key, &node.id) {
            object_labels.insert(k, JsonValue::String(v));
        }
        metadata["labels"] = json!(object_labels);

        let same_namespace = namespaced
            && metadata.get("namespace").and_then(JsonValue::as_str) == key.namespace.as_deref();
        if let (true, Some(uid)) = (same_namespace, instance.pointer("/metadata/uid")) {
            metadata["ownerReferences"] = json!([{
                "apiVersion": graph.identity.api_version(),
                "kind": graph.identity.kind,
                "name": key.name,
                "uid": uid,
                "controller": true,
                "blockOwnerDeletion": false,
            }]);
        }
        Ok(desired)
    }

    /// Delete objects recorded on the instance that are no longer wanted
    ///
    /// That is objects of removed or excluded nodes, and objects a node
    /// rendered under a different name or type in an earlier pass. Returns
    /// the recorded references that are still wanted.
    async fn prune(
        &self,
        graph: &CompiledGraph,
        previous: &InstanceStatus,
        pass: &Pass,
    ) -> Result<Vec<ManagedResourceRef>> {
        let mut kept = Vec::new();
        for reference in &previous.resources {
            let wanted =
                graph.node(&reference.id).is_some() && !pass.excluded.contains(&reference.id);
            let current = pass.resources.iter().find(|r| r.id == reference.id);
            match current {
                _ if !wanted => {}
                Some(current) if current != reference => {}
                Some(_) => continue,
                // Not reached this pass: keep what was there
                None => {
                    kept.push(reference.clone());
                    continue;
                }
            }
            tracing::info!(node = %reference.id, object = %reference.key(), "pruning");
            self.cluster
                .delete(&reference.identity(), &reference.key())
                .await?;
        }
        Ok(kept)
    }

    /// Tear down managed objects in reverse topological order
    async fn cleanup(
        &self,
        graph: &CompiledGraph,
        key: &InstanceKey,
        instance: &JsonValue,
        previous: InstanceStatus,
    ) -> Result<ReconcileAction> {
        let mut status = previous.clone();
        status.state = InstanceState::Deleting;

        // Objects of nodes no longer in the graph have no place in the order; they go first
        let orphans: Vec<(TypeIdentity, ObjectKey)> = previous
            .resources
            .iter()
            .filter(|r| graph.node(&r.id).is_none())
            .map(|r| (r.identity(), r.key()))
            .collect();
        let mut steps: Vec<(String, Vec<(TypeIdentity, ObjectKey)>)> = Vec::new();
        if !orphans.is_empty() {
            steps.push(("(removed)".to_string(), orphans));
        }
        for node in graph.ordered_nodes().rev() {
            let mut selector = labels::instance_selector(&graph.name, key);
            selector.insert(labels::NODE_ID.to_string(), node.id.clone());
            let objects = match self.cluster.list(&node.identity, None, &selector).await {
                Ok(objects) => objects,
                // Never materialized: the type is not even served
                Err(e) if e.is_unknown_type() || e.is_not_found() => {
                    tracing::debug!(instance = %key, node = %node.id, error = %e, "nothing to delete");
                    Vec::new()
                }
                Err(e) => return Err(cleanup_error(&node.id, e)),
            };
            let keys = objects
                .iter()
                .filter_map(object_key)
                .map(|k| (node.identity.clone(), k))
                .collect();
            steps.push((node.id.clone(), keys));
        }

        for (step, objects) in steps {
            if objects.is_empty() {
                continue;
            }
            let mut deleted = Vec::with_capacity(objects.len());
            for (identity, object) in objects {
                tracing::info!(instance = %key, node = %step, object = %object, "deleting");
                match self.cluster.delete(&identity, &object).await {
                    Ok(()) => deleted.push((identity, object)),
                    Err(e) if e.is_unknown_type() || e.is_not_found() => {}
                    Err(e) => {
                        let error = cleanup_error(&step, e);
                        let status = error_status(&status, "CleanupFailed", &error.to_string());
                        let status = InstanceStatus {
                            state: InstanceState::Deleting,
                            ..status
                        };
                        self.write_status(graph, key, instance, status).await?;
                        return Err(error);
                    }
                }
            }

            let mut remaining = 0;
            for (identity, object) in &deleted {
                if self.cluster.get(identity, object).await?.is_some() {
                    remaining += 1;
                }
            }
            if remaining > 0 {
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        READY_CONDITION,
                        false,
                        "Deleting",
                        format!("waiting for {} object(s) of '{}' to be deleted", remaining, step),
                    ),
                );
                self.write_status(graph, key, instance, status).await?;
                return Ok(ReconcileAction::Requeue(self.pending_requeue));
            }
        }

        let finalizers: Vec<String> = object_finalizers(instance)
            .into_iter()
            .filter(|f| f != labels::FINALIZER)
            .collect();
        self.cluster
            .set_finalizers(&graph.identity, key, &finalizers)
            .await?;
        tracing::info!(kind = %graph.identity.kind, instance = %key, "managed resources deleted");
        Ok(ReconcileAction::Done)
    }

    /// Patch the status subresource if anything changed
    async fn write_status(
        &self,
        graph: &CompiledGraph,
        key: &InstanceKey,
        instance: &JsonValue,
        status: InstanceStatus,
    ) -> Result<()> {
        let status = serde_json::to_value(&status)?;
        if instance.get("status") == Some(&status) {
            return Ok(());
        }
        match self.cluster.patch_status(&graph.identity, key, &status).await {
            // Deleted meanwhile
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl Reconciler for InstanceReconciler {
    async fn reconcile(&self, graph: Arc<CompiledGraph>, key: &InstanceKey) -> Result<ReconcileAction> {
        self.reconcile_instance(&graph, key).await
    }
}

/// Nodes whose `includeWhen` is false, plus everything depending on them
///
/// Conditions only read the instance, so this is known before the walk.
fn excluded_nodes(graph: &CompiledGraph, bindings: &Bindings) -> Result<BTreeSet<String>> {
    let mut excluded = BTreeSet::new();
    for node in graph.ordered_nodes() {
        if node
            .dependencies
            .iter()
            .any(|&i| excluded.contains(&graph.nodes[i].id))
        {
            excluded.insert(node.id.clone());
            continue;
        }
        for condition in &node.include_when {
            match evaluate_condition(condition, bindings) {
                Ok(true) => {}
                // An absent schema field counts as false
                Ok(false) | Err(ExpressionError::Unresolved { .. }) => {
                    excluded.insert(node.id.clone());
                    break;
                }
                Err(e) => return Err(render_error(node, e)),
            }
        }
    }
    Ok(excluded)
}

fn render_error(node: &Node, source: ExpressionError) -> ControllerError {
    ControllerError::Render {
        node: node.id.clone(),
        source,
    }
}

fn cleanup_error(step: &str, e: ControllerError) -> ControllerError {
    ControllerError::Cleanup {
        resource: step.to_string(),
        message: e.to_string(),
    }
}

fn error_status(previous: &InstanceStatus, reason: &str, message: &str) -> InstanceStatus {
    let mut status = previous.clone();
    status.state = InstanceState::Error;
    set_condition(
        &mut status.conditions,
        Condition::new(READY_CONDITION, false, reason, message),
    );
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use krg_core::ResourceGraphDefinition;
    use krg_engine::GraphBuilder;

    const RGD: &str = r#"
apiVersion: krg.dev/v1alpha1
kind: ResourceGraphDefinition
metadata:
  name: webapp
spec:
  schema:
    apiVersion: v1alpha1
    kind: WebApp
    spec:
      name: string | required=true
      replicas: integer | default=3
      withCache: boolean | default=false
    status:
      endpoint: ${database.status.endpoint}
  resources:
    - id: database
      template:
        apiVersion: example.com/v1
        kind: Database
        metadata:
          name: ${schema.spec.name}-db
    - id: app
      template:
        apiVersion: apps/v1
        kind: Deployment
        metadata:
          name: ${schema.spec.name}
        spec:
          replicas: ${schema.spec.replicas}
          databaseReady: ${database.status.ready}
    - id: cache
      includeWhen:
        - ${schema.spec.withCache}
      template:
        apiVersion: v1
        kind: ConfigMap
        metadata:
          name: ${schema.spec.name}-cache
"#;

    fn compile(yaml: &str) -> Arc<CompiledGraph> {
        let rgd = ResourceGraphDefinition::from_yaml(yaml).unwrap();
        Arc::new(GraphBuilder::new().compile(&rgd).unwrap())
    }

    fn database() -> TypeIdentity {
        TypeIdentity::new("example.com", "v1", "Database")
    }

    fn deployment() -> TypeIdentity {
        TypeIdentity::new("apps", "v1", "Deployment")
    }

    fn configmap() -> TypeIdentity {
        TypeIdentity::new("", "v1", "ConfigMap")
    }

    fn key() -> InstanceKey {
        InstanceKey::namespaced("default", "demo")
    }

    fn setup(spec: JsonValue) -> (MockCluster, InstanceReconciler, Arc<CompiledGraph>) {
        let cluster = MockCluster::new();
        let graph = compile(RGD);
        cluster.insert(
            &graph.identity,
            json!({"metadata": {"name": "demo", "namespace": "default"}, "spec": spec}),
        );
        let config = ControllerConfig {
            pending_requeue: Duration::from_millis(50),
            ..Default::default()
        };
        let reconciler = InstanceReconciler::new(Arc::new(cluster.clone()), &config);
        (cluster, reconciler, graph)
    }

    fn status(cluster: &MockCluster, graph: &CompiledGraph) -> InstanceStatus {
        let instance = cluster.object(&graph.identity, &key()).unwrap();
        InstanceStatus::from_object(&instance).unwrap()
    }

    fn make_database_ready(cluster: &MockCluster) {
        let db_key = ObjectKey::namespaced("default", "demo-db");
        let mut db = cluster.object(&database(), &db_key).unwrap();
        db["status"] = json!({"ready": true, "endpoint": "db.default:5432"});
        cluster.insert(&database(), db);
    }

    #[tokio::test]
    async fn test_waits_for_dependency_then_materializes() {
        let (cluster, reconciler, graph) = setup(json!({"name": "demo"}));

        let action = reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Requeue(Duration::from_millis(50)));
        assert!(cluster
            .object(&database(), &ObjectKey::namespaced("default", "demo-db"))
            .is_some());
        assert!(cluster.objects(&deployment()).is_empty());

        let progressing = status(&cluster, &graph);
        assert_eq!(progressing.state, InstanceState::Progressing);
        assert_eq!(progressing.progress, Progress { materialized: 1, total: 2 });
        assert!(!progressing.condition(READY_CONDITION).unwrap().is_true());

        make_database_ready(&cluster);
        let action = reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);

        let app = cluster
            .object(&deployment(), &ObjectKey::namespaced("default", "demo"))
            .unwrap();
        assert_eq!(app["spec"]["replicas"], 3);
        assert_eq!(app["spec"]["databaseReady"], true);
        assert_eq!(app["metadata"]["labels"][labels::NODE_ID], "app");
        assert_eq!(app["metadata"]["ownerReferences"][0]["kind"], "WebApp");

        let active = status(&cluster, &graph);
        assert_eq!(active.state, InstanceState::Active);
        assert_eq!(active.progress, Progress { materialized: 2, total: 2 });
        assert_eq!(active.fields["endpoint"], "db.default:5432");
        assert_eq!(
            active.resources.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["app", "database"]
        );
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let (cluster, reconciler, graph) = setup(json!({"name": "demo"}));
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        make_database_ready(&cluster);
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();

        cluster.reset_counts();
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        let counts = cluster.operation_counts();
        assert_eq!(counts.writes(), 0, "{:?}", counts);
    }

    #[tokio::test]
    async fn test_drift_is_patched() {
        let (cluster, reconciler, graph) = setup(json!({"name": "demo"}));
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        make_database_ready(&cluster);
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();

        let app_key = ObjectKey::namespaced("default", "demo");
        let mut app = cluster.object(&deployment(), &app_key).unwrap();
        app["spec"]["replicas"] = json!(1);
        cluster.insert(&deployment(), app);

        cluster.reset_counts();
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        assert_eq!(cluster.operation_counts().applies, 1);
        assert_eq!(
            cluster.object(&deployment(), &app_key).unwrap()["spec"]["replicas"],
            3
        );
    }

    #[tokio::test]
    async fn test_invalid_spec_reports_error_without_resources() {
        let (cluster, reconciler, graph) = setup(json!({"replicas": 2}));

        let err = reconciler.reconcile(graph.clone(), &key()).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidSpec(_)));
        assert!(!err.is_transient());
        assert_eq!(cluster.operation_counts().creates, 0);

        let status = status(&cluster, &graph);
        assert_eq!(status.state, InstanceState::Error);
        let condition = status.condition(READY_CONDITION).unwrap();
        assert_eq!(condition.reason.as_deref(), Some("InvalidSpec"));
        assert!(condition.message.as_deref().unwrap().contains("name"));
    }

    #[tokio::test]
    async fn test_include_when_toggles_resource() {
        let (cluster, reconciler, graph) = setup(json!({"name": "demo", "withCache": true}));
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        make_database_ready(&cluster);
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();

        let cache_key = ObjectKey::namespaced("default", "demo-cache");
        assert!(cluster.object(&configmap(), &cache_key).is_some());
        assert_eq!(status(&cluster, &graph).progress.total, 3);

        let mut instance = cluster.object(&graph.identity, &key()).unwrap();
        instance["spec"]["withCache"] = json!(false);
        cluster.insert(&graph.identity, instance);

        reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        assert!(cluster.object(&configmap(), &cache_key).is_none());
        let status = status(&cluster, &graph);
        assert_eq!(status.progress, Progress { materialized: 2, total: 2 });
        assert!(status.resources.iter().all(|r| r.id != "cache"));
    }

    #[tokio::test]
    async fn test_removed_node_is_pruned() {
        let (cluster, reconciler, graph) = setup(json!({"name": "demo"}));
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        make_database_ready(&cluster);
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();

        // Same definition without the deployment
        let trimmed = RGD.replace("    - id: app\n", "    - id: unused\n");
        let trimmed = trimmed.replace("${database.status.ready}", "true");
        let mut rgd = ResourceGraphDefinition::from_yaml(&trimmed).unwrap();
        rgd.spec.resources.retain(|r| r.id != "unused");
        let smaller = Arc::new(GraphBuilder::new().compile(&rgd).unwrap());

        reconciler.reconcile(smaller.clone(), &key()).await.unwrap();
        assert!(cluster
            .object(&deployment(), &ObjectKey::namespaced("default", "demo"))
            .is_none());
        let status = status(&cluster, &smaller);
        assert_eq!(status.state, InstanceState::Active);
        assert_eq!(status.resources.len(), 1);
    }

    #[tokio::test]
    async fn test_render_error_is_reported() {
        let yaml = RGD.replace(
            "databaseReady: ${database.status.ready}",
            "databaseReady: \"ready-${database.status}\"",
        );
        let (cluster, reconciler, _) = setup(json!({"name": "demo"}));
        let graph = compile(&yaml);
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        make_database_ready(&cluster);

        let err = reconciler.reconcile(graph.clone(), &key()).await.unwrap_err();
        assert!(matches!(err, ControllerError::Render { ref node, .. } if node == "app"));
        assert!(err.is_transient());
        let status = status(&cluster, &graph);
        assert_eq!(status.state, InstanceState::Error);
        // Already-applied earlier nodes stay
        assert_eq!(status.progress.materialized, 1);
    }

    #[tokio::test]
    async fn test_cleanup_runs_in_reverse_order() {
        let (cluster, reconciler, graph) = setup(json!({"name": "demo"}));
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        make_database_ready(&cluster);
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();

        // The deployment lingers until its own finalizer is cleared
        let app_key = ObjectKey::namespaced("default", "demo");
        let mut app = cluster.object(&deployment(), &app_key).unwrap();
        app["metadata"]["finalizers"] = json!(["example.com/hold"]);
        cluster.insert(&deployment(), app);

        cluster.delete(&graph.identity, &key()).await.unwrap();
        let action = reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Requeue(Duration::from_millis(50)));
        assert_eq!(status(&cluster, &graph).state, InstanceState::Deleting);

        // The database must not be touched while the deployment exists
        let kinds: Vec<String> = cluster.deletions().into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec!["WebApp", "Deployment"]);

        cluster.set_finalizers(&deployment(), &app_key, &[]).await.unwrap();
        let action = reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);

        let kinds: Vec<String> = cluster.deletions().into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec!["WebApp", "Deployment", "Database"]);
        assert!(cluster.object(&graph.identity, &key()).is_none());
        assert!(cluster.objects(&database()).is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_skips_types_the_cluster_does_not_serve() {
        let (cluster, reconciler, graph) = setup(json!({"name": "demo"}));
        // The deployment waits on the database; the cache is excluded
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        assert!(cluster.objects(&deployment()).is_empty());

        let cluster = cluster
            .with_unknown_type("apps", "Deployment")
            .with_unknown_type("", "ConfigMap");
        cluster.delete(&graph.identity, &key()).await.unwrap();

        let action = reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);
        let kinds: Vec<String> = cluster.deletions().into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec!["WebApp", "Database"]);
        assert!(cluster.object(&graph.identity, &key()).is_none());
    }

    #[tokio::test]
    async fn test_renamed_object_is_pruned() {
        let (cluster, reconciler, graph) = setup(json!({"name": "demo"}));
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        make_database_ready(&cluster);
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();

        let renamed = compile(&RGD.replace(
            "name: ${schema.spec.name}-db",
            "name: ${schema.spec.name}-database",
        ));
        reconciler.reconcile(renamed.clone(), &key()).await.unwrap();

        assert!(cluster
            .object(&database(), &ObjectKey::namespaced("default", "demo-db"))
            .is_none());
        assert!(cluster
            .object(&database(), &ObjectKey::namespaced("default", "demo-database"))
            .is_some());
        // Not reached this pass, so left alone
        assert!(cluster
            .object(&deployment(), &ObjectKey::namespaced("default", "demo"))
            .is_some());

        let status = status(&cluster, &renamed);
        let names: Vec<&str> = status.resources.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["demo", "demo-database"]);
    }

    #[tokio::test]
    async fn test_ready_when_holds_back_dependents() {
        let (cluster, reconciler, _) = setup(json!({"name": "demo"}));
        let graph = compile(&RGD.replace(
            "    - id: database\n      template:",
            "    - id: database\n      readyWhen:\n        - ${database.status.ready}\n      template:",
        ));
        assert_eq!(graph.node("database").unwrap().ready_when.len(), 1);
        reconciler.reconcile(graph.clone(), &key()).await.unwrap();

        let db_key = ObjectKey::namespaced("default", "demo-db");
        let mut db = cluster.object(&database(), &db_key).unwrap();
        db["status"] = json!({"ready": false, "endpoint": "db.default:5432"});
        cluster.insert(&database(), db);

        let action = reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Requeue(Duration::from_millis(50)));
        assert!(cluster.objects(&deployment()).is_empty());
        let progressing = status(&cluster, &graph);
        assert_eq!(progressing.state, InstanceState::Progressing);
        let condition = progressing.condition(READY_CONDITION).unwrap();
        assert!(condition.message.as_deref().unwrap().contains("'database' not ready"));

        make_database_ready(&cluster);
        let action = reconciler.reconcile(graph.clone(), &key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);
        assert_eq!(cluster.objects(&deployment()).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_instance_is_done() {
        let cluster = MockCluster::new();
        let reconciler = InstanceReconciler::new(Arc::new(cluster), &ControllerConfig::default());
        let action = reconciler.reconcile(compile(RGD), &key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);
    }
}
