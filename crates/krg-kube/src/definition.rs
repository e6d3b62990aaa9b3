//! ResourceGraphDefinition reconciler
//!
//! For every RGD the controller:
//! 1. Compiles it (once per generation)
//! 2. Installs the generated CRD, labelled with the RGD name
//! 3. Starts (or swaps) the instance controller of the new type
//! 4. Publishes the compiled state on the RGD status
//!
//! A graph that does not compile is reported on the RGD and never retried;
//! the definition has to change. A previously running controller for the
//! type keeps serving the last good graph meanwhile.

use dashmap::DashMap;
use krg_core::rgd::{GROUP, VERSION};
use krg_core::status::set_condition;
use krg_core::{
    CompiledResourceState, Condition, DefinitionState, DeletionPolicy, ObjectKey,
    ResourceGraphDefinition, ResourceGraphDefinitionStatus, ResourceInformation, TypeIdentity,
};
use krg_engine::{CompileError, CompiledGraph, GraphBuilder};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterClient, crd_identity, object_key, object_labels};
use crate::config::ControllerConfig;
use crate::dynamic::{DynamicController, ReconcileAction, RuntimeOptions, run_worker, watch_loop};
use crate::error::Result;
use crate::instance::InstanceReconciler;
use crate::labels;
use crate::queue::WorkQueue;

/// The graph compiled and the CRD accepted
pub const GRAPH_VERIFIED: &str = "GraphVerified";
pub const CRD_SYNCED: &str = "CustomResourceDefinitionSynced";
pub const RECONCILER_READY: &str = "ReconcilerReady";

/// Identity of the ResourceGraphDefinition type
pub fn rgd_identity() -> TypeIdentity {
    TypeIdentity::new(GROUP, VERSION, "ResourceGraphDefinition")
}

pub struct DefinitionReconciler {
    cluster: Arc<dyn ClusterClient>,
    runtime: Arc<DynamicController>,
    instances: Arc<InstanceReconciler>,
    config: ControllerConfig,
    /// Last good graph per RGD name
    installed: DashMap<String, Arc<CompiledGraph>>,
}

impl DefinitionReconciler {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        runtime: Arc<DynamicController>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            instances: Arc::new(InstanceReconciler::new(cluster.clone(), config)),
            cluster,
            runtime,
            config: config.clone(),
            installed: DashMap::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<DynamicController> {
        &self.runtime
    }

    /// Graph currently installed for an RGD
    pub fn installed(&self, name: &str) -> Option<Arc<CompiledGraph>> {
        self.installed.get(name).map(|g| Arc::clone(g.value()))
    }

    /// Bring the cluster in line with one RGD
    pub async fn reconcile(&self, name: &str) -> Result<ReconcileAction> {
        let key = ObjectKey::cluster(name);
        let Some(object) = self.cluster.get(&rgd_identity(), &key).await? else {
            if let Some((_, graph)) = self.installed.remove(name) {
                self.runtime.deregister(&graph.identity).await;
            }
            tracing::debug!(rgd = name, "definition gone");
            return Ok(ReconcileAction::Done);
        };
        let rgd: ResourceGraphDefinition = serde_json::from_value(object.clone())?;

        if rgd.is_deleting() {
            if !rgd.has_finalizer(labels::FINALIZER) {
                return Ok(ReconcileAction::Done);
            }
            return self.finalize(&rgd).await;
        }
        self.ensure_finalizer(&rgd, &key).await?;

        let previous = rgd.status.clone().unwrap_or_default();
        let graph = match self.compile(&rgd) {
            Ok(graph) => graph,
            Err(e) => {
                tracing::warn!(rgd = name, error = %e, "compilation failed");
                let status = compile_error_status(&rgd, &previous, &e);
                self.write_status(&key, &object, &status).await?;
                return Err(e.into());
            }
        };

        // The kind (or group) changed: the old type is no longer served
        if let Some(old) = self.installed(name) {
            if old.identity != graph.identity {
                tracing::info!(rgd = name, old = %old.identity, new = %graph.identity, "type renamed");
                self.runtime.deregister(&old.identity).await;
            }
        }

        if let Err(e) = self
            .cluster
            .apply_crd(&graph.crd, &self.config.field_manager)
            .await
        {
            tracing::warn!(rgd = name, error = %e, "failed to install CRD");
            let mut status = previous.clone();
            status.state = Some(DefinitionState::Error);
            set_condition(
                &mut status.conditions,
                Condition::new(CRD_SYNCED, false, "InstallFailed", e.to_string()),
            );
            self.write_status(&key, &object, &status).await?;
            return Err(e);
        }

        let running = self.runtime.graph(&graph.identity);
        if running.is_none_or(|g| g.fingerprint != graph.fingerprint) {
            self.runtime
                .register(graph.identity.clone(), graph.clone(), self.instances.clone())
                .await;
        }
        self.installed.insert(name.to_string(), graph.clone());

        let status = managing_status(&rgd, &previous, &graph);
        self.write_status(&key, &object, &status).await?;
        tracing::info!(
            rgd = name,
            kind = %graph.identity,
            generation = graph.generation,
            "definition reconciled"
        );
        Ok(ReconcileAction::Done)
    }

    /// Reuse the installed graph when the generation did not move
    fn compile(&self, rgd: &ResourceGraphDefinition) -> std::result::Result<Arc<CompiledGraph>, CompileError> {
        if let Some(graph) = self.installed(rgd.name()) {
            if graph.generation == rgd.generation() {
                return Ok(graph);
            }
        }
        let graph = GraphBuilder::new()
            .with_crd_labels(labels::crd_labels(rgd.name()))
            .compile(rgd)?;
        tracing::debug!(rgd = rgd.name(), graph = %graph.short_fingerprint(), "compiled");
        Ok(Arc::new(graph))
    }

    async fn ensure_finalizer(&self, rgd: &ResourceGraphDefinition, key: &ObjectKey) -> Result<()> {
        if rgd.has_finalizer(labels::FINALIZER) {
            return Ok(());
        }
        let mut finalizers = rgd.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(labels::FINALIZER.to_string());
        self.cluster
            .set_finalizers(&rgd_identity(), key, &finalizers)
            .await
    }

    /// Stop serving the type, drop the CRD when allowed, release the RGD
    async fn finalize(&self, rgd: &ResourceGraphDefinition) -> Result<ReconcileAction> {
        let name = rgd.name();
        let identity = rgd.spec.schema.identity();

        let mut served = BTreeSet::from([identity.clone()]);
        if let Some((_, graph)) = self.installed.remove(name) {
            served.insert(graph.identity.clone());
        }
        for identity in &served {
            if self.runtime.deregister(identity).await {
                tracing::info!(rgd = name, kind = %identity, "instance controller stopped");
            }
        }

        if self.deletes_crd(rgd) {
            for identity in &served {
                self.cluster.delete_crd(&identity.crd_name()).await?;
                tracing::info!(rgd = name, crd = %identity.crd_name(), "CRD deleted");
            }
        } else {
            tracing::info!(rgd = name, crd = %identity.crd_name(), "keeping CRD");
        }

        let finalizers: Vec<String> = rgd
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| *f != labels::FINALIZER)
            .cloned()
            .collect();
        self.cluster
            .set_finalizers(&rgd_identity(), &ObjectKey::cluster(name), &finalizers)
            .await?;
        Ok(ReconcileAction::Done)
    }

    fn deletes_crd(&self, rgd: &ResourceGraphDefinition) -> bool {
        match rgd.spec.deletion_policy {
            Some(DeletionPolicy::Delete) => true,
            Some(DeletionPolicy::Retain) => false,
            None => self.config.allow_crd_deletion,
        }
    }

    async fn write_status(
        &self,
        key: &ObjectKey,
        object: &JsonValue,
        status: &ResourceGraphDefinitionStatus,
    ) -> Result<()> {
        let status = serde_json::to_value(status)?;
        if object.get("status") == Some(&status) {
            return Ok(());
        }
        match self.cluster.patch_status(&rgd_identity(), key, &status).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

fn managing_status(
    rgd: &ResourceGraphDefinition,
    previous: &ResourceGraphDefinitionStatus,
    graph: &CompiledGraph,
) -> ResourceGraphDefinitionStatus {
    let resources = graph
        .nodes
        .iter()
        .map(|node| ResourceInformation {
            id: node.id.clone(),
            state: CompiledResourceState::Resolved,
            dependencies: graph.dependency_ids(node),
            message: None,
        })
        .collect();

    let mut conditions = previous.conditions.clone();
    set_condition(
        &mut conditions,
        Condition::new(
            GRAPH_VERIFIED,
            true,
            "Compiled",
            format!("{} resources", graph.nodes.len()),
        ),
    );
    set_condition(
        &mut conditions,
        Condition::new(CRD_SYNCED, true, "Installed", graph.identity.crd_name()),
    );
    set_condition(
        &mut conditions,
        Condition::new(
            RECONCILER_READY,
            true,
            "Registered",
            format!("serving {}", graph.identity),
        ),
    );

    ResourceGraphDefinitionStatus {
        state: Some(DefinitionState::Managing),
        topological_order: graph.topological_ids(),
        resources,
        conditions,
        observed_generation: Some(rgd.generation()),
    }
}

fn compile_error_status(
    rgd: &ResourceGraphDefinition,
    previous: &ResourceGraphDefinitionStatus,
    error: &CompileError,
) -> ResourceGraphDefinitionStatus {
    let failing: BTreeSet<&str> = match error {
        CompileError::Cycle { members } => members.iter().map(String::as_str).collect(),
        other => other.resource().into_iter().collect(),
    };
    let message = error.to_string();

    let resources = rgd
        .spec
        .resources
        .iter()
        .map(|resource| {
            let failed = failing.contains(resource.id.as_str());
            ResourceInformation {
                id: resource.id.clone(),
                state: if failed {
                    CompiledResourceState::Error
                } else {
                    CompiledResourceState::Pending
                },
                dependencies: Vec::new(),
                message: failed.then(|| message.clone()),
            }
        })
        .collect();

    let mut conditions = previous.conditions.clone();
    set_condition(
        &mut conditions,
        Condition::new(GRAPH_VERIFIED, false, "InvalidGraph", message),
    );

    ResourceGraphDefinitionStatus {
        state: Some(DefinitionState::Error),
        topological_order: Vec::new(),
        resources,
        conditions,
        observed_generation: Some(rgd.generation()),
    }
}

/// Queue key of an RGD event
fn rgd_name(object: &JsonValue) -> Option<String> {
    object_key(object).map(|key| key.name)
}

/// RGD owning a CRD, from its labels
fn crd_owner(object: &JsonValue) -> Option<String> {
    labels::owning_rgd(&object_labels(object)).map(str::to_string)
}

/// Top-level controller: watches RGDs (and the CRDs they own) and runs
/// the definition workers on top of the dynamic runtime
pub struct DefinitionController {
    cluster: Arc<dyn ClusterClient>,
    reconciler: Arc<DefinitionReconciler>,
    options: RuntimeOptions,
}

impl DefinitionController {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: &ControllerConfig) -> Self {
        let runtime = Arc::new(DynamicController::new(
            cluster.clone(),
            RuntimeOptions::from(config),
        ));
        let reconciler = Arc::new(DefinitionReconciler::new(cluster.clone(), runtime, config));
        Self {
            cluster,
            reconciler,
            options: RuntimeOptions {
                workers: config.definition_workers,
                ..RuntimeOptions::from(config)
            },
        }
    }

    pub fn reconciler(&self) -> &Arc<DefinitionReconciler> {
        &self.reconciler
    }

    /// Run until `shutdown` is cancelled, then drain every loop
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let queue: WorkQueue<String> = WorkQueue::new(self.options.base_delay, self.options.max_delay);
        let workers = self.options.workers.max(1);

        let mut tasks = vec![
            tokio::spawn(watch_loop(
                self.cluster.clone(),
                rgd_identity(),
                queue.clone(),
                shutdown.clone(),
                self.options.clone(),
                rgd_name,
            )),
            tokio::spawn(watch_loop(
                self.cluster.clone(),
                crd_identity(),
                queue.clone(),
                shutdown.clone(),
                self.options.clone(),
                crd_owner,
            )),
        ];
        for _ in 0..workers {
            let reconciler = self.reconciler.clone();
            tasks.push(tokio::spawn(run_worker(
                queue.clone(),
                "ResourceGraphDefinition".to_string(),
                move |name: String| {
                    let reconciler = reconciler.clone();
                    async move { reconciler.reconcile(&name).await }
                },
            )));
        }
        tracing::info!(workers, "definition controller started");

        shutdown.cancelled().await;
        tracing::info!("shutting down");
        queue.shut_down();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "controller task panicked");
            }
        }
        self.reconciler.runtime().shutdown().await;
        Ok(())
    }
}
