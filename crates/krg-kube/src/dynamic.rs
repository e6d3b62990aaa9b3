//! Dynamic controller runtime
//!
//! One watch-and-work-queue loop per registered composite type. Loops are
//! created and destroyed at runtime as RGDs come and go:
//!
//! ```text
//! register(WebApp) -> [watch task] --keys--> [WorkQueue] --> [worker x N] --> Reconciler
//! ```
//!
//! Registering a type that is already registered stops the old loop (watch
//! cancelled, queue shut down, in-flight reconciles awaited) before the new
//! one starts, so no reconcile runs against the previous graph afterwards.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use krg_core::{InstanceKey, TypeIdentity};
use krg_engine::CompiledGraph;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterClient, object_key};
use crate::config::ControllerConfig;
use crate::error::Result;
use crate::queue::{WorkQueue, backoff_delay};

/// What to do with a key after a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Nothing left to do until the object changes
    Done,
    /// Look again after the delay (waiting on a dependency)
    Requeue(Duration),
}

/// Reconciles one instance of a registered type
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, graph: Arc<CompiledGraph>, key: &InstanceKey) -> Result<ReconcileAction>;
}

/// Lifecycle of one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Settings shared by every loop
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub workers: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub resync_period: Duration,
}

impl From<&ControllerConfig> for RuntimeOptions {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            workers: config.workers_per_type,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            resync_period: config.resync_period,
        }
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        (&ControllerConfig::default()).into()
    }
}

/// One running loop: a watch task, a queue and its workers
struct Registration {
    identity: TypeIdentity,
    graph: Arc<CompiledGraph>,
    queue: WorkQueue<InstanceKey>,
    cancel: CancellationToken,
    state: Mutex<RegistrationState>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Registration {
    fn start(
        cluster: Arc<dyn ClusterClient>,
        identity: TypeIdentity,
        graph: Arc<CompiledGraph>,
        reconciler: Arc<dyn Reconciler>,
        options: &RuntimeOptions,
    ) -> Arc<Self> {
        let queue = WorkQueue::new(options.base_delay, options.max_delay);
        let cancel = CancellationToken::new();
        let workers = options.workers.max(1);

        let mut tasks = Vec::with_capacity(workers + 1);
        tasks.push(tokio::spawn(watch_loop(
            cluster,
            identity.clone(),
            queue.clone(),
            cancel.clone(),
            options.clone(),
            object_key,
        )));
        for _ in 0..workers {
            let reconciler = reconciler.clone();
            let graph = graph.clone();
            tasks.push(tokio::spawn(run_worker(
                queue.clone(),
                identity.kind.clone(),
                move |key: InstanceKey| {
                    let reconciler = reconciler.clone();
                    let graph = graph.clone();
                    async move { reconciler.reconcile(graph, &key).await }
                },
            )));
        }

        let registration = Arc::new(Self {
            identity: identity.clone(),
            graph: graph.clone(),
            queue,
            cancel,
            state: Mutex::new(RegistrationState::Starting),
            tasks: tokio::sync::Mutex::new(tasks),
        });
        registration.set_state(RegistrationState::Running);

        tracing::info!(
            kind = %identity,
            graph = %graph.short_fingerprint(),
            workers,
            "started instance controller"
        );
        registration
    }

    fn state(&self) -> RegistrationState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: RegistrationState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Cancel the watch, stop handing out keys and wait for in-flight reconciles
    async fn stop(&self) {
        self.set_state(RegistrationState::Stopping);
        self.cancel.cancel();
        self.queue.shut_down();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(kind = %self.identity, error = %e, "controller task panicked");
            }
        }

        self.set_state(RegistrationState::Stopped);
        tracing::info!(kind = %self.identity, "stopped instance controller");
    }
}

/// List and watch every object of a type, feeding the keys `map` derives to the queue
///
/// Watch failures (e.g. a CRD not served yet) are retried with backoff.
pub(crate) async fn watch_loop<K, M>(
    cluster: Arc<dyn ClusterClient>,
    identity: TypeIdentity,
    queue: WorkQueue<K>,
    cancel: CancellationToken,
    options: RuntimeOptions,
    map: M,
) where
    K: Clone + Eq + Hash + Send + 'static,
    M: Fn(&serde_json::Value) -> Option<K> + Send + 'static,
{
    let mut failures: u32 = 0;
    let mut resync = tokio::time::interval(options.resync_period);
    // The first tick completes immediately; the watch's initial list covers it
    resync.tick().await;

    while !cancel.is_cancelled() {
        let mut events = match cluster.watch(&identity).await {
            Ok(events) => events,
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = backoff_delay(options.base_delay, options.max_delay, failures);
                tracing::warn!(kind = %identity, error = %e, retry_in = ?delay, "watch failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = resync.tick() => {
                    match cluster.list(&identity, None, &BTreeMap::new()).await {
                        Ok(objects) => {
                            tracing::debug!(kind = %identity, count = objects.len(), "resync");
                            for object in &objects {
                                if let Some(key) = map(object) {
                                    queue.add(key);
                                }
                            }
                        }
                        Err(e) => tracing::warn!(kind = %identity, error = %e, "resync list failed"),
                    }
                }
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        failures = 0;
                        if let Some(key) = map(event.object()) {
                            queue.add(key);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(kind = %identity, error = %e, "watch error");
                    }
                    None => {
                        tracing::debug!(kind = %identity, "watch stream ended, restarting");
                        break;
                    }
                },
            }
        }
    }
}

/// Pull keys until the queue shuts down, feeding each to `reconcile`
///
/// Successful keys are forgotten by the backoff; transient failures are
/// requeued with backoff, permanent ones wait for the object to change.
/// A panicking reconcile is treated as a transient failure of its key.
pub(crate) async fn run_worker<T, F, Fut>(queue: WorkQueue<T>, kind: String, reconcile: F)
where
    T: Clone + Eq + Hash + Display + Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<ReconcileAction>>,
{
    while let Some(key) = queue.get().await {
        let outcome = AssertUnwindSafe(reconcile(key.clone()))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let delay = queue.add_rate_limited(key.clone());
                tracing::error!(
                    %kind,
                    key = %key,
                    panic = panic_message(panic.as_ref()),
                    retry_in = ?delay,
                    "reconcile panicked"
                );
                queue.done(&key);
                continue;
            }
        };
        match result {
            Ok(ReconcileAction::Done) => queue.forget(&key),
            Ok(ReconcileAction::Requeue(delay)) => {
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
            }
            Err(e) if e.is_transient() => {
                let delay = queue.add_rate_limited(key.clone());
                tracing::warn!(%kind, key = %key, error = %e, retry_in = ?delay, "reconcile failed");
            }
            Err(e) => {
                queue.forget(&key);
                tracing::warn!(%kind, key = %key, error = %e, "reconcile failed, not retrying");
            }
        }
        queue.done(&key);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Registry of per-type loops
pub struct DynamicController {
    cluster: Arc<dyn ClusterClient>,
    options: RuntimeOptions,
    registrations: DashMap<TypeIdentity, Arc<Registration>>,
    /// Serializes register/deregister/shutdown
    lifecycle: tokio::sync::Mutex<()>,
}

impl DynamicController {
    pub fn new(cluster: Arc<dyn ClusterClient>, options: RuntimeOptions) -> Self {
        Self {
            cluster,
            options,
            registrations: DashMap::new(),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Start (or replace) the loop for a type
    pub async fn register(
        &self,
        identity: TypeIdentity,
        graph: Arc<CompiledGraph>,
        reconciler: Arc<dyn Reconciler>,
    ) {
        let _guard = self.lifecycle.lock().await;

        if let Some((_, previous)) = self.registrations.remove(&identity) {
            tracing::info!(kind = %identity, "replacing instance controller");
            previous.stop().await;
        }

        let registration = Registration::start(
            self.cluster.clone(),
            identity.clone(),
            graph,
            reconciler,
            &self.options,
        );
        self.registrations.insert(identity, registration);
    }

    /// Stop and remove the loop for a type; `false` when none was registered
    pub async fn deregister(&self, identity: &TypeIdentity) -> bool {
        let _guard = self.lifecycle.lock().await;
        match self.registrations.remove(identity) {
            Some((_, registration)) => {
                registration.stop().await;
                true
            }
            None => false,
        }
    }

    /// Queue a reconcile of one instance; `false` when the type is not registered
    pub fn reconcile_request(&self, identity: &TypeIdentity, key: InstanceKey) -> bool {
        match self.registrations.get(identity) {
            Some(registration) => {
                registration.queue.add(key);
                true
            }
            None => false,
        }
    }

    pub fn state(&self, identity: &TypeIdentity) -> Option<RegistrationState> {
        self.registrations.get(identity).map(|r| r.state())
    }

    /// Graph the loop for a type is running with
    pub fn graph(&self, identity: &TypeIdentity) -> Option<Arc<CompiledGraph>> {
        self.registrations.get(identity).map(|r| r.graph.clone())
    }

    pub fn registered(&self) -> Vec<TypeIdentity> {
        let mut identities: Vec<_> = self.registrations.iter().map(|r| r.key().clone()).collect();
        identities.sort();
        identities
    }

    /// Stop every loop
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        let identities: Vec<_> = self.registrations.iter().map(|r| r.key().clone()).collect();
        for identity in identities {
            if let Some((_, registration)) = self.registrations.remove(&identity) {
                registration.stop().await;
            }
        }
    }
}
