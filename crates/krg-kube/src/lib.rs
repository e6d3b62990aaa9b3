//! krg Kube - Kubernetes runtime for krg
//!
//! This crate provides:
//! - **Cluster access**: the `ClusterClient` seam, backed by kube-rs or an in-memory mock
//! - **Dynamic controllers**: one watch/work-queue loop per composite type, swapped at runtime
//! - **Instance reconciler**: materializes a graph for each instance, in dependency order
//! - **Definition reconciler**: compiles RGDs, installs their CRDs and registers their loops
//! - **Drift detection**: semantic subset comparison of desired vs live objects
//! - **Labels**: ownership labels used for cleanup and CRD-to-RGD mapping

pub mod cluster;
pub mod config;
pub mod definition;
pub mod diff;
pub mod dynamic;
pub mod error;
pub mod instance;
pub mod labels;
pub mod queue;

pub use cluster::{ClusterClient, KubeCluster, MockCluster, OperationCounts, WatchEvent};
pub use config::{ControllerConfig, DEFAULT_FIELD_MANAGER};
pub use definition::{DefinitionController, DefinitionReconciler, rgd_identity};
pub use dynamic::{
    DynamicController, ReconcileAction, Reconciler, RegistrationState, RuntimeOptions,
};
pub use error::{ControllerError, Result};
pub use instance::{InstanceReconciler, NodeOutcome, READY_CONDITION};
pub use queue::WorkQueue;
