//! Ownership labels put on everything the controller creates
//!
//! Managed resources are found again through these labels: instance cleanup
//! lists them per node type, and CRD watch events are mapped back to the RGD
//! that installed the CRD.

use krg_core::ObjectKey;
use std::collections::BTreeMap;

/// `true` on every object created by the controller
pub const OWNED: &str = "krg.dev/owned";
/// Name of the RGD an object (or CRD) belongs to
pub const RGD_NAME: &str = "krg.dev/resource-graph-definition-name";
pub const INSTANCE_NAME: &str = "krg.dev/instance-name";
pub const INSTANCE_NAMESPACE: &str = "krg.dev/instance-namespace";
/// Resource id of the graph node an object was rendered from
pub const NODE_ID: &str = "krg.dev/node-id";
pub const CONTROLLER_VERSION: &str = "krg.dev/controller-version";

/// Finalizer guarding cleanup of managed resources (and of RGDs)
pub const FINALIZER: &str = "krg.dev/finalizer";

/// Labels identifying the CRD generated for an RGD
pub fn crd_labels(rgd: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OWNED.to_string(), "true".to_string()),
        (RGD_NAME.to_string(), rgd.to_string()),
        (
            CONTROLLER_VERSION.to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
    ])
}

/// Selector matching every object managed for one instance
pub fn instance_selector(rgd: &str, instance: &ObjectKey) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OWNED.to_string(), "true".to_string()),
        (RGD_NAME.to_string(), rgd.to_string()),
        (INSTANCE_NAME.to_string(), instance.name.clone()),
        (
            INSTANCE_NAMESPACE.to_string(),
            instance.namespace.clone().unwrap_or_default(),
        ),
    ])
}

/// Labels for one managed resource
pub fn managed_labels(rgd: &str, instance: &ObjectKey, node: &str) -> BTreeMap<String, String> {
    let mut labels = instance_selector(rgd, instance);
    labels.insert(NODE_ID.to_string(), node.to_string());
    labels.insert(
        CONTROLLER_VERSION.to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    labels
}

/// Whether the labels mark an object as controller-owned
pub fn is_owned(labels: &BTreeMap<String, String>) -> bool {
    labels.get(OWNED).map(String::as_str) == Some("true")
}

/// RGD owning a labelled object, if any
pub fn owning_rgd(labels: &BTreeMap<String, String>) -> Option<&str> {
    if !is_owned(labels) {
        return None;
    }
    labels.get(RGD_NAME).map(String::as_str)
}

/// Render an equality selector as `k=v,k2=v2`
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `labels` satisfies every pair of `selector`
pub fn matches(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}
