//! Status shapes shared by RGDs and composite instances

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::identity::{ObjectKey, TypeIdentity};

/// Status field names owned by the controller on every instance
pub const RESERVED_STATUS_FIELDS: &[&str] = &["state", "conditions", "progress", "resources"];

/// Kubernetes-style condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: Some(Utc::now().to_rfc3339()),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }

    /// Same condition ignoring the transition timestamp
    pub fn same_as(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Merge `new` into `conditions`, keeping the old timestamp when nothing changed
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) if existing.same_as(&new) => {}
        Some(existing) => *existing = new,
        None => conditions.push(new),
    }
}

/// Lifecycle state of a composite instance
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstanceState {
    /// Some resources are not materialized or not ready yet
    #[default]
    Progressing,
    /// Every included resource is materialized and ready
    Active,
    /// The last pass failed
    Error,
    /// Managed resources are being torn down
    Deleting,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Progressing => write!(f, "Progressing"),
            Self::Active => write!(f, "Active"),
            Self::Error => write!(f, "Error"),
            Self::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Materialized versus total resource count
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    pub materialized: usize,
    pub total: usize,
}

/// Reference to one resource a composite instance manages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceRef {
    /// Resource id in the graph
    pub id: String,
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ManagedResourceRef {
    pub fn identity(&self) -> TypeIdentity {
        TypeIdentity::from_api_version(&self.api_version, &self.kind)
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.as_deref(), &self.name)
    }
}

/// Status written on every composite instance
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceStatus {
    #[serde(default)]
    pub state: InstanceState,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub resources: Vec<ManagedResourceRef>,
    /// User-declared status fields
    #[serde(flatten)]
    pub fields: serde_json::Map<String, JsonValue>,
}

impl InstanceStatus {
    /// Read the status from an instance document, tolerating garbage
    pub fn from_object(object: &JsonValue) -> Option<Self> {
        object
            .get("status")
            .and_then(|s| serde_json::from_value(s.clone()).ok())
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_keeps_timestamp_when_unchanged() {
        let mut conditions = vec![Condition {
            last_transition_time: Some("2020-01-01T00:00:00Z".into()),
            ..Condition::new("Ready", true, "AllReady", "ok")
        }];
        set_condition(&mut conditions, Condition::new("Ready", true, "AllReady", "ok"));
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2020-01-01T00:00:00Z")
        );

        set_condition(&mut conditions, Condition::new("Ready", false, "Pending", "wait"));
        assert_eq!(conditions.len(), 1);
        assert!(!conditions[0].is_true());
    }

    #[test]
    fn test_instance_status_flattens_user_fields() {
        let mut status = InstanceStatus::default();
        status
            .fields
            .insert("endpoint".into(), JsonValue::String("http://x".into()));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["endpoint"], "http://x");
        assert_eq!(json["state"], "Progressing");

        let back: InstanceStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn test_managed_ref_identity() {
        let r = ManagedResourceRef {
            id: "deployment".into(),
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            namespace: Some("default".into()),
            name: "web".into(),
        };
        assert_eq!(r.identity().group, "apps");
        assert_eq!(r.key().to_string(), "default/web");
    }
}
