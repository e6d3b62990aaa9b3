//! Type and object identities
//!
//! `TypeIdentity` keys everything that is per composite type (registrations,
//! watches, CRDs). `ObjectKey` addresses one object of a given type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Group, version and kind of a Kubernetes type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeIdentity {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl TypeIdentity {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Build from an `apiVersion` string and a kind
    ///
    /// - "apps/v1" -> group="apps", version="v1"
    /// - "v1" -> group="", version="v1" (core API)
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.rsplit_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// The `apiVersion` string for objects of this type
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Lowercase plural resource name
    pub fn plural(&self) -> String {
        pluralize(&self.kind)
    }

    /// Name of the CustomResourceDefinition serving this type
    pub fn crd_name(&self) -> String {
        format!("{}.{}", self.plural(), self.group)
    }
}

impl fmt::Display for TypeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Lowercase English plural of a kind, as the API server would register it
pub fn pluralize(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        return format!("{}es", lower);
    }
    if let Some(stem) = lower.strip_suffix('y') {
        let vowel_before = stem
            .chars()
            .last()
            .map(|c| "aeiou".contains(c))
            .unwrap_or(false);
        if !vowel_before {
            return format!("{}ies", stem);
        }
    }
    format!("{}s", lower)
}

/// Namespace/name of one object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.map(String::from),
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Key of a composite instance in its type's work queue
pub type InstanceKey = ObjectKey;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_api_version() {
        let id = TypeIdentity::from_api_version("apps/v1", "Deployment");
        assert_eq!(id.group, "apps");
        assert_eq!(id.version, "v1");
        assert_eq!(id.api_version(), "apps/v1");

        let core = TypeIdentity::from_api_version("v1", "ConfigMap");
        assert_eq!(core.group, "");
        assert_eq!(core.api_version(), "v1");
    }

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("WebApp"), "webapps");
        assert_eq!(pluralize("Policy"), "policies");
        assert_eq!(pluralize("Ingress"), "ingresses");
        assert_eq!(pluralize("Gateway"), "gateways");
        assert_eq!(pluralize("Box"), "boxes");
    }

    #[test]
    fn test_crd_name() {
        let id = TypeIdentity::new("krg.dev", "v1alpha1", "WebApp");
        assert_eq!(id.crd_name(), "webapps.krg.dev");
        assert_eq!(id.to_string(), "krg.dev/v1alpha1, Kind=WebApp");
    }

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::namespaced("default", "app").to_string(), "default/app");
        assert_eq!(ObjectKey::cluster("node-1").to_string(), "node-1");
    }
}
