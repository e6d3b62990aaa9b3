//! Cluster access through the Kubernetes API
//!
//! Every type is handled as a `DynamicObject`; group/version/kind are
//! resolved to API resources through discovery, once per type.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    core::{GroupVersionKind, TypeMeta},
    discovery::{self, ApiCapabilities, ApiResource, Scope},
    runtime::watcher,
};
use krg_core::{ObjectKey, TypeIdentity};
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;

use super::{ClusterClient, WatchEvent, object_key};
use crate::error::{ControllerError, Result};
use crate::labels;

/// Kubernetes-backed cluster client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    /// Discovery results per type
    resources: std::sync::Arc<DashMap<TypeIdentity, (ApiResource, ApiCapabilities)>>,
}

impl KubeCluster {
    /// Connect using the ambient kubeconfig or in-cluster configuration
    pub async fn new() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::with_client(client))
    }

    /// Create with an existing Kubernetes client
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            resources: Default::default(),
        }
    }

    /// Get the underlying Kubernetes client
    pub fn kube_client(&self) -> &Client {
        &self.client
    }

    /// Resolve a type to its API resource, caching the answer
    async fn resolve(&self, identity: &TypeIdentity) -> Result<(ApiResource, ApiCapabilities)> {
        if let Some(entry) = self.resources.get(identity) {
            return Ok(entry.value().clone());
        }

        let gvk = GroupVersionKind::gvk(&identity.group, &identity.version, &identity.kind);
        let resolved = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| match e {
                kube::Error::Discovery(_) => ControllerError::UnknownType(identity.to_string()),
                kube::Error::Api(resp) if resp.code == 404 => {
                    ControllerError::UnknownType(identity.to_string())
                }
                other => ControllerError::Api(other),
            })?;

        tracing::debug!(%identity, plural = %resolved.0.plural, "resolved API resource");
        self.resources.insert(identity.clone(), resolved.clone());
        Ok(resolved)
    }

    /// Api handle for one namespace (or the whole cluster)
    async fn api(
        &self,
        identity: &TypeIdentity,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>> {
        let (resource, capabilities) = self.resolve(identity).await?;
        Ok(match namespace {
            Some(ns) if capabilities.scope == Scope::Namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        })
    }

    /// Api handle addressing `key`, namespace defaulted for namespaced types
    async fn api_for(
        &self,
        identity: &TypeIdentity,
        key: &ObjectKey,
    ) -> Result<Api<DynamicObject>> {
        let (resource, capabilities) = self.resolve(identity).await?;
        Ok(if capabilities.scope == Scope::Namespaced {
            let ns = key.namespace.as_deref().unwrap_or("default");
            Api::namespaced_with(self.client.clone(), ns, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        })
    }

    /// Parse a JSON document into a dynamic object addressed for its type
    async fn prepare(
        &self,
        identity: &TypeIdentity,
        object: &JsonValue,
    ) -> Result<(Api<DynamicObject>, String, DynamicObject)> {
        let key = object_key(object).ok_or_else(|| ControllerError::Invalid {
            kind: identity.kind.clone(),
            name: String::new(),
            message: "metadata.name is required".to_string(),
        })?;
        let mut obj: DynamicObject = serde_json::from_value(object.clone())?;
        obj.types = Some(type_meta(identity));

        let (_, capabilities) = self.resolve(identity).await?;
        if capabilities.scope == Scope::Cluster {
            obj.metadata.namespace = None;
        } else if obj.metadata.namespace.is_none() {
            obj.metadata.namespace = Some("default".to_string());
        }

        let api = self.api_for(identity, &key).await?;
        Ok((api, key.name, obj))
    }
}

fn type_meta(identity: &TypeIdentity) -> TypeMeta {
    TypeMeta {
        api_version: identity.api_version(),
        kind: identity.kind.clone(),
    }
}

/// Serialize an object, restoring apiVersion/kind that list responses omit
fn to_json(identity: &TypeIdentity, mut obj: DynamicObject) -> Result<JsonValue> {
    obj.types = Some(type_meta(identity));
    Ok(serde_json::to_value(obj)?)
}

/// Translate API status codes into the error variants the reconcilers act on
fn map_api_error(e: kube::Error, identity: &TypeIdentity, name: &str) -> ControllerError {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => ControllerError::NotFound {
            kind: identity.kind.clone(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            ControllerError::AlreadyExists {
                kind: identity.kind.clone(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 400 || resp.code == 422 => {
            ControllerError::Invalid {
                kind: identity.kind.clone(),
                name: name.to_string(),
                message: resp.message,
            }
        }
        other => ControllerError::Api(other),
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, identity: &TypeIdentity, key: &ObjectKey) -> Result<Option<JsonValue>> {
        let api = self.api_for(identity, key).await?;
        match api.get_opt(&key.name).await {
            Ok(Some(obj)) => Ok(Some(to_json(identity, obj)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(map_api_error(e, identity, &key.name)),
        }
    }

    async fn list(
        &self,
        identity: &TypeIdentity,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<JsonValue>> {
        let api = self.api(identity, namespace).await?;
        let params = ListParams::default().labels(&labels::selector_string(selector));
        let list = api.list(&params).await?;
        list.items
            .into_iter()
            .map(|obj| to_json(identity, obj))
            .collect()
    }

    async fn watch(&self, identity: &TypeIdentity) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        let api = self.api(identity, None).await?;
        let identity = identity.clone();
        let stream = watcher(api, watcher::Config::default()).filter_map(move |event| {
            let identity = identity.clone();
            async move {
                match event {
                    Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                        Some(to_json(&identity, obj).map(WatchEvent::Applied))
                    }
                    Ok(watcher::Event::Delete(obj)) => {
                        Some(to_json(&identity, obj).map(WatchEvent::Deleted))
                    }
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                    Err(e) => Some(Err(ControllerError::Watch(e.to_string()))),
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn is_namespaced(&self, identity: &TypeIdentity) -> Result<bool> {
        let (_, capabilities) = self.resolve(identity).await?;
        Ok(capabilities.scope == Scope::Namespaced)
    }

    async fn create(&self, identity: &TypeIdentity, object: &JsonValue) -> Result<JsonValue> {
        let (api, name, obj) = self.prepare(identity, object).await?;
        let created = api
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_api_error(e, identity, &name))?;
        to_json(identity, created)
    }

    async fn apply(
        &self,
        identity: &TypeIdentity,
        object: &JsonValue,
        field_manager: &str,
    ) -> Result<JsonValue> {
        let (api, name, obj) = self.prepare(identity, object).await?;
        let params = PatchParams::apply(field_manager).force();
        let applied = api
            .patch(&name, &params, &Patch::Apply(&obj))
            .await
            .map_err(|e| map_api_error(e, identity, &name))?;
        to_json(identity, applied)
    }

    async fn patch_status(
        &self,
        identity: &TypeIdentity,
        key: &ObjectKey,
        status: &JsonValue,
    ) -> Result<()> {
        let api = self.api_for(identity, key).await?;
        let patch = json!({ "status": status });
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_api_error(e, identity, &key.name))?;
        Ok(())
    }

    async fn set_finalizers(
        &self,
        identity: &TypeIdentity,
        key: &ObjectKey,
        finalizers: &[String],
    ) -> Result<()> {
        let api = self.api_for(identity, key).await?;
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        match api
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            // Already gone, nothing left to guard
            Err(kube::Error::Api(resp)) if resp.code == 404 && finalizers.is_empty() => Ok(()),
            Err(e) => Err(map_api_error(e, identity, &key.name)),
        }
    }

    async fn delete(&self, identity: &TypeIdentity, key: &ObjectKey) -> Result<()> {
        let api = self.api_for(identity, key).await?;
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(map_api_error(e, identity, &key.name)),
        }
    }

    async fn apply_crd(&self, crd: &CustomResourceDefinition, field_manager: &str) -> Result<()> {
        let name = crd.metadata.name.clone().unwrap_or_default();
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let params = PatchParams::apply(field_manager).force();
        api.patch(&name, &params, &Patch::Apply(crd))
            .await
            .map_err(|e| map_api_error(e, &super::crd_identity(), &name))?;
        Ok(())
    }

    async fn delete_crd(&self, name: &str) -> Result<()> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {}
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(e) => return Err(map_api_error(e, &super::crd_identity(), name)),
        }
        // Served types of the CRD must be rediscovered if it comes back
        self.resources.retain(|identity, _| identity.crd_name() != name);
        Ok(())
    }
}
