//! Kubernetes access for the reconciler
//!
//! Objects cross this seam as JSON values carrying `apiVersion` and `kind`,
//! so one trait covers typed workloads and optional CRDs (ServiceMonitor,
//! Certificate) alike, and tests can mock every call.

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    PropagationPolicy,
};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::{MongoDB, MongoDBStatus};
use crate::Error;

/// Default field manager for server-side apply
pub const FIELD_MANAGER: &str = "mongo-operator";

/// Identity of a namespaced object
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// `group/version` or `v1`
    pub api_version: String,
    /// Object kind
    pub kind: String,
    /// Namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for the given coordinates
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Read the key from a serialized object
    pub fn of(object: &Value) -> Result<Self, Error> {
        let field = |pointer: &str| {
            object
                .pointer(pointer)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::serialization(format!("object without {pointer}")))
        };
        Ok(Self {
            api_version: field("/apiVersion")?,
            kind: field("/kind")?,
            namespace: field("/metadata/namespace")?,
            name: field("/metadata/name")?,
        })
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Trait abstracting the Kubernetes operations the reconciler performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MongoKubeClient: Send + Sync {
    /// Read an object, `None` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, Error>;

    /// Server-side apply an object without forcing ownership conflicts
    async fn apply(&self, object: &Value) -> Result<(), Error>;

    /// Create an object unless it already exists.
    ///
    /// Returns `true` when this call created it.
    async fn create_if_absent(&self, object: &Value) -> Result<bool, Error>;

    /// Delete an object, leaving dependents such as PVCs in place
    async fn delete(&self, key: &ObjectKey) -> Result<(), Error>;

    /// Replace the status subresource of an instance
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MongoDBStatus,
    ) -> Result<(), Error>;

    /// Whether the instance still exists and is not being deleted
    async fn instance_live(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    /// Names of running, ready pods matching a label selector, sorted
    async fn ready_pods(&self, namespace: &str, selector: &str) -> Result<Vec<String>, Error>;

    /// Names of objects of one kind matching a label selector, sorted
    async fn list_names(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>, Error>;
}

/// Parse API version into group and version components
fn parse_api_version(api_version: &str) -> (&str, &str) {
    if let Some(idx) = api_version.rfind('/') {
        (&api_version[..idx], &api_version[idx + 1..])
    } else {
        ("", api_version)
    }
}

/// Convert a Kind to its plural resource name.
///
/// Every kind the operator manages pluralizes regularly.
fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{lower}es")
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}

fn api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
    field_manager: String,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            field_manager: FIELD_MANAGER.to_string(),
        }
    }

    /// Apply under a different field manager
    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    fn dynamic(&self, key: &ObjectKey) -> Api<DynamicObject> {
        self.dynamic_in(&key.api_version, &key.kind, &key.namespace)
    }

    fn dynamic_in(&self, api_version: &str, kind: &str, namespace: &str) -> Api<DynamicObject> {
        let ar = api_resource(api_version, kind);
        Api::namespaced_with(self.client.clone(), namespace, &ar)
    }
}

#[async_trait]
impl MongoKubeClient for KubeClientImpl {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, Error> {
        let object = self.dynamic(key).get_opt(&key.name).await?;
        object
            .map(|o| serde_json::to_value(o).map_err(Error::from))
            .transpose()
    }

    async fn apply(&self, object: &Value) -> Result<(), Error> {
        let key = ObjectKey::of(object)?;
        self.dynamic(&key)
            .patch(
                &key.name,
                &PatchParams::apply(&self.field_manager),
                &Patch::Apply(object),
            )
            .await?;
        debug!(object = %key, "applied");
        Ok(())
    }

    async fn create_if_absent(&self, object: &Value) -> Result<bool, Error> {
        let key = ObjectKey::of(object)?;
        let dynamic: DynamicObject = serde_json::from_value(object.clone())?;
        match self
            .dynamic(&key)
            .create(&PostParams::default(), &dynamic)
            .await
        {
            Ok(_) => {
                info!(object = %key, "created");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), Error> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match self.dynamic(key).delete(&key.name, &params).await {
            Ok(_) => {
                info!(object = %key, "deleted");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MongoDBStatus,
    ) -> Result<(), Error> {
        let api: Api<MongoDB> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(&self.field_manager),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn instance_live(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let api: Api<MongoDB> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .get_opt(name)
            .await?
            .is_some_and(|db| db.metadata.deletion_timestamp.is_none()))
    }

    async fn ready_pods(&self, namespace: &str, selector: &str) -> Result<Vec<String>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;

        let mut names: Vec<String> = pods
            .items
            .iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .filter(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .is_some_and(|conds| {
                        conds.iter().any(|c| c.type_ == "Ready" && c.status == "True")
                    })
            })
            .map(|pod| pod.name_any())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn list_names(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>, Error> {
        let objects = self
            .dynamic_in(api_version, kind, namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        let mut names: Vec<String> = objects.items.iter().map(|o| o.name_any()).collect();
        names.sort();
        Ok(names)
    }
}

/// Optional CRDs the operator integrates with when installed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiscoveredCrds {
    /// `servicemonitors.monitoring.coreos.com`
    pub service_monitor: bool,
    /// `certificates.cert-manager.io`
    pub certificate: bool,
}

impl DiscoveredCrds {
    /// Probe the API server for the optional CRDs
    pub async fn discover(client: Client) -> Result<Self, Error> {
        let crds: Api<CustomResourceDefinition> = Api::all(client);
        let service_monitor = crds
            .get_opt("servicemonitors.monitoring.coreos.com")
            .await?
            .is_some();
        let certificate = crds.get_opt("certificates.cert-manager.io").await?.is_some();
        info!(service_monitor, certificate, "discovered optional CRDs");
        Ok(Self {
            service_monitor,
            certificate,
        })
    }
}

/// Serialize a typed object, failing on objects without `apiVersion`/`kind`
pub fn to_object<K: serde::Serialize>(object: &K) -> Result<Value, Error> {
    let value = serde_json::to_value(object)?;
    ObjectKey::of(&value)?;
    Ok(value)
}

/// Render a label map as a selector string
pub fn selector_string(labels: &std::collections::BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Key of a typed object the builder produced
pub fn key_of<K>(object: &K) -> ObjectKey
where
    K: kube::Resource<DynamicType = ()>,
{
    ObjectKey::new(
        K::api_version(&()),
        K::kind(&()),
        object.namespace().unwrap_or_default(),
        object.name_any(),
    )
}
