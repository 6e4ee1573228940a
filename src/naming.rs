//! Deterministic object names and label sets
//!
//! Every generated object name is a pure function of the instance name and the
//! object's role. Nothing here touches the network or process-wide state.

use std::collections::BTreeMap;

/// Standard Kubernetes label: application name
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
/// Standard Kubernetes label: instance name
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
/// Standard Kubernetes label: role within the instance
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
/// Standard Kubernetes label: managing controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Shard index, only on shard pods and workloads
pub const LABEL_SHARD: &str = "mongo-operator.dev/shard";

/// Fixed value of [`LABEL_NAME`]
pub const APP_NAME: &str = "mongodb";
/// Fixed value of [`LABEL_MANAGED_BY`]
pub const MANAGED_BY: &str = "mongo-operator";

/// Database port on every mongod and mongos
pub const MONGODB_PORT: i32 = 27017;
/// Exporter port when monitoring is enabled
pub const METRICS_PORT: i32 = 9216;

/// Role of an object within an instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Component {
    /// Members of a standalone replica set
    ReplicaSet,
    /// Config server replica set of a sharded cluster
    ConfigServer,
    /// One shard replica set
    Shard,
    /// Routing tier
    Mongos,
    /// Objects shared by every component of a sharded cluster
    Cluster,
    /// Backup and restore jobs
    Backup,
}

impl Component {
    /// Label value for this role
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::ReplicaSet => "replicaset",
            Component::ConfigServer => "configserver",
            Component::Shard => "shard",
            Component::Mongos => "mongos",
            Component::Cluster => "cluster",
            Component::Backup => "backup",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client service name
pub fn client_service_name(instance: &str) -> String {
    instance.to_string()
}

/// Headless service name
pub fn headless_service_name(instance: &str) -> String {
    format!("{instance}-headless")
}

/// Keyfile secret name
pub fn keyfile_secret_name(instance: &str) -> String {
    format!("{instance}-keyfile")
}

/// Scripts config map name
pub fn scripts_config_map_name(instance: &str) -> String {
    format!("{instance}-scripts")
}

/// Replica set workload name
pub fn replica_set_workload_name(instance: &str) -> String {
    instance.to_string()
}

/// Config server workload name
pub fn config_server_name(instance: &str) -> String {
    format!("{instance}-cfg")
}

/// Shard workload name
pub fn shard_name(instance: &str, index: u32) -> String {
    format!("{instance}-shard-{index}")
}

/// Recover the shard index from a name produced by [`shard_name`]
pub fn shard_index(name: &str, instance: &str) -> Option<u32> {
    name.strip_prefix(instance)?
        .strip_prefix("-shard-")?
        .parse()
        .ok()
}

/// Routing tier deployment name
pub fn mongos_name(instance: &str) -> String {
    format!("{instance}-mongos")
}

/// TLS certificate and secret name
pub fn tls_secret_name(instance: &str) -> String {
    format!("{instance}-tls")
}

/// ServiceMonitor name
pub fn service_monitor_name(instance: &str) -> String {
    format!("{instance}-metrics")
}

/// Backup CronJob and PVC name
pub fn backup_name(instance: &str) -> String {
    format!("{instance}-backup")
}

/// Restore Job name
pub fn restore_name(instance: &str) -> String {
    format!("{instance}-restore")
}

/// The four labels carried by every generated object
pub fn labels(instance: &str, component: Component) -> BTreeMap<String, String> {
    let mut labels = instance_selector(instance);
    labels.insert(LABEL_COMPONENT.to_string(), component.as_str().to_string());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels
}

/// Labels for shard objects: the standard four plus the shard index
pub fn shard_labels(instance: &str, index: u32) -> BTreeMap<String, String> {
    let mut labels = labels(instance, Component::Shard);
    labels.insert(LABEL_SHARD.to_string(), index.to_string());
    labels
}

/// Selector matching every pod of an instance
pub fn instance_selector(instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), APP_NAME.to_string()),
        (LABEL_INSTANCE.to_string(), instance.to_string()),
    ])
}

/// Selector matching the pods of one component
pub fn component_selector(instance: &str, component: Component) -> BTreeMap<String, String> {
    let mut selector = instance_selector(instance);
    selector.insert(LABEL_COMPONENT.to_string(), component.as_str().to_string());
    selector
}

/// Selector matching the pods of one shard
pub fn shard_selector(instance: &str, index: u32) -> BTreeMap<String, String> {
    let mut selector = component_selector(instance, Component::Shard);
    selector.insert(LABEL_SHARD.to_string(), index.to_string());
    selector
}

/// Stable DNS address of one StatefulSet member, as registered in the replica set
pub fn member_host(workload: &str, ordinal: u32, instance: &str, namespace: &str) -> String {
    format!(
        "{workload}-{ordinal}.{}.{namespace}.svc.cluster.local:{MONGODB_PORT}",
        headless_service_name(instance)
    )
}

/// Addresses of members `0..count` of a StatefulSet
pub fn member_hosts(workload: &str, count: u32, instance: &str, namespace: &str) -> Vec<String> {
    (0..count)
        .map(|ordinal| member_host(workload, ordinal, instance, namespace))
        .collect()
}

/// Recover the pod ordinal from a member address produced by [`member_host`]
pub fn member_ordinal(host: &str, workload: &str) -> Option<u32> {
    let pod = host.split('.').next()?;
    pod.strip_prefix(workload)?.strip_prefix('-')?.parse().ok()
}

/// Pod name of a StatefulSet member
pub fn member_pod_name(workload: &str, ordinal: u32) -> String {
    format!("{workload}-{ordinal}")
}
