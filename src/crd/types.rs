//! Shared types for the MongoDB CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default repository used when no explicit image is set
pub const DEFAULT_MONGODB_REPOSITORY: &str = "mongo";
/// Default exporter image
pub const DEFAULT_EXPORTER_IMAGE: &str = "percona/mongodb_exporter:0.40";
/// Default data directory inside the database container
pub const DEFAULT_DATA_DIR: &str = "/data/db";
/// Default volume size
pub const DEFAULT_STORAGE_SIZE: &str = "10Gi";

/// Database version and optional image override
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VersionSpec {
    /// MongoDB server version (e.g. "7.0.5")
    pub version: String,

    /// Explicit image; used verbatim when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl VersionSpec {
    /// Image for the database and routing containers.
    ///
    /// An explicit image wins, otherwise `<repository>:<version>`.
    pub fn resolve_image(&self, default_repository: &str) -> String {
        match self.image.as_deref() {
            Some(image) if !image.is_empty() => image.to_string(),
            _ => format!("{}:{}", default_repository, self.version),
        }
    }
}

/// Persistent storage for one group of members
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Requested volume size (Kubernetes quantity)
    #[serde(default = "default_storage_size")]
    pub size: String,

    /// Storage class; empty or absent uses the cluster default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Mount path of the data volume
    #[serde(default = "default_data_dir")]
    pub data_dir_path: String,
}

fn default_storage_size() -> String {
    DEFAULT_STORAGE_SIZE.to_string()
}

fn default_data_dir() -> String {
    DEFAULT_DATA_DIR.to_string()
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            storage_class_name: None,
            data_dir_path: default_data_dir(),
        }
    }
}

impl StorageSpec {
    /// Storage class to put on a claim, `None` for empty or absent
    pub fn storage_class(&self) -> Option<&str> {
        self.storage_class_name
            .as_deref()
            .filter(|class| !class.is_empty())
    }
}

/// Replica set topology
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSetSpec {
    /// Number of replica set members
    pub members: u32,

    /// Replica set name used in bootstrap commands (defaults to the instance name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_set_name: Option<String>,
}

/// Sharded cluster topology
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardedSpec {
    /// Config server replica set
    pub config_server: ConfigServerSpec,
    /// Shard replica sets
    pub shards: ShardsSpec,
    /// Routing tier
    pub mongos: MongosSpec,
}

/// Config server replica set
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigServerSpec {
    /// Number of config server members
    pub members: u32,
    /// Storage for each config server member
    #[serde(default)]
    pub storage: StorageSpec,
}

/// Shard replica sets
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardsSpec {
    /// Number of shards
    pub count: u32,
    /// Members in each shard replica set
    pub members_per_shard: u32,
    /// Storage for each shard member
    #[serde(default)]
    pub storage: StorageSpec,
}

/// Routing tier
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MongosSpec {
    /// Number of mongos replicas
    pub replicas: u32,
}

/// Metrics exporter sidecar
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSpec {
    /// Add the exporter sidecar and metrics port
    #[serde(default)]
    pub enabled: bool,

    /// Exporter image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Also create a Prometheus Operator ServiceMonitor
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub service_monitor: bool,
}

/// Client service type
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ServiceType {
    /// Routable cluster-internal virtual IP
    #[default]
    ClusterIP,
    /// Exposed on every node
    NodePort,
    /// Provisioned cloud load balancer
    LoadBalancer,
}

impl ServiceType {
    /// Kubernetes `spec.type` value
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::ClusterIP => "ClusterIP",
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
        }
    }
}

/// Client service exposure
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExposureSpec {
    /// Service type of the client service
    #[serde(default, rename = "type")]
    pub type_: ServiceType,
}

/// cert-manager issuer reference
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    /// Issuer name
    pub name: String,
    /// `Issuer` or `ClusterIssuer`
    #[serde(default = "default_issuer_kind")]
    pub kind: String,
}

fn default_issuer_kind() -> String {
    "Issuer".to_string()
}

/// Transport encryption
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Require TLS on every member and router
    #[serde(default)]
    pub enabled: bool,

    /// Issue the serving certificate through cert-manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_ref: Option<IssuerRef>,

    /// Existing `kubernetes.io/tls` secret (with `ca.crt`) to use instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// Scheduled logical backups
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Run the backup CronJob
    #[serde(default)]
    pub enabled: bool,

    /// Cron schedule
    #[serde(default = "default_backup_schedule")]
    pub schedule: String,

    /// Volume receiving the archives
    #[serde(default)]
    pub storage: StorageSpec,

    /// Image providing `mongodump` (defaults to the database image)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

fn default_backup_schedule() -> String {
    "0 2 * * *".to_string()
}

/// One-shot restore from a backup archive
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Archive file name on the backup volume
    pub archive: String,

    /// Image providing `mongorestore` (defaults to the database image)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Instance lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum InstancePhase {
    /// Spec observed, nothing applied yet
    #[default]
    Pending,
    /// Objects applied, waiting for workloads to become ready
    Provisioning,
    /// Issuing bootstrap commands
    Initializing,
    /// Membership or shard count is changing
    Scaling,
    /// Healthy and converged
    Ready,
    /// Quorum lost or retry budget exhausted
    Degraded,
    /// Fatal error, waiting for a spec change
    Failed,
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Scaling => write!(f, "Scaling"),
            Self::Ready => write!(f, "Ready"),
            Self::Degraded => write!(f, "Degraded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}
