//! MongoDB Custom Resource Definition
//!
//! A `MongoDB` object describes one managed deployment: either a single
//! replica set or a sharded cluster (config servers, shards and a routing
//! tier). Exactly one of `replicaSet` and `sharded` is set.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    BackupSpec, Condition, InstancePhase, MonitoringSpec, ReplicaSetSpec, RestoreSpec,
    ServiceExposureSpec, ServiceType, ShardedSpec, StorageSpec, TlsSpec, VersionSpec,
};
use crate::Error;

/// Specification for a MongoDB deployment
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "mongo-operator.dev",
    version = "v1alpha1",
    kind = "MongoDB",
    plural = "mongodbs",
    shortname = "mdb",
    status = "MongoDBStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version.version"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyMembers"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MongoDBSpec {
    /// Server version and optional image override
    pub version: VersionSpec,

    /// Storage for replica set members
    #[serde(default)]
    pub storage: StorageSpec,

    /// Replica set topology
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_set: Option<ReplicaSetSpec>,

    /// Sharded cluster topology
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharded: Option<ShardedSpec>,

    /// Metrics exporter sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringSpec>,

    /// Client service exposure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceExposureSpec>,

    /// Transport encryption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,

    /// Scheduled backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,

    /// Restore once after the instance first becomes ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreSpec>,
}

/// The deployment shape selected by a spec
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Topology<'a> {
    /// A single replica set
    ReplicaSet(&'a ReplicaSetSpec),
    /// Config servers, shards and a routing tier
    Sharded(&'a ShardedSpec),
}

impl MongoDBSpec {
    /// Resolve the topology variant.
    ///
    /// Fails when both or neither variant is set.
    pub fn topology(&self) -> Result<Topology<'_>, Error> {
        match (&self.replica_set, &self.sharded) {
            (Some(rs), None) => Ok(Topology::ReplicaSet(rs)),
            (None, Some(sharded)) => Ok(Topology::Sharded(sharded)),
            _ => Err(Error::validation(self.topology_conflict())),
        }
    }

    fn topology_conflict(&self) -> &'static str {
        if self.replica_set.is_some() {
            "replicaSet and sharded are mutually exclusive"
        } else {
            "one of replicaSet or sharded must be set"
        }
    }

    /// Validate the spec for internal consistency
    pub fn validate(&self, instance: &str) -> Result<(), Error> {
        let topology = self
            .topology()
            .map_err(|_| Error::validation_for_field(instance, "spec", self.topology_conflict()))?;

        if self.version.version.is_empty()
            && self.version.image.as_deref().unwrap_or_default().is_empty()
        {
            return Err(Error::validation_for_field(
                instance,
                "spec.version",
                "either version or image must be set",
            ));
        }

        match topology {
            Topology::ReplicaSet(rs) => {
                require_positive(instance, "spec.replicaSet.members", rs.members)?;
                require_size(instance, "spec.storage.size", &self.storage)?;
            }
            Topology::Sharded(sharded) => {
                require_positive(
                    instance,
                    "spec.sharded.configServer.members",
                    sharded.config_server.members,
                )?;
                require_positive(instance, "spec.sharded.shards.count", sharded.shards.count)?;
                require_positive(
                    instance,
                    "spec.sharded.shards.membersPerShard",
                    sharded.shards.members_per_shard,
                )?;
                require_positive(instance, "spec.sharded.mongos.replicas", sharded.mongos.replicas)?;
                require_size(
                    instance,
                    "spec.sharded.configServer.storage.size",
                    &sharded.config_server.storage,
                )?;
                require_size(
                    instance,
                    "spec.sharded.shards.storage.size",
                    &sharded.shards.storage,
                )?;
            }
        }

        if let Some(tls) = self.tls.as_ref().filter(|t| t.enabled) {
            if tls.issuer_ref.is_none() && tls.secret_name.is_none() {
                return Err(Error::validation_for_field(
                    instance,
                    "spec.tls",
                    "TLS requires issuerRef or secretName",
                ));
            }
        }

        if let Some(backup) = self.backup.as_ref().filter(|b| b.enabled) {
            if backup.schedule.split_whitespace().count() != 5 {
                return Err(Error::validation_for_field(
                    instance,
                    "spec.backup.schedule",
                    format!("'{}' is not a five-field cron schedule", backup.schedule),
                ));
            }
        }

        if let Some(restore) = &self.restore {
            if !self.backup_enabled() {
                return Err(Error::validation_for_field(
                    instance,
                    "spec.restore",
                    "restore reads from the backup volume and requires backup to be enabled",
                ));
            }
            if restore.archive.is_empty() || restore.archive.contains('/') {
                return Err(Error::validation_for_field(
                    instance,
                    "spec.restore.archive",
                    "archive must be a plain file name on the backup volume",
                ));
            }
        }

        Ok(())
    }

    /// Replica set name for the standalone topology
    pub fn replica_set_name(&self, instance: &str) -> String {
        self.replica_set
            .as_ref()
            .and_then(|rs| rs.replica_set_name.clone())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| instance.to_string())
    }

    /// Whether the exporter sidecar is requested
    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.as_ref().is_some_and(|m| m.enabled)
    }

    /// Whether TLS is required
    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|t| t.enabled)
    }

    /// Whether scheduled backups are requested
    pub fn backup_enabled(&self) -> bool {
        self.backup.as_ref().is_some_and(|b| b.enabled)
    }

    /// Client service type
    pub fn service_type(&self) -> ServiceType {
        self.service.as_ref().map(|s| s.type_).unwrap_or_default()
    }
}

fn require_positive(instance: &str, field: &str, value: u32) -> Result<(), Error> {
    if value == 0 {
        return Err(Error::validation_for_field(
            instance,
            field,
            "must be at least 1",
        ));
    }
    Ok(())
}

fn require_size(instance: &str, field: &str, storage: &StorageSpec) -> Result<(), Error> {
    if storage.size.trim().is_empty() {
        return Err(Error::validation_for_field(instance, field, "must not be empty"));
    }
    Ok(())
}

/// Status for a MongoDB deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MongoDBStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: InstancePhase,

    /// Machine-readable reason for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the phase last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// When the status was last written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,

    /// The generation of the spec that was last processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions (a single `Ready` condition)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Healthy data-bearing members across all replica sets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_members: Option<u32>,

    /// Replica sets whose initiation has been confirmed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initialized_replica_sets: Vec<String>,

    /// Shards registered with the routing tier
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registered_shards: Vec<String>,

    /// Consecutive failed reconcile passes
    #[serde(default, skip_serializing_if = "is_zero")]
    pub consecutive_failures: u32,

    /// Whether the one-shot restore has completed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub restore_completed: bool,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl MongoDBStatus {
    /// Whether a replica set's initiation has been confirmed
    pub fn is_initialized(&self, replica_set: &str) -> bool {
        self.initialized_replica_sets.iter().any(|rs| rs == replica_set)
    }
}
