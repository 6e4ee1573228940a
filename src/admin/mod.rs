//! Cluster Administration Client
//!
//! Replica set and shard management commands issued against a live member.
//! The reconciler only talks to [`MongoAdmin`]; the production implementation
//! ([`PodExecAdmin`]) runs `mongosh` inside a member pod through the exec
//! subresource, authenticated as the internal cluster user via the keyfile.
//!
//! Idempotency conflicts are absorbed here: initiating an initiated replica
//! set, adding a registered shard or removing an unknown shard all report
//! success.

mod commands;
mod exec;

pub use exec::PodExecAdmin;

use async_trait::async_trait;
use serde::Deserialize;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Pod and container a command is executed in
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminTarget {
    /// Namespace of the pod
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container running mongod or mongos
    pub container: String,
    /// Whether the local listener requires TLS
    pub tls: bool,
}

impl AdminTarget {
    /// Target a container of a pod
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
            tls: false,
        }
    }

    /// Connect to the local listener over TLS
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }
}

impl std::fmt::Display for AdminTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)
    }
}

/// One member as reported by `replSetGetStatus`
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct MemberStatus {
    /// Registered `host:port`
    pub host: String,
    /// State string (`PRIMARY`, `SECONDARY`, `STARTUP2`, ...)
    pub state: String,
    /// Whether the member is reachable from the queried node
    pub healthy: bool,
}

impl MemberStatus {
    /// Whether this member is the primary
    pub fn is_primary(&self) -> bool {
        self.state == "PRIMARY"
    }
}

/// Live view of an initiated replica set
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ReplicaSetStatus {
    /// Replica set name
    #[serde(rename = "set")]
    pub set_name: String,
    /// Registered members
    pub members: Vec<MemberStatus>,
}

impl ReplicaSetStatus {
    /// Members currently reachable and in a data-bearing state
    pub fn healthy_count(&self) -> u32 {
        self.members
            .iter()
            .filter(|m| m.healthy && matches!(m.state.as_str(), "PRIMARY" | "SECONDARY"))
            .count() as u32
    }

    /// Whether some member is primary
    pub fn primary_present(&self) -> bool {
        self.members.iter().any(MemberStatus::is_primary)
    }

    /// Majority of registered members healthy and a primary elected
    pub fn has_quorum(&self) -> bool {
        let required = self.members.len() as u32 / 2 + 1;
        self.primary_present() && self.healthy_count() >= required
    }

    /// Registered member hosts
    pub fn hosts(&self) -> Vec<String> {
        self.members.iter().map(|m| m.host.clone()).collect()
    }
}

/// Result of an initiation attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitiateOutcome {
    /// The replica set was initiated by this call
    Initiated,
    /// The replica set had already been initiated
    AlreadyInitialized,
}

/// A shard registered with the routers
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ShardInfo {
    /// Shard id (the shard's replica set name)
    pub id: String,
    /// Connection string `<rs>/<host>,...`
    pub host: String,
    /// Whether a removal is in progress
    #[serde(default)]
    pub draining: bool,
}

/// Progress of a shard removal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardRemoval {
    /// Draining has started or is ongoing
    Draining {
        /// Chunks still to migrate, when reported
        remaining_chunks: Option<u64>,
    },
    /// The shard is no longer part of the cluster
    Completed,
}

/// Administrative operations against a live MongoDB topology
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MongoAdmin: Send + Sync {
    /// Initiate a replica set with the given member hosts.
    ///
    /// An already-initialized replica set is reported as
    /// [`InitiateOutcome::AlreadyInitialized`], never as an error.
    async fn initiate(
        &self,
        target: &AdminTarget,
        replica_set: &str,
        members: &[String],
        config_server: bool,
    ) -> Result<InitiateOutcome, Error>;

    /// Add and remove members in one reconfiguration request.
    ///
    /// Hosts already present are not added twice, absent hosts are not removed.
    async fn reconfigure(
        &self,
        target: &AdminTarget,
        add: &[String],
        remove: &[String],
    ) -> Result<(), Error>;

    /// Replica set status, `None` when the set is not initiated yet
    async fn status(&self, target: &AdminTarget) -> Result<Option<ReplicaSetStatus>, Error>;

    /// Register a shard replica set with the routers
    async fn add_shard(&self, target: &AdminTarget, connection_string: &str) -> Result<(), Error>;

    /// Shards currently registered with the routers
    async fn list_shards(&self, target: &AdminTarget) -> Result<Vec<ShardInfo>, Error>;

    /// Start or continue draining a shard
    async fn remove_shard(&self, target: &AdminTarget, shard: &str)
        -> Result<ShardRemoval, Error>;
}
