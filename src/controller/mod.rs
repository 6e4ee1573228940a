//! Reconciler for `MongoDB` instances
//!
//! Each pass observes the spec and the live objects, applies what differs,
//! waits for readiness and advances the bootstrap or scaling state machine:
//!
//! ```text
//! Pending -> Provisioning -> Initializing -> Scaling <-> Ready -> Degraded -> Failed
//! ```
//!
//! Layout:
//! - [`client`] - Kubernetes access behind the [`MongoKubeClient`] trait
//! - [`diff`] - desired-vs-live comparison and workload readiness
//! - [`apply`] - idempotent application of desired objects
//! - [`scaling`] - membership planning
//! - [`members`] - one replica set from rollout to membership
//! - [`replicaset`] / [`sharded`] - per-topology passes
//! - [`status`] - status transitions and write throttling
//! - [`reconciler`] - entry point, failure accounting and error policy

mod apply;
mod client;
mod context;
mod diff;
mod members;
mod reconciler;
mod replicaset;
mod scaling;
mod sharded;
mod status;

pub use apply::{ensure_applied, ensure_shared, ensure_typed, ensure_workload};
pub use client::{
    key_of, selector_string, to_object, DiscoveredCrds, KubeClientImpl, MongoKubeClient,
    ObjectKey, FIELD_MANAGER,
};
pub use context::{
    instance_key, Context, ContextBuilder, FailureTracker, InstanceLocks, ReconcileSettings,
};
pub use diff::{needs_apply, WorkloadReadiness};
pub use members::{SetProgress, QUORUM_LOST};
pub use reconciler::{error_policy, reconcile, RESTORE_IN_PROGRESS};
pub use scaling::{plan_member_change, safe_replicas, MemberAction};
pub use sharded::{shard_connection_string, surplus_shards};
pub use status::{Outcome, RETRY_BUDGET_EXHAUSTED};

#[cfg(test)]
mod tests;
