//! Kubernetes Events on `MongoDB` objects
//!
//! Phase transitions, initiations and membership changes show up in
//! `kubectl describe mongodb <name>`. Publishing never fails a pass; a
//! rejected event is only logged.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for Kubernetes Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `reason` (PascalCase) for the `action` taken on `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by the events.k8s.io recorder
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`, with the pod name as instance when known
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            let object = resource_ref.name.as_deref().unwrap_or_default();
            warn!(object, reason, error = %e, "event not recorded");
        }
    }
}

/// Discards every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _: &ObjectReference, _: EventType, _: &str, _: &str, _: Option<String>) {}
}

/// Keeps the reasons of published events in order, for assertions
#[cfg(test)]
#[derive(Default)]
pub struct RecordingEventPublisher {
    reasons: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingEventPublisher {
    /// Reasons published so far
    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, _: &ObjectReference, _: EventType, reason: &str, _: &str, _: Option<String>) {
        if let Ok(mut reasons) = self.reasons.lock() {
            reasons.push(reason.to_string());
        }
    }
}

/// Event reasons
pub mod reasons {
    /// First objects applied for a new instance
    pub const PROVISIONING_STARTED: &str = "ProvisioningStarted";
    /// `replSetInitiate` accepted
    pub const REPLICA_SET_INITIATED: &str = "ReplicaSetInitiated";
    /// `addShard` accepted
    pub const SHARD_ADDED: &str = "ShardAdded";
    /// `removeShard` started draining
    pub const SHARD_DRAINING: &str = "ShardDraining";
    /// Shard drained and its StatefulSet deleted
    pub const SHARD_REMOVED: &str = "ShardRemoved";
    /// Members added to or removed from a replica set
    pub const MEMBERS_RECONFIGURED: &str = "MembersReconfigured";
    /// Instance converged
    pub const INSTANCE_READY: &str = "InstanceReady";
    /// Quorum lost or retry budget exhausted
    pub const INSTANCE_DEGRADED: &str = "InstanceDegraded";
    /// Fatal error, waiting for a spec change
    pub const INSTANCE_FAILED: &str = "InstanceFailed";
    /// Restore Job succeeded
    pub const RESTORE_COMPLETED: &str = "RestoreCompleted";
}

/// Event actions
pub mod actions {
    /// Phase transitions
    pub const RECONCILE: &str = "Reconcile";
    /// Replica set initiation and shard registration
    pub const INITIALIZE: &str = "Initialize";
    /// Membership and shard count changes
    pub const SCALE: &str = "Scale";
    /// Restore from a backup archive
    pub const RESTORE: &str = "Restore";
}
