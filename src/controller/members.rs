//! One replica set: workload rollout, initiation and membership
//!
//! Used for the standalone replica set, the config server replica set and
//! every shard. Each call performs at most one administrative mutation and
//! reports where the set stands.

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::apply::ensure_workload;
use super::client::{key_of, selector_string};
use super::scaling::{plan_member_change, safe_replicas, MemberAction};
use super::status::{forget_initialized, mark_initialized, Outcome};
use super::Context;
use crate::admin::{AdminTarget, InitiateOutcome, ReplicaSetStatus};
use crate::crd::{InstancePhase, MongoDB, MongoDBStatus};
use crate::events::{actions, reasons};
use crate::naming::{member_hosts, member_ordinal, member_pod_name};
use crate::resources::{instance_namespace, DATABASE_CONTAINER};
use crate::Error;

/// A replica set managed by one StatefulSet
pub struct MemberSet {
    /// StatefulSet name
    pub workload: String,
    /// Replica set name used in commands
    pub replica_set: String,
    /// Desired member count
    pub members: u32,
    /// Whether this is the config server replica set
    pub config_server: bool,
    /// Label selector matching exactly this set's pods
    pub selector: String,
    /// Desired StatefulSet
    pub statefulset: StatefulSet,
}

/// Where a replica set stands after a pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetProgress {
    /// Pods not ready yet
    Waiting {
        /// Ready pods
        ready: u32,
        /// Desired pods
        desired: u32,
    },
    /// Initiation issued or awaiting a primary
    Initializing(String),
    /// Membership change in flight
    Scaling(String),
    /// Converged with quorum
    Ready {
        /// Healthy data-bearing members
        healthy: u32,
    },
    /// Initiated but without quorum or primary
    Degraded {
        /// Healthy data-bearing members
        healthy: u32,
        /// Registered members
        registered: u32,
    },
}

impl SetProgress {
    /// Whether the set accepts traffic and later stages may proceed
    pub fn is_serving(&self) -> bool {
        matches!(
            self,
            SetProgress::Ready { .. } | SetProgress::Scaling(_) | SetProgress::Degraded { .. }
        )
    }

    /// Healthy member count, when known
    pub fn healthy(&self) -> Option<u32> {
        match self {
            SetProgress::Ready { healthy } | SetProgress::Degraded { healthy, .. } => {
                Some(*healthy)
            }
            _ => None,
        }
    }

    /// Instance outcome when this set is the one holding the instance back.
    ///
    /// Waiting for pods reads as `Provisioning` until the instance has
    /// bootstrapped once and as `Scaling` afterwards.
    pub fn outcome(&self, label: &str, bootstrapped: bool) -> Outcome {
        match self {
            SetProgress::Waiting { ready, desired } => {
                let phase = if bootstrapped {
                    InstancePhase::Scaling
                } else {
                    InstancePhase::Provisioning
                };
                Outcome::new(
                    phase,
                    "WaitingForPods",
                    format!("{label}: {ready}/{desired} pods ready"),
                )
            }
            SetProgress::Initializing(message) => {
                Outcome::new(InstancePhase::Initializing, "Initializing", message.clone())
            }
            SetProgress::Scaling(message) => {
                Outcome::new(InstancePhase::Scaling, "ScalingMembers", message.clone())
            }
            SetProgress::Ready { healthy } => Outcome::new(
                InstancePhase::Ready,
                reasons::INSTANCE_READY,
                format!("{label}: {healthy} members healthy"),
            )
            .with_ready_members(*healthy),
            SetProgress::Degraded {
                healthy,
                registered,
            } => Outcome::new(
                InstancePhase::Degraded,
                QUORUM_LOST,
                format!("{label}: {healthy}/{registered} members healthy"),
            )
            .with_ready_members(*healthy),
        }
    }
}

/// Reason recorded while a replica set lacks quorum or a primary
pub const QUORUM_LOST: &str = "QuorumLost";

fn target(db: &MongoDB, pod: String) -> AdminTarget {
    AdminTarget::new(instance_namespace(db), pod, DATABASE_CONTAINER).with_tls(db.spec.tls_enabled())
}

/// Query replica set status from the first ready pod that answers
async fn read_status(
    ctx: &Context,
    db: &MongoDB,
    pods: &[String],
) -> Result<Option<ReplicaSetStatus>, Error> {
    let mut last_error = None;
    for pod in pods {
        match ctx.admin.status(&target(db, pod.clone())).await {
            Ok(status) => return Ok(status),
            Err(e) if e.is_retryable() => {
                debug!(pod = %pod, error = %e, "status query failed, trying next member");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        Error::internal_with_context("members", "no ready pod to query replica set status")
    }))
}

/// Replica count of the StatefulSet as it exists now, 0 when absent
async fn live_replicas(ctx: &Context, statefulset: &StatefulSet) -> Result<u32, Error> {
    let live = ctx.kube.get(&key_of(statefulset)).await?;
    Ok(live
        .as_ref()
        .and_then(|s| s.pointer("/spec/replicas"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0) as u32)
}

/// Re-check the instance right before a mutating command
async fn still_live(ctx: &Context, db: &MongoDB) -> Result<bool, Error> {
    let live = ctx
        .kube
        .instance_live(&instance_namespace(db), &db.name_any())
        .await?;
    if !live {
        info!("instance deleted, skipping administrative command");
    }
    Ok(live)
}

fn primary_pod(status: &ReplicaSetStatus, workload: &str) -> Option<String> {
    status
        .members
        .iter()
        .find(|m| m.is_primary())
        .and_then(|m| member_ordinal(&m.host, workload))
        .map(|ordinal| member_pod_name(workload, ordinal))
}

/// Drive one replica set a step closer to its desired membership
pub async fn reconcile_set(
    ctx: &Context,
    db: &MongoDB,
    set: MemberSet,
    status: &mut MongoDBStatus,
) -> Result<SetProgress, Error> {
    let instance = db.name_any();
    let namespace = instance_namespace(db);
    let desired_hosts = member_hosts(&set.workload, set.members, &instance, &namespace);
    let pods = ctx.kube.ready_pods(&namespace, &set.selector).await?;

    let initialized = status.is_initialized(&set.replica_set);
    let live_status = if initialized && !pods.is_empty() {
        read_status(ctx, db, &pods).await?
    } else {
        None
    };
    if initialized && live_status.is_none() && !pods.is_empty() {
        warn!(replica_set = %set.replica_set, "replica set reports uninitialized, bootstrapping again");
        forget_initialized(status, &set.replica_set);
    }

    let registered = live_status
        .as_ref()
        .map(ReplicaSetStatus::hosts)
        .unwrap_or_default();
    let mut replicas = safe_replicas(set.members, &registered, &set.workload);
    if initialized && pods.is_empty() {
        // Membership is unknown while no member answers: never shrink
        replicas = replicas.max(live_replicas(ctx, &set.statefulset).await?);
    }

    let mut statefulset = set.statefulset;
    if let Some(spec) = statefulset.spec.as_mut() {
        spec.replicas = Some(crate::resources::replicas(replicas));
    }
    let readiness = ensure_workload(ctx, &statefulset).await?;

    let Some(live_status) = live_status else {
        if initialized && pods.is_empty() {
            warn!(replica_set = %set.replica_set, "no member of an initiated replica set is ready");
            return Ok(SetProgress::Degraded {
                healthy: 0,
                registered: set.members,
            });
        }
        return initialize(ctx, db, &set.workload, &set.replica_set, set.config_server, &desired_hosts, &pods, readiness.is_ready(), readiness.ready, set.members, status).await;
    };

    let healthy = live_status.healthy_count();
    let registered_count = live_status.members.len() as u32;

    match plan_member_change(&desired_hosts, &registered, readiness.ready) {
        MemberAction::InSync => {
            if live_status.has_quorum() {
                Ok(SetProgress::Ready { healthy })
            } else {
                Ok(SetProgress::Degraded {
                    healthy,
                    registered: registered_count,
                })
            }
        }
        MemberAction::WaitForPods { ready, desired } => Ok(SetProgress::Scaling(format!(
            "{}: waiting for pods before adding members ({ready}/{desired} ready)",
            set.replica_set
        ))),
        MemberAction::Add(add) => {
            change_members(ctx, db, &set.workload, &set.replica_set, &live_status, &add, &[], registered_count).await
        }
        MemberAction::Remove(remove) => {
            change_members(ctx, db, &set.workload, &set.replica_set, &live_status, &[], &remove, registered_count).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn initialize(
    ctx: &Context,
    db: &MongoDB,
    workload: &str,
    replica_set: &str,
    config_server: bool,
    hosts: &[String],
    pods: &[String],
    pods_ready: bool,
    ready: u32,
    desired: u32,
    status: &mut MongoDBStatus,
) -> Result<SetProgress, Error> {
    if !pods_ready || pods.is_empty() {
        debug!(replica_set, ready, desired, "waiting for pods before initiation");
        return Ok(SetProgress::Waiting { ready, desired });
    }

    let current = read_status(ctx, db, pods).await?;
    if let Some(existing) = current {
        info!(replica_set, members = existing.members.len(), "replica set already initiated");
        mark_initialized(status, replica_set);
        return Ok(SetProgress::Initializing(format!(
            "{replica_set}: waiting for primary"
        )));
    }

    if !still_live(ctx, db).await? {
        return Ok(SetProgress::Initializing(format!("{replica_set}: instance deleted")));
    }

    // Initiate from ordinal 0 when it is ready, so the first member seeds the set
    let seed = member_pod_name(workload, 0);
    let pod = if pods.contains(&seed) {
        seed
    } else {
        pods[0].clone()
    };
    let outcome = ctx
        .admin
        .initiate(&target(db, pod), replica_set, hosts, config_server)
        .await?;
    mark_initialized(status, replica_set);

    if outcome == InitiateOutcome::Initiated {
        info!(replica_set, members = hosts.len(), "replica set initiated");
        ctx.events
            .publish(
                &db.object_ref(&()),
                EventType::Normal,
                reasons::REPLICA_SET_INITIATED,
                actions::INITIALIZE,
                Some(format!("Initiated {replica_set} with {} members", hosts.len())),
            )
            .await;
    }

    Ok(SetProgress::Initializing(format!(
        "{replica_set}: initiated, waiting for primary"
    )))
}

#[allow(clippy::too_many_arguments)]
async fn change_members(
    ctx: &Context,
    db: &MongoDB,
    workload: &str,
    replica_set: &str,
    live: &ReplicaSetStatus,
    add: &[String],
    remove: &[String],
    registered: u32,
) -> Result<SetProgress, Error> {
    let Some(primary) = primary_pod(live, workload) else {
        warn!(replica_set, "no primary, membership change postponed");
        return Ok(SetProgress::Degraded {
            healthy: live.healthy_count(),
            registered,
        });
    };

    if !still_live(ctx, db).await? {
        return Ok(SetProgress::Scaling(format!("{replica_set}: instance deleted")));
    }

    ctx.admin.reconfigure(&target(db, primary), add, remove).await?;

    let note = format!(
        "{replica_set}: added {}, removed {} members",
        add.len(),
        remove.len()
    );
    info!(replica_set, added = add.len(), removed = remove.len(), "replica set reconfigured");
    ctx.events
        .publish(
            &db.object_ref(&()),
            EventType::Normal,
            reasons::MEMBERS_RECONFIGURED,
            actions::SCALE,
            Some(note.clone()),
        )
        .await;

    Ok(SetProgress::Scaling(note))
}

/// Selector string for the pods of a StatefulSet
pub fn statefulset_selector(statefulset: &StatefulSet) -> String {
    statefulset
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.as_ref())
        .map(selector_string)
        .unwrap_or_default()
}
