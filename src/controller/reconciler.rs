//! Reconcile entry point and error policy

use std::sync::Arc;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::apply::ensure_shared;
use super::replicaset::reconcile_replica_set;
use super::sharded::reconcile_sharded;
use super::status::{finish, has_bootstrapped, should_write, Outcome, RETRY_BUDGET_EXHAUSTED};
use super::{instance_key, Context};
use crate::adapters::{
    ensure_tls, reconcile_backup, reconcile_restore, reconcile_service_monitor, RestoreProgress,
    TlsState,
};
use crate::crd::{InstancePhase, MongoDB, MongoDBStatus, Topology};
use crate::events::{actions, reasons};
use crate::resources::{build_desired_objects, instance_namespace};
use crate::retry::backoff_delay;
use crate::Error;

/// Reason while the one-shot restore is running on a ready instance
pub const RESTORE_IN_PROGRESS: &str = "RestoreInProgress";

fn key_for(db: &MongoDB) -> String {
    instance_key(&instance_namespace(db), &db.name_any())
}

/// Reconcile a MongoDB instance
///
/// One pass applies the desired objects, advances bootstrap or scaling by at
/// most one administrative step per replica set and records the outcome in
/// the status. Passes for the same instance never overlap.
#[instrument(skip(db, ctx), fields(instance = %key_for(&db)))]
pub async fn reconcile(db: Arc<MongoDB>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = key_for(&db);

    if db.metadata.deletion_timestamp.is_some() {
        info!("instance is being deleted, owned objects are garbage collected");
        ctx.forget_instance(&key);
        return Ok(Action::await_change());
    }

    match reconcile_instance(&db, &ctx, &key).await {
        Err(e) if e.is_not_found() => {
            if ctx
                .kube
                .instance_live(&instance_namespace(&db), &db.name_any())
                .await?
            {
                return Err(e);
            }
            info!("instance no longer exists, forgetting it");
            ctx.forget_instance(&key);
            Ok(Action::await_change())
        }
        result => result,
    }
}

async fn reconcile_instance(db: &MongoDB, ctx: &Context, key: &str) -> Result<Action, Error> {
    let _guard = ctx.locks.acquire(key).await;
    let previous = db.status.as_ref();
    let generation = db.metadata.generation;

    if let Some(status) = previous {
        if status.phase == InstancePhase::Failed && status.observed_generation == generation {
            debug!("instance failed, waiting for a spec change");
            return Ok(Action::await_change());
        }
    }

    let mut working = previous.cloned().unwrap_or_default();
    match run_pass(ctx, db, &mut working).await {
        Ok(outcome) => {
            ctx.failures.reset(key);
            working.consecutive_failures = 0;
            let requeue = if outcome.is_settling() || outcome.reason == RESTORE_IN_PROGRESS {
                ctx.settings.progress_requeue
            } else {
                ctx.settings.steady_requeue
            };
            commit(ctx, db, working, &outcome).await?;
            debug!(phase = %outcome.phase, ?requeue, "pass complete");
            Ok(Action::requeue(requeue))
        }
        Err(e) if !e.is_retryable() => {
            warn!(error = %e, "fatal error, marking instance failed");
            let outcome = Outcome::new(InstancePhase::Failed, e.reason(), e.to_string());
            commit(ctx, db, working, &outcome).await?;
            Ok(Action::await_change())
        }
        Err(e) => {
            let failures = ctx.failures.record(key);
            warn!(error = %e, failures, "pass failed");
            if failures >= ctx.settings.failure_budget {
                working.consecutive_failures = failures;
                let outcome = Outcome::new(
                    InstancePhase::Degraded,
                    RETRY_BUDGET_EXHAUSTED,
                    format!("{failures} consecutive failures, last: {e}"),
                );
                if let Err(patch_error) = commit(ctx, db, working, &outcome).await {
                    warn!(error = %patch_error, "failed to record exhausted retry budget");
                }
            }
            Err(e)
        }
    }
}

/// Requeue a failed pass with exponential backoff
pub fn error_policy(db: Arc<MongoDB>, error: &Error, ctx: Arc<Context>) -> Action {
    let failures = ctx.failures.get(&key_for(&db)).max(1);
    let delay = backoff_delay(&ctx.settings.requeue_backoff, failures);
    warn!(
        ?error,
        instance = %key_for(&db),
        failures,
        delay_ms = delay.as_millis() as u64,
        "reconciliation failed, requeueing"
    );
    Action::requeue(delay)
}

async fn run_pass(ctx: &Context, db: &MongoDB, status: &mut MongoDBStatus) -> Result<Outcome, Error> {
    db.spec.validate(&db.name_any())?;
    let bootstrapped = has_bootstrapped(db.status.as_ref());

    if let TlsState::Pending(secret) = ensure_tls(ctx, db).await? {
        let phase = if bootstrapped {
            InstancePhase::Degraded
        } else {
            InstancePhase::Provisioning
        };
        return Ok(Outcome::new(
            phase,
            "WaitingForCertificate",
            format!("waiting for TLS secret {secret}"),
        ));
    }

    let objects = build_desired_objects(db)?;
    ensure_shared(ctx, db, &objects).await?;
    reconcile_service_monitor(ctx, db).await?;

    let outcome = match db.spec.topology()? {
        Topology::ReplicaSet(rs) => {
            reconcile_replica_set(ctx, db, rs, objects, status, bootstrapped).await?
        }
        Topology::Sharded(sharded) => {
            reconcile_sharded(ctx, db, sharded, objects, status, bootstrapped).await?
        }
    };

    if matches!(
        outcome.phase,
        InstancePhase::Ready | InstancePhase::Scaling | InstancePhase::Degraded
    ) {
        reconcile_backup(ctx, db).await?;
    }

    if outcome.phase != InstancePhase::Ready {
        return Ok(outcome);
    }
    match reconcile_restore(ctx, db, status).await? {
        RestoreProgress::Running => {
            let mut running = Outcome::new(
                InstancePhase::Ready,
                RESTORE_IN_PROGRESS,
                format!("{}; restore running", outcome.message),
            );
            running.ready_members = outcome.ready_members;
            Ok(running)
        }
        RestoreProgress::NotRequested | RestoreProgress::Completed => Ok(outcome),
    }
}

/// Finish the working status, write it if needed and announce phase changes
async fn commit(
    ctx: &Context,
    db: &MongoDB,
    working: MongoDBStatus,
    outcome: &Outcome,
) -> Result<(), Error> {
    let previous = db.status.as_ref();
    let now = Utc::now();
    let next = finish(previous, working, outcome, db.metadata.generation, now);

    if should_write(previous, &next, now, ctx.settings.status_refresh) {
        ctx.kube
            .patch_status(&instance_namespace(db), &db.name_any(), &next)
            .await?;
    }

    let previous_phase = previous.map(|s| s.phase).unwrap_or_default();
    if previous_phase != outcome.phase {
        info!(from = %previous_phase, to = %outcome.phase, reason = %outcome.reason, "phase changed");
        publish_transition(ctx, db, previous_phase, outcome).await;
    }
    Ok(())
}

async fn publish_transition(ctx: &Context, db: &MongoDB, from: InstancePhase, outcome: &Outcome) {
    let (type_, reason) = match outcome.phase {
        InstancePhase::Provisioning if from == InstancePhase::Pending => {
            (EventType::Normal, reasons::PROVISIONING_STARTED)
        }
        InstancePhase::Ready => (EventType::Normal, reasons::INSTANCE_READY),
        InstancePhase::Degraded => (EventType::Warning, reasons::INSTANCE_DEGRADED),
        InstancePhase::Failed => (EventType::Warning, reasons::INSTANCE_FAILED),
        _ => return,
    };
    ctx.events
        .publish(
            &db.object_ref(&()),
            type_,
            reason,
            actions::RECONCILE,
            Some(outcome.message.clone()),
        )
        .await;
}
