//! Sharded cluster topology
//!
//! Strict bootstrap order: config servers serving, then every shard serving,
//! then the routers ready, then shard registration through a router. Shards
//! beyond the desired count are drained with `removeShard` before their
//! StatefulSet is deleted; their volume claims are kept.

use std::collections::BTreeSet;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use super::apply::ensure_workload;
use super::client::{selector_string, ObjectKey};
use super::members::{reconcile_set, statefulset_selector, MemberSet, SetProgress};
use super::status::{forget_initialized, Outcome};
use super::Context;
use crate::admin::{AdminTarget, ShardInfo, ShardRemoval};
use crate::crd::{InstancePhase, MongoDB, MongoDBStatus, ShardedSpec};
use crate::events::{actions, reasons};
use crate::naming::{
    component_selector, config_server_name, member_hosts, mongos_name, shard_index, shard_name,
    Component,
};
use crate::resources::{instance_namespace, DesiredObjects, MONGOS_CONTAINER};
use crate::Error;

fn waiting_phase(bootstrapped: bool) -> InstancePhase {
    if bootstrapped {
        InstancePhase::Scaling
    } else {
        InstancePhase::Provisioning
    }
}

fn missing(what: &str) -> Error {
    Error::internal_with_context("sharded", format!("no {what} built for sharded cluster"))
}

/// Connection string `addShard` expects: `<rs>/<host>,<host>`
pub fn shard_connection_string(db: &MongoDB, sharded: &ShardedSpec, index: u32) -> String {
    let instance = db.name_any();
    let name = shard_name(&instance, index);
    let hosts = member_hosts(
        &name,
        sharded.shards.members_per_shard,
        &instance,
        &instance_namespace(db),
    );
    format!("{name}/{}", hosts.join(","))
}

/// Shards registered with the routers that the spec no longer wants
pub fn surplus_shards<'a>(
    registered: &'a [ShardInfo],
    instance: &str,
    count: u32,
) -> Vec<&'a ShardInfo> {
    registered
        .iter()
        .filter(|s| shard_index(&s.id, instance).is_some_and(|i| i >= count))
        .collect()
}

/// One pass over a sharded instance whose shared objects are in place
pub async fn reconcile_sharded(
    ctx: &Context,
    db: &MongoDB,
    sharded: &ShardedSpec,
    objects: DesiredObjects,
    status: &mut MongoDBStatus,
    bootstrapped: bool,
) -> Result<Outcome, Error> {
    let instance = db.name_any();
    let mut statefulsets = objects.statefulsets.into_iter();

    let cfg_name = config_server_name(&instance);
    let cfg_statefulset = statefulsets.next().ok_or_else(|| missing("config server"))?;
    let cfg = reconcile_set(
        ctx,
        db,
        member_set(cfg_name.clone(), sharded.config_server.members, true, cfg_statefulset),
        status,
    )
    .await?;
    if !cfg.is_serving() {
        return Ok(cfg.outcome(&cfg_name, bootstrapped));
    }

    let mut healthy = cfg.healthy().unwrap_or(0);
    let mut holdback = (!matches!(cfg, SetProgress::Ready { .. }))
        .then(|| cfg.outcome(&cfg_name, bootstrapped));
    let mut not_serving = None;

    for (index, statefulset) in (0..sharded.shards.count).zip(statefulsets) {
        let name = shard_name(&instance, index);
        let progress = reconcile_set(
            ctx,
            db,
            member_set(name.clone(), sharded.shards.members_per_shard, false, statefulset),
            status,
        )
        .await?;
        healthy += progress.healthy().unwrap_or(0);
        if !progress.is_serving() {
            not_serving.get_or_insert_with(|| progress.outcome(&name, bootstrapped));
        } else if holdback.is_none() && !matches!(progress, SetProgress::Ready { .. }) {
            holdback = Some(progress.outcome(&name, bootstrapped));
        }
    }
    if let Some(outcome) = not_serving {
        return Ok(outcome);
    }

    let mongos = objects
        .deployments
        .into_iter()
        .next()
        .ok_or_else(|| missing("mongos deployment"))?;
    let readiness = ensure_workload(ctx, &mongos).await?;
    let namespace = instance_namespace(db);
    let routers = ctx
        .kube
        .ready_pods(
            &namespace,
            &selector_string(&component_selector(&instance, Component::Mongos)),
        )
        .await?;
    let Some(router) = routers.into_iter().next().filter(|_| readiness.is_ready()) else {
        return Ok(Outcome::new(
            waiting_phase(bootstrapped),
            "WaitingForRouters",
            format!(
                "{}: {}/{} routers ready",
                mongos_name(&instance),
                readiness.ready,
                readiness.desired
            ),
        ));
    };
    let target = AdminTarget::new(namespace, router, MONGOS_CONTAINER).with_tls(db.spec.tls_enabled());

    let registered = ctx.admin.list_shards(&target).await?;
    let registered_ids: BTreeSet<&str> = registered.iter().map(|s| s.id.as_str()).collect();

    if let Some(outcome) =
        register_missing(ctx, db, sharded, &target, &registered_ids, bootstrapped).await?
    {
        return Ok(outcome);
    }

    let draining = drain_surplus(ctx, db, sharded, &target, &registered, status).await?;
    remove_unregistered(ctx, db, sharded, &registered_ids, status).await?;

    status.registered_shards = registered
        .iter()
        .map(|s| s.id.clone())
        .filter(|id| !draining.completed.contains(id))
        .collect();
    status.registered_shards.sort();

    if let Some(message) = draining.in_progress {
        return Ok(Outcome::new(InstancePhase::Scaling, "DrainingShards", message));
    }
    if let Some(outcome) = holdback {
        return Ok(outcome);
    }

    Ok(Outcome::new(
        InstancePhase::Ready,
        reasons::INSTANCE_READY,
        format!(
            "{} shards registered, {healthy} members healthy",
            sharded.shards.count
        ),
    )
    .with_ready_members(healthy))
}

fn member_set(name: String, members: u32, config_server: bool, statefulset: StatefulSet) -> MemberSet {
    MemberSet {
        replica_set: name.clone(),
        workload: name,
        members,
        config_server,
        selector: statefulset_selector(&statefulset),
        statefulset,
    }
}

async fn register_missing(
    ctx: &Context,
    db: &MongoDB,
    sharded: &ShardedSpec,
    target: &AdminTarget,
    registered: &BTreeSet<&str>,
    bootstrapped: bool,
) -> Result<Option<Outcome>, Error> {
    let instance = db.name_any();
    let mut added = Vec::new();

    for index in 0..sharded.shards.count {
        let name = shard_name(&instance, index);
        if registered.contains(name.as_str()) {
            continue;
        }
        if !ctx
            .kube
            .instance_live(&instance_namespace(db), &instance)
            .await?
        {
            info!("instance deleted, skipping shard registration");
            break;
        }
        ctx.admin
            .add_shard(target, &shard_connection_string(db, sharded, index))
            .await?;
        info!(shard = %name, "shard registered");
        ctx.events
            .publish(
                &db.object_ref(&()),
                EventType::Normal,
                reasons::SHARD_ADDED,
                actions::INITIALIZE,
                Some(format!("Registered shard {name}")),
            )
            .await;
        added.push(name);
    }

    if added.is_empty() {
        return Ok(None);
    }
    let phase = if bootstrapped {
        InstancePhase::Scaling
    } else {
        InstancePhase::Initializing
    };
    Ok(Some(Outcome::new(
        phase,
        "RegisteringShards",
        format!("registered {}", added.join(", ")),
    )))
}

#[derive(Default)]
struct Draining {
    in_progress: Option<String>,
    completed: Vec<String>,
}

async fn drain_surplus(
    ctx: &Context,
    db: &MongoDB,
    sharded: &ShardedSpec,
    target: &AdminTarget,
    registered: &[ShardInfo],
    status: &mut MongoDBStatus,
) -> Result<Draining, Error> {
    let instance = db.name_any();
    let mut draining = Draining::default();

    // One shard at a time; the balancer drains them sequentially anyway
    let Some(shard) = surplus_shards(registered, &instance, sharded.shards.count)
        .into_iter()
        .next()
    else {
        return Ok(draining);
    };

    if !ctx
        .kube
        .instance_live(&instance_namespace(db), &instance)
        .await?
    {
        info!("instance deleted, skipping shard removal");
        return Ok(draining);
    }

    match ctx.admin.remove_shard(target, &shard.id).await? {
        ShardRemoval::Draining { remaining_chunks } => {
            if !shard.draining {
                ctx.events
                    .publish(
                        &db.object_ref(&()),
                        EventType::Normal,
                        reasons::SHARD_DRAINING,
                        actions::SCALE,
                        Some(format!("Draining shard {}", shard.id)),
                    )
                    .await;
            }
            let remaining = remaining_chunks
                .map(|c| format!(", {c} chunks remaining"))
                .unwrap_or_default();
            debug!(shard = %shard.id, ?remaining_chunks, "shard draining");
            draining.in_progress = Some(format!("draining {}{remaining}", shard.id));
        }
        ShardRemoval::Completed => {
            delete_shard_workload(ctx, db, &shard.id, status).await?;
            ctx.events
                .publish(
                    &db.object_ref(&()),
                    EventType::Normal,
                    reasons::SHARD_REMOVED,
                    actions::SCALE,
                    Some(format!("Removed shard {}", shard.id)),
                )
                .await;
            draining.completed.push(shard.id.clone());
            draining.in_progress = Some(format!("removed {}", shard.id));
        }
    }
    Ok(draining)
}

/// Delete surplus shard workloads that never got registered.
///
/// Candidates are the live shard StatefulSets plus every shard the status
/// remembers, so a shard whose pods never came up is removed too.
async fn remove_unregistered(
    ctx: &Context,
    db: &MongoDB,
    sharded: &ShardedSpec,
    registered: &BTreeSet<&str>,
    status: &mut MongoDBStatus,
) -> Result<(), Error> {
    let instance = db.name_any();
    let mut known: BTreeSet<String> = ctx
        .kube
        .list_names(
            "apps/v1",
            "StatefulSet",
            &instance_namespace(db),
            &selector_string(&component_selector(&instance, Component::Shard)),
        )
        .await?
        .into_iter()
        .collect();
    known.extend(
        status
            .initialized_replica_sets
            .iter()
            .chain(status.registered_shards.iter())
            .cloned(),
    );

    for name in known {
        let surplus = shard_index(&name, &instance).is_some_and(|i| i >= sharded.shards.count);
        if surplus && !registered.contains(name.as_str()) {
            delete_shard_workload(ctx, db, &name, status).await?;
        }
    }
    Ok(())
}

async fn delete_shard_workload(
    ctx: &Context,
    db: &MongoDB,
    name: &str,
    status: &mut MongoDBStatus,
) -> Result<(), Error> {
    let key = ObjectKey::new("apps/v1", "StatefulSet", instance_namespace(db), name);
    ctx.kube.delete(&key).await?;
    forget_initialized(status, name);
    info!(object = %key, "deleted surplus shard workload, volume claims kept");
    Ok(())
}
