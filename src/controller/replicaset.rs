//! Standalone replica set topology

use kube::ResourceExt;

use super::members::{reconcile_set, statefulset_selector, MemberSet};
use super::status::Outcome;
use super::Context;
use crate::crd::{MongoDB, MongoDBStatus, ReplicaSetSpec};
use crate::naming::replica_set_workload_name;
use crate::resources::DesiredObjects;
use crate::Error;

/// One pass over a replica set instance whose shared objects are in place
pub async fn reconcile_replica_set(
    ctx: &Context,
    db: &MongoDB,
    rs: &ReplicaSetSpec,
    objects: DesiredObjects,
    status: &mut MongoDBStatus,
    bootstrapped: bool,
) -> Result<Outcome, Error> {
    let instance = db.name_any();
    let statefulset = objects.statefulsets.into_iter().next().ok_or_else(|| {
        Error::internal_with_context("replicaset", "no StatefulSet built for replica set")
    })?;

    let set = MemberSet {
        workload: replica_set_workload_name(&instance),
        replica_set: db.spec.replica_set_name(&instance),
        members: rs.members,
        config_server: false,
        selector: statefulset_selector(&statefulset),
        statefulset,
    };
    let label = set.replica_set.clone();

    let progress = reconcile_set(ctx, db, set, status).await?;
    Ok(progress.outcome(&label, bootstrapped))
}
