//! StatefulSets for replica set members, config servers and shards

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;

use super::pod::{data_claim_template, database_container, pod_template, MemberRole};
use super::{owned_meta, replicas};
use crate::crd::{MongoDB, ReplicaSetSpec, ShardedSpec, StorageSpec};
use crate::naming::{
    component_selector, config_server_name, headless_service_name, labels,
    replica_set_workload_name, shard_labels, shard_name, shard_selector, Component,
};

struct MemberSet<'a> {
    name: String,
    replica_set_name: String,
    role: MemberRole,
    members: u32,
    storage: &'a StorageSpec,
    labels: BTreeMap<String, String>,
    selector: BTreeMap<String, String>,
}

fn build(db: &MongoDB, set: MemberSet<'_>) -> StatefulSet {
    let instance = db.name_any();
    let container = database_container(db, &set.replica_set_name, set.role, set.storage);

    StatefulSet {
        metadata: owned_meta(db, set.name, set.labels.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas(set.members)),
            service_name: Some(headless_service_name(&instance)),
            pod_management_policy: Some("Parallel".to_string()),
            selector: LabelSelector {
                match_labels: Some(set.selector),
                ..Default::default()
            },
            template: pod_template(db, set.labels, container),
            volume_claim_templates: Some(vec![data_claim_template(set.storage)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Members of a standalone replica set
pub fn build_replica_set_statefulset(db: &MongoDB, rs: &ReplicaSetSpec) -> StatefulSet {
    let instance = db.name_any();
    build(
        db,
        MemberSet {
            name: replica_set_workload_name(&instance),
            replica_set_name: db.spec.replica_set_name(&instance),
            role: MemberRole::ReplicaSet,
            members: rs.members,
            storage: &db.spec.storage,
            labels: labels(&instance, Component::ReplicaSet),
            selector: component_selector(&instance, Component::ReplicaSet),
        },
    )
}

/// Config server replica set of a sharded cluster
pub fn build_config_server_statefulset(db: &MongoDB, sharded: &ShardedSpec) -> StatefulSet {
    let instance = db.name_any();
    let name = config_server_name(&instance);
    build(
        db,
        MemberSet {
            replica_set_name: name.clone(),
            name,
            role: MemberRole::ConfigServer,
            members: sharded.config_server.members,
            storage: &sharded.config_server.storage,
            labels: labels(&instance, Component::ConfigServer),
            selector: component_selector(&instance, Component::ConfigServer),
        },
    )
}

/// One shard replica set, indexed from zero
pub fn build_shard_statefulset(db: &MongoDB, sharded: &ShardedSpec, index: u32) -> StatefulSet {
    let instance = db.name_any();
    let name = shard_name(&instance, index);
    build(
        db,
        MemberSet {
            replica_set_name: name.clone(),
            name,
            role: MemberRole::Shard,
            members: sharded.shards.members_per_shard,
            storage: &sharded.shards.storage,
            labels: shard_labels(&instance, index),
            selector: shard_selector(&instance, index),
        },
    )
}
