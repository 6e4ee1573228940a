//! Resource Builder
//!
//! Pure synthesis of every Kubernetes object a `MongoDB` instance needs.
//! No function here performs I/O; the same spec always yields the same
//! objects, except for the keyfile material which callers create only when the
//! secret does not exist yet.
//!
//! Layout:
//! - [`secret`] - keyfile secret
//! - [`service`] - headless and client services
//! - [`config_map`] - scripts shared by every pod
//! - [`pod`] - containers, volumes and pod templates
//! - [`statefulset`] - replica set, config server and shard workloads
//! - [`deployment`] - mongos routing tier

mod config_map;
mod deployment;
mod pod;
mod secret;
mod service;
mod statefulset;

pub use config_map::{build_scripts_config_map, INIT_SCRIPT_KEY, READINESS_PROBE_KEY};
pub(crate) use config_map::local_shell_flags;
pub(crate) use pod::{
    cluster_password_env, data_claim_template, tls_source_secret, CLUSTER_USER, KEYFILE_DIR, MONGODB_UID,
    TLS_SOURCE_DIR,
};
pub use deployment::build_mongos_deployment;
pub use pod::{
    exporter_image, mongod_image, DATABASE_CONTAINER, EXPORTER_CONTAINER, MONGOS_CONTAINER,
    TLS_DIR,
};
pub use secret::{build_keyfile_secret, KEYFILE_KEY};
pub use service::{build_client_service, build_headless_service};
pub use statefulset::{
    build_config_server_statefulset, build_replica_set_statefulset, build_shard_statefulset,
};

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::{MongoDB, Topology};
use crate::naming::Component;
use crate::Error;

/// Desired objects for an instance, excluding the keyfile secret.
///
/// Workloads are listed in creation order: config server before shards for
/// sharded clusters.
#[derive(Clone, Debug)]
pub struct DesiredObjects {
    /// Scripts config map
    pub config_map: ConfigMap,
    /// Headless service
    pub headless_service: Service,
    /// Client service
    pub client_service: Service,
    /// StatefulSets in creation order
    pub statefulsets: Vec<StatefulSet>,
    /// Deployments (mongos for sharded clusters)
    pub deployments: Vec<Deployment>,
}

/// Build every object for the instance's topology
pub fn build_desired_objects(db: &MongoDB) -> Result<DesiredObjects, Error> {
    let topology = db.spec.topology()?;

    let (statefulsets, deployments) = match topology {
        Topology::ReplicaSet(rs) => (vec![build_replica_set_statefulset(db, rs)], vec![]),
        Topology::Sharded(sharded) => {
            let mut statefulsets = Vec::with_capacity(sharded.shards.count as usize + 1);
            statefulsets.push(build_config_server_statefulset(db, sharded));
            for index in 0..sharded.shards.count {
                statefulsets.push(build_shard_statefulset(db, sharded, index));
            }
            (statefulsets, vec![build_mongos_deployment(db, sharded)])
        }
    };

    Ok(DesiredObjects {
        config_map: build_scripts_config_map(db),
        headless_service: build_headless_service(db),
        client_service: build_client_service(db),
        statefulsets,
        deployments,
    })
}

/// Namespace of the instance
pub fn instance_namespace(db: &MongoDB) -> String {
    db.namespace().unwrap_or_else(|| "default".to_string())
}

/// Metadata for an owned object: namespace, labels and controller owner reference
pub(crate) fn owned_meta(
    db: &MongoDB,
    name: impl Into<String>,
    labels: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(instance_namespace(db)),
        labels: Some(labels),
        owner_references: db.controller_owner_ref(&()).map(|owner| vec![owner]),
        ..Default::default()
    }
}

/// Component label for objects shared by the whole instance
pub(crate) fn shared_component(db: &MongoDB) -> Component {
    match db.spec.topology() {
        Ok(Topology::Sharded(_)) => Component::Cluster,
        _ => Component::ReplicaSet,
    }
}

/// Replica count as the Kubernetes API type
pub(crate) fn replicas(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}
