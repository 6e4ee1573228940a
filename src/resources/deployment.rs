//! mongos routing tier

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;

use super::pod::{mongos_container, pod_template};
use super::{instance_namespace, owned_meta, replicas};
use crate::crd::{MongoDB, ShardedSpec};
use crate::naming::{component_selector, config_server_name, labels, member_hosts, mongos_name, Component};

/// Connection string for the config server replica set, `<rs>/<host>,<host>`
pub(crate) fn config_db(db: &MongoDB, sharded: &ShardedSpec) -> String {
    let instance = db.name_any();
    let cfg = config_server_name(&instance);
    let hosts = member_hosts(
        &cfg,
        sharded.config_server.members,
        &instance,
        &instance_namespace(db),
    );
    format!("{cfg}/{}", hosts.join(","))
}

/// Stateless mongos routers pointing at the config server replica set
pub fn build_mongos_deployment(db: &MongoDB, sharded: &ShardedSpec) -> Deployment {
    let instance = db.name_any();
    let labels = labels(&instance, Component::Mongos);

    Deployment {
        metadata: owned_meta(db, mongos_name(&instance), labels.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas(sharded.mongos.replicas)),
            selector: LabelSelector {
                match_labels: Some(component_selector(&instance, Component::Mongos)),
                ..Default::default()
            },
            template: pod_template(db, labels, mongos_container(db, &config_db(db, sharded))),
            ..Default::default()
        }),
        ..Default::default()
    }
}
