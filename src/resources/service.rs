//! Headless and client services

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::{owned_meta, shared_component};
use crate::crd::{MongoDB, Topology};
use crate::naming::{
    client_service_name, component_selector, headless_service_name, instance_selector, labels,
    Component, METRICS_PORT, MONGODB_PORT,
};

fn port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::String(name.to_string())),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Headless service giving every member pod a stable DNS name.
///
/// Selects all pods of the instance and publishes not-ready addresses, so
/// members can resolve each other before any of them passes readiness.
pub fn build_headless_service(db: &MongoDB) -> Service {
    let instance = db.name_any();

    Service {
        metadata: owned_meta(
            db,
            headless_service_name(&instance),
            labels(&instance, shared_component(db)),
        ),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(instance_selector(&instance)),
            ports: Some(vec![port("mongodb", MONGODB_PORT)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Client entry point: replica set members, or mongos routers when sharded
pub fn build_client_service(db: &MongoDB) -> Service {
    let instance = db.name_any();
    let component = match db.spec.topology() {
        Ok(Topology::Sharded(_)) => Component::Mongos,
        _ => Component::ReplicaSet,
    };

    let mut ports = vec![port("mongodb", MONGODB_PORT)];
    if db.spec.monitoring_enabled() {
        ports.push(port("metrics", METRICS_PORT));
    }

    Service {
        metadata: owned_meta(db, client_service_name(&instance), labels(&instance, component)),
        spec: Some(ServiceSpec {
            type_: Some(db.spec.service_type().as_str().to_string()),
            selector: Some(component_selector(&instance, component)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}
