//! Shared setup for the kind tests

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, CustomResourceExt};
use serde_json::json;
use tokio::task::JoinHandle;

use mongo_operator::controller::{error_policy, reconcile, Context, DiscoveredCrds};
use mongo_operator::crd::{InstancePhase, MongoDB};

/// Connect to the current kube context and install the CRD
pub async fn ensure_test_cluster() -> Client {
    let client = Client::try_default()
        .await
        .expect("a reachable cluster is required, e.g. `kind create cluster`");

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    crds.patch(
        "mongodbs.mongo-operator.dev",
        &PatchParams::apply("mongo-operator-tests").force(),
        &Patch::Apply(&MongoDB::crd()),
    )
    .await
    .expect("CRD should apply");
    // Give the API server a moment to serve the new resource
    tokio::time::sleep(Duration::from_secs(2)).await;

    client
}

/// Create a throwaway namespace
pub async fn create_namespace(client: &Client, name: &str) {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let namespace: Namespace = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name }
    }))
    .expect("valid namespace");
    match namespaces.create(&PostParams::default(), &namespace).await {
        Ok(_) => {}
        Err(kube::Error::Api(e)) if e.code == 409 => {}
        Err(e) => panic!("failed to create namespace {name}: {e}"),
    }
}

/// Delete a namespace and everything in it
pub async fn delete_namespace(client: &Client, name: &str) {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let _ = namespaces.delete(name, &DeleteParams::default()).await;
}

/// A replica set instance with small volumes
pub fn replica_set(name: &str, namespace: &str, members: u32) -> MongoDB {
    serde_json::from_value(json!({
        "apiVersion": "mongo-operator.dev/v1alpha1",
        "kind": "MongoDB",
        "metadata": { "name": name, "namespace": namespace },
        "spec": {
            "version": { "version": "7.0.5" },
            "storage": { "size": "1Gi" },
            "replicaSet": { "members": members }
        }
    }))
    .expect("valid MongoDB")
}

/// Run the controller in the background until the handle is aborted
pub fn spawn_controller(client: Client, namespace: &str) -> JoinHandle<()> {
    let namespace = namespace.to_string();
    tokio::spawn(async move {
        let crds = DiscoveredCrds::discover(client.clone())
            .await
            .unwrap_or_default();
        let ctx = Arc::new(Context::builder(client.clone()).crds(crds).build());
        let instances: Api<MongoDB> = Api::namespaced(client, &namespace);
        Controller::new(instances, WatcherConfig::default())
            .run(reconcile, error_policy, ctx)
            .for_each(|_| async {})
            .await;
    })
}

/// Poll until the instance reports `phase`, panicking after `timeout`
pub async fn wait_for_phase(
    api: &Api<MongoDB>,
    name: &str,
    phase: InstancePhase,
    timeout: Duration,
) -> MongoDB {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let db = api.get(name).await.expect("instance should exist");
        let current = db.status.as_ref().map(|s| s.phase);
        if current == Some(phase) {
            return db;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("{name} did not reach {phase} within {timeout:?}, last {current:?}");
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
