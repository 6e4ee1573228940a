//! Stories about the controller driving a replica set

use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use serde_json::json;

use mongo_operator::crd::{InstancePhase, MongoDB};

use super::helpers::{
    create_namespace, delete_namespace, ensure_test_cluster, replica_set, spawn_controller,
    wait_for_phase,
};

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(600);

/// Story: a three member replica set comes up, grows to five members and is
/// garbage collected with its instance
#[tokio::test]
#[ignore = "requires kind cluster"]
async fn story_replica_set_bootstrap_scale_and_delete() {
    let namespace = "mdb-lifecycle";
    let client = ensure_test_cluster().await;
    create_namespace(&client, namespace).await;
    let controller = spawn_controller(client.clone(), namespace);

    let api: Api<MongoDB> = Api::namespaced(client.clone(), namespace);
    api.create(&PostParams::default(), &replica_set("orders", namespace, 3))
        .await
        .expect("create should succeed");

    let ready = wait_for_phase(&api, "orders", InstancePhase::Ready, BOOTSTRAP_TIMEOUT).await;
    let status = ready.status.expect("status is set");
    assert_eq!(status.ready_members, Some(3));
    assert_eq!(status.initialized_replica_sets, vec!["orders"]);

    api.patch(
        "orders",
        &PatchParams::default(),
        &Patch::Merge(json!({ "spec": { "replicaSet": { "members": 5 } } })),
    )
    .await
    .expect("scale patch should succeed");
    // Scaling is observed first, then Ready again with every member healthy
    wait_for_phase(&api, "orders", InstancePhase::Scaling, BOOTSTRAP_TIMEOUT).await;
    let scaled = wait_for_phase(&api, "orders", InstancePhase::Ready, BOOTSTRAP_TIMEOUT).await;
    assert_eq!(scaled.status.and_then(|s| s.ready_members), Some(5));

    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    let sts = statefulsets.get("orders").await.expect("workload exists");
    assert_eq!(sts.spec.and_then(|s| s.replicas), Some(5));

    api.delete("orders", &DeleteParams::default())
        .await
        .expect("delete should succeed");
    controller.abort();
    delete_namespace(&client, namespace).await;
}
