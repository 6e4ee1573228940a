//! Stories about managing `MongoDB` resources through the Kubernetes API

use kube::api::{Api, DeleteParams, PostParams};
use serde_json::json;

use mongo_operator::crd::MongoDB;

use super::helpers::{create_namespace, delete_namespace, ensure_test_cluster, replica_set};

/// Story: a user creates a replica set instance and reads it back unchanged
#[tokio::test]
#[ignore = "requires kind cluster"]
async fn story_create_and_read_replica_set() {
    let client = ensure_test_cluster().await;
    create_namespace(&client, "mdb-crd").await;
    let api: Api<MongoDB> = Api::namespaced(client.clone(), "mdb-crd");

    let created = api
        .create(&PostParams::default(), &replica_set("orders", "mdb-crd", 3))
        .await
        .expect("create should succeed");
    assert_eq!(created.spec.replica_set.as_ref().map(|r| r.members), Some(3));

    let fetched = api.get("orders").await.expect("get should succeed");
    assert_eq!(fetched.spec, created.spec);
    assert!(fetched.status.is_none());

    api.delete("orders", &DeleteParams::default())
        .await
        .expect("delete should succeed");
    delete_namespace(&client, "mdb-crd").await;
}

/// Story: the schema rejects an instance without a server version
#[tokio::test]
#[ignore = "requires kind cluster"]
async fn story_schema_requires_version() {
    let client = ensure_test_cluster().await;
    create_namespace(&client, "mdb-schema").await;
    let api: Api<kube::api::DynamicObject> = Api::namespaced_with(
        client.clone(),
        "mdb-schema",
        &kube::discovery::ApiResource::erase::<MongoDB>(&()),
    );

    let invalid: kube::api::DynamicObject = serde_json::from_value(json!({
        "apiVersion": "mongo-operator.dev/v1alpha1",
        "kind": "MongoDB",
        "metadata": { "name": "broken" },
        "spec": { "replicaSet": { "members": 3 } }
    }))
    .expect("valid object");

    let result = api.create(&PostParams::default(), &invalid).await;
    assert!(result.is_err(), "missing spec.version must be rejected");
    delete_namespace(&client, "mdb-schema").await;
}
