//! Reconcile scenarios against an in-memory cluster
//!
//! The Kubernetes and administration seams are mockall mocks backed by a
//! shared fake: workloads report as many ready pods as their capacity allows,
//! replica sets answer status from what was initiated and reconfigured.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::runtime::controller::Action;
use serde_json::{json, Value};

use super::client::MockMongoKubeClient;
use super::{
    instance_key, reconcile, selector_string, Context, DiscoveredCrds, ObjectKey, QUORUM_LOST,
    RETRY_BUDGET_EXHAUSTED,
};
use crate::admin::{
    AdminTarget, InitiateOutcome, MemberStatus, MockMongoAdmin, ReplicaSetStatus, ShardInfo,
    ShardRemoval,
};
use crate::crd::{InstancePhase, MongoDB, MongoDBStatus, MonitoringSpec};
use crate::events::{reasons, RecordingEventPublisher};
use crate::resources::{fixtures, EXPORTER_CONTAINER};
use crate::Error;

// ===== Fake cluster =====

#[derive(Default)]
struct Cluster {
    objects: BTreeMap<String, Value>,
    generations: HashMap<String, i64>,
    applied: Vec<String>,
    created: Vec<String>,
    deleted: Vec<String>,
    statuses: Vec<MongoDBStatus>,
    /// Ready pods a workload can reach; unlimited when absent
    capacity: HashMap<String, u32>,
    /// Whether the instance has been deleted behind the reconciler's back
    instance_deleted: bool,
}

impl Cluster {
    fn ready_count(&self, name: &str, replicas: u32) -> u32 {
        self.capacity.get(name).map_or(replicas, |cap| replicas.min(*cap))
    }

    fn live(&self, key: &str) -> Option<Value> {
        let mut object = self.objects.get(key)?.clone();
        let kind = object["kind"].as_str().unwrap_or_default().to_string();
        if kind == "StatefulSet" || kind == "Deployment" {
            let generation = self.generations.get(key).copied().unwrap_or(1);
            let replicas = object.pointer("/spec/replicas").and_then(Value::as_u64).unwrap_or(0) as u32;
            let name = object["metadata"]["name"].as_str().unwrap_or_default().to_string();
            let ready = self.ready_count(&name, replicas);
            object["metadata"]["generation"] = json!(generation);
            object["status"] = json!({
                "observedGeneration": generation,
                "replicas": replicas,
                "readyReplicas": ready,
                "updatedReplicas": ready,
            });
        }
        Some(object)
    }

    fn apply(&mut self, object: &Value) {
        let key = ObjectKey::of(object).unwrap().to_string();
        *self.generations.entry(key.clone()).or_insert(0) += 1;
        self.objects.insert(key.clone(), object.clone());
        self.applied.push(key);
    }

    fn ready_pods(&self, selector: &str) -> Vec<String> {
        for object in self.objects.values() {
            let kind = object["kind"].as_str().unwrap_or_default();
            if kind != "StatefulSet" && kind != "Deployment" {
                continue;
            }
            let labels: BTreeMap<String, String> =
                serde_json::from_value(object["spec"]["selector"]["matchLabels"].clone())
                    .unwrap_or_default();
            if selector_string(&labels) != selector {
                continue;
            }
            let name = object["metadata"]["name"].as_str().unwrap_or_default();
            let replicas = object["spec"]["replicas"].as_u64().unwrap_or(0) as u32;
            let ready = self.ready_count(name, replicas);
            return (0..ready)
                .map(|i| {
                    if kind == "StatefulSet" {
                        format!("{name}-{i}")
                    } else {
                        format!("{name}-pod-{i}")
                    }
                })
                .collect();
        }
        Vec::new()
    }

    fn list(&self, kind: &str, namespace: &str, selector: &str) -> Vec<String> {
        let wanted: Vec<(&str, &str)> = selector
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        self.objects
            .values()
            .filter(|o| o["kind"] == kind && o["metadata"]["namespace"] == namespace)
            .filter(|o| wanted.iter().all(|(k, v)| o["metadata"]["labels"][*k] == *v))
            .filter_map(|o| o["metadata"]["name"].as_str().map(str::to_string))
            .collect()
    }

    fn applied_index(&self, key: &str) -> Option<usize> {
        self.applied.iter().position(|k| k == key)
    }
}

#[derive(Default)]
struct Topology {
    /// Members per replica set, keyed by replica set (= workload) name
    sets: BTreeMap<String, Vec<String>>,
    initiations: Vec<(String, bool)>,
    reconfigurations: Vec<(Vec<String>, Vec<String>)>,
    shards: Vec<ShardInfo>,
    shard_adds: Vec<String>,
}

fn workload_of(target: &AdminTarget) -> String {
    target
        .pod
        .rsplit_once('-')
        .map(|(workload, _)| workload.to_string())
        .unwrap_or_default()
}

fn kube_mock(cluster: &Arc<Mutex<Cluster>>) -> MockMongoKubeClient {
    let mut mock = MockMongoKubeClient::new();

    let c = cluster.clone();
    mock.expect_get()
        .returning(move |key: &ObjectKey| Ok(c.lock().unwrap().live(&key.to_string())));
    let c = cluster.clone();
    mock.expect_apply().returning(move |object: &Value| {
        c.lock().unwrap().apply(object);
        Ok(())
    });
    let c = cluster.clone();
    mock.expect_create_if_absent().returning(move |object: &Value| {
        let mut cluster = c.lock().unwrap();
        let key = ObjectKey::of(object).unwrap().to_string();
        if cluster.objects.contains_key(&key) {
            return Ok(false);
        }
        cluster.objects.insert(key.clone(), object.clone());
        cluster.created.push(key);
        Ok(true)
    });
    let c = cluster.clone();
    mock.expect_delete().returning(move |key: &ObjectKey| {
        let mut cluster = c.lock().unwrap();
        cluster.objects.remove(&key.to_string());
        cluster.deleted.push(key.to_string());
        Ok(())
    });
    let c = cluster.clone();
    mock.expect_patch_status()
        .returning(move |_: &str, _: &str, status: &MongoDBStatus| {
            c.lock().unwrap().statuses.push(status.clone());
            Ok(())
        });
    let c = cluster.clone();
    mock.expect_instance_live()
        .returning(move |_: &str, _: &str| Ok(!c.lock().unwrap().instance_deleted));
    let c = cluster.clone();
    mock.expect_ready_pods()
        .returning(move |_: &str, selector: &str| Ok(c.lock().unwrap().ready_pods(selector)));
    let c = cluster.clone();
    mock.expect_list_names().returning(
        move |_: &str, kind: &str, namespace: &str, selector: &str| {
            Ok(c.lock().unwrap().list(kind, namespace, selector))
        },
    );

    mock
}

fn admin_mock(topology: &Arc<Mutex<Topology>>) -> MockMongoAdmin {
    let mut mock = MockMongoAdmin::new();

    let t = topology.clone();
    mock.expect_status().returning(move |target: &AdminTarget| {
        let topology = t.lock().unwrap();
        let workload = workload_of(target);
        Ok(topology.sets.get(&workload).map(|hosts| ReplicaSetStatus {
            set_name: workload.clone(),
            members: hosts
                .iter()
                .enumerate()
                .map(|(i, host)| MemberStatus {
                    host: host.clone(),
                    state: if i == 0 { "PRIMARY" } else { "SECONDARY" }.to_string(),
                    healthy: true,
                })
                .collect(),
        }))
    });
    let t = topology.clone();
    mock.expect_initiate().returning(
        move |_: &AdminTarget, replica_set: &str, members: &[String], config_server: bool| {
            let mut topology = t.lock().unwrap();
            if topology.sets.contains_key(replica_set) {
                return Ok(InitiateOutcome::AlreadyInitialized);
            }
            topology.sets.insert(replica_set.to_string(), members.to_vec());
            topology
                .initiations
                .push((replica_set.to_string(), config_server));
            Ok(InitiateOutcome::Initiated)
        },
    );
    let t = topology.clone();
    mock.expect_reconfigure().returning(
        move |target: &AdminTarget, add: &[String], remove: &[String]| {
            let mut topology = t.lock().unwrap();
            let workload = workload_of(target);
            if let Some(members) = topology.sets.get_mut(&workload) {
                members.retain(|m| !remove.contains(m));
                members.extend(add.iter().cloned());
            }
            topology
                .reconfigurations
                .push((add.to_vec(), remove.to_vec()));
            Ok(())
        },
    );
    let t = topology.clone();
    mock.expect_list_shards()
        .returning(move |_: &AdminTarget| Ok(t.lock().unwrap().shards.clone()));
    let t = topology.clone();
    mock.expect_add_shard()
        .returning(move |_: &AdminTarget, connection: &str| {
            let mut topology = t.lock().unwrap();
            let id = connection.split('/').next().unwrap_or_default().to_string();
            topology.shards.push(ShardInfo {
                id: id.clone(),
                host: connection.to_string(),
                draining: false,
            });
            topology.shard_adds.push(id);
            Ok(())
        });
    let t = topology.clone();
    mock.expect_remove_shard()
        .returning(move |_: &AdminTarget, shard: &str| {
            let mut topology = t.lock().unwrap();
            let Some(position) = topology.shards.iter().position(|s| s.id == shard) else {
                return Ok(ShardRemoval::Completed);
            };
            if topology.shards[position].draining {
                topology.shards.remove(position);
                Ok(ShardRemoval::Completed)
            } else {
                topology.shards[position].draining = true;
                Ok(ShardRemoval::Draining {
                    remaining_chunks: Some(12),
                })
            }
        });

    mock
}

struct Harness {
    ctx: Arc<Context>,
    cluster: Arc<Mutex<Cluster>>,
    topology: Arc<Mutex<Topology>>,
    events: Arc<RecordingEventPublisher>,
}

impl Harness {
    fn new() -> Self {
        Self::with_crds(DiscoveredCrds::default())
    }

    fn with_crds(crds: DiscoveredCrds) -> Self {
        let cluster = Arc::new(Mutex::new(Cluster::default()));
        let topology = Arc::new(Mutex::new(Topology::default()));
        let events = Arc::new(RecordingEventPublisher::default());
        let mut ctx = Context::for_testing(
            Arc::new(kube_mock(&cluster)),
            Arc::new(admin_mock(&topology)),
        );
        ctx.events = events.clone();
        ctx.crds = crds;
        Self {
            ctx: Arc::new(ctx),
            cluster,
            topology,
            events,
        }
    }

    fn limit_pods(&self, workload: &str, ready: u32) {
        self.cluster
            .lock()
            .unwrap()
            .capacity
            .insert(workload.to_string(), ready);
    }

    fn unlimit_pods(&self, workload: &str) {
        self.cluster.lock().unwrap().capacity.remove(workload);
    }

    /// Run one pass and feed the written status back into the instance
    async fn pass(&self, db: &mut MongoDB) -> Action {
        let action = reconcile(Arc::new(db.clone()), self.ctx.clone())
            .await
            .expect("reconcile should succeed");
        if let Some(status) = self.cluster.lock().unwrap().statuses.last().cloned() {
            db.status = Some(status);
        }
        action
    }

    async fn pass_to_phase(&self, db: &mut MongoDB) -> InstancePhase {
        self.pass(db).await;
        phase(db)
    }

    fn applied_count(&self) -> usize {
        self.cluster.lock().unwrap().applied.len()
    }
}

fn phase(db: &MongoDB) -> InstancePhase {
    db.status.as_ref().map(|s| s.phase).unwrap_or_default()
}

fn bump_generation(db: &mut MongoDB) {
    db.metadata.generation = Some(db.metadata.generation.unwrap_or(1) + 1);
}

async fn ready_replica_set(harness: &Harness, members: u32) -> MongoDB {
    let mut db = fixtures::replica_set("orders", members);
    for _ in 0..3 {
        harness.pass(&mut db).await;
    }
    assert_eq!(phase(&db), InstancePhase::Ready);
    db
}

// ===== Replica set lifecycle =====

/// Story: a new replica set waits for its pods, is initiated exactly once and
/// then reports Ready with every member healthy.
#[tokio::test]
async fn story_new_replica_set_bootstraps_to_ready() {
    let harness = Harness::new();
    harness.limit_pods("orders", 0);
    let mut db = fixtures::replica_set("orders", 3);

    let action = harness.pass(&mut db).await;
    assert_eq!(phase(&db), InstancePhase::Provisioning);
    assert_eq!(action, Action::requeue(Duration::from_secs(10)));
    assert!(harness.topology.lock().unwrap().initiations.is_empty());

    // Shared objects precede the workload
    {
        let cluster = harness.cluster.lock().unwrap();
        assert_eq!(cluster.created, vec!["Secret/db/orders-keyfile"]);
        let sts = cluster.applied_index("StatefulSet/db/orders").unwrap();
        for shared in [
            "ConfigMap/db/orders-scripts",
            "Service/db/orders-headless",
            "Service/db/orders",
        ] {
            assert!(cluster.applied_index(shared).unwrap() < sts);
        }
    }

    harness.unlimit_pods("orders");
    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Initializing);
    assert_eq!(
        harness.topology.lock().unwrap().initiations,
        vec![("orders".to_string(), false)]
    );

    let action = harness.pass(&mut db).await;
    let status = db.status.clone().unwrap();
    assert_eq!(status.phase, InstancePhase::Ready);
    assert_eq!(status.ready_members, Some(3));
    assert_eq!(status.initialized_replica_sets, vec!["orders"]);
    assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    assert_eq!(harness.topology.lock().unwrap().initiations.len(), 1);
    assert_eq!(
        harness.events.reasons(),
        vec![
            reasons::PROVISIONING_STARTED,
            reasons::REPLICA_SET_INITIATED,
            reasons::INSTANCE_READY
        ]
    );
}

/// Story: reconciling an unchanged, converged instance again mutates nothing.
#[tokio::test]
async fn story_unchanged_spec_causes_no_further_writes() {
    let harness = Harness::new();
    let mut db = ready_replica_set(&harness, 3).await;

    let applied = harness.applied_count();
    let created = harness.cluster.lock().unwrap().created.len();
    harness.pass(&mut db).await;
    harness.pass(&mut db).await;

    assert_eq!(harness.applied_count(), applied);
    assert_eq!(harness.cluster.lock().unwrap().created.len(), created);
    let topology = harness.topology.lock().unwrap();
    assert_eq!(topology.initiations.len(), 1);
    assert!(topology.reconfigurations.is_empty());
}

/// Story: growing a Ready replica set from 3 to 5 members goes through
/// Scaling, adds both members in one reconfiguration only once both new pods
/// are ready, then returns to Ready.
#[tokio::test]
async fn story_scale_out_adds_members_after_pods_ready() {
    let harness = Harness::new();
    let mut db = ready_replica_set(&harness, 3).await;

    harness.limit_pods("orders", 3);
    db.spec.replica_set.as_mut().unwrap().members = 5;
    bump_generation(&mut db);

    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Scaling);
    assert!(harness.topology.lock().unwrap().reconfigurations.is_empty());

    // One of the two new pods ready is still not enough
    harness.limit_pods("orders", 4);
    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Scaling);
    assert!(harness.topology.lock().unwrap().reconfigurations.is_empty());

    harness.unlimit_pods("orders");
    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Scaling);
    {
        let topology = harness.topology.lock().unwrap();
        assert_eq!(topology.reconfigurations.len(), 1);
        let (added, removed) = &topology.reconfigurations[0];
        assert_eq!(added.len(), 2);
        assert!(added[0].starts_with("orders-3.orders-headless.db"));
        assert!(added[1].starts_with("orders-4.orders-headless.db"));
        assert!(removed.is_empty());
    }

    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Ready);
    assert_eq!(db.status.as_ref().unwrap().ready_members, Some(5));
    assert_eq!(harness.topology.lock().unwrap().reconfigurations.len(), 1);
    let events = harness.events.reasons();
    assert_eq!(
        events.iter().filter(|r| *r == reasons::MEMBERS_RECONFIGURED).count(),
        1
    );
    assert_eq!(events.last().map(String::as_str), Some(reasons::INSTANCE_READY));
}

/// Story: shrinking removes members from the replica set before the
/// StatefulSet loses their pods.
#[tokio::test]
async fn story_scale_in_removes_members_before_shrinking_workload() {
    let harness = Harness::new();
    let mut db = ready_replica_set(&harness, 5).await;

    db.spec.replica_set.as_mut().unwrap().members = 3;
    bump_generation(&mut db);

    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Scaling);
    {
        let topology = harness.topology.lock().unwrap();
        assert_eq!(topology.reconfigurations.len(), 1);
        assert_eq!(topology.reconfigurations[0].1.len(), 2);
        let cluster = harness.cluster.lock().unwrap();
        let sts = cluster.live("StatefulSet/db/orders").unwrap();
        assert_eq!(sts["spec"]["replicas"], 5, "pods kept until members are removed");
    }

    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Ready);
    let cluster = harness.cluster.lock().unwrap();
    let sts = cluster.live("StatefulSet/db/orders").unwrap();
    assert_eq!(sts["spec"]["replicas"], 3);
}

/// Story: every pod of a Ready replica set goes away. The instance reports
/// Degraded without trying to initiate again or shrinking the workload, and
/// returns to Ready once the pods are back.
#[tokio::test]
async fn story_total_outage_reports_degraded_then_recovers() {
    let harness = Harness::new();
    let mut db = ready_replica_set(&harness, 3).await;

    harness.limit_pods("orders", 0);
    let action = harness.pass(&mut db).await;
    let status = db.status.clone().unwrap();
    assert_eq!(status.phase, InstancePhase::Degraded);
    assert_eq!(status.reason.as_deref(), Some(QUORUM_LOST));
    assert_eq!(status.ready_members, Some(0));
    assert_eq!(status.initialized_replica_sets, vec!["orders"]);
    assert_eq!(action, Action::requeue(Duration::from_secs(10)));
    assert_eq!(harness.topology.lock().unwrap().initiations.len(), 1);
    {
        let cluster = harness.cluster.lock().unwrap();
        let sts = cluster.live("StatefulSet/db/orders").unwrap();
        assert_eq!(sts["spec"]["replicas"], 3);
    }

    // Still down: no change
    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Degraded);

    harness.unlimit_pods("orders");
    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Ready);
    assert_eq!(db.status.as_ref().unwrap().ready_members, Some(3));
    assert_eq!(harness.topology.lock().unwrap().initiations.len(), 1);

    let events = harness.events.reasons();
    assert_eq!(
        events.iter().filter(|r| *r == reasons::INSTANCE_DEGRADED).count(),
        1
    );
    assert_eq!(events.last().map(String::as_str), Some(reasons::INSTANCE_READY));
}

/// Story: an instance deleted while a pass is underway gets no further
/// administrative commands from that pass.
#[tokio::test]
async fn story_deletion_mid_pass_skips_admin_commands() {
    let harness = Harness::new();
    let mut db = ready_replica_set(&harness, 3).await;

    db.spec.replica_set.as_mut().unwrap().members = 5;
    bump_generation(&mut db);
    harness.cluster.lock().unwrap().instance_deleted = true;

    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Scaling);
    assert!(db
        .status
        .as_ref()
        .and_then(|s| s.message.as_deref())
        .is_some_and(|m| m.contains("instance deleted")));
    assert!(harness.topology.lock().unwrap().reconfigurations.is_empty());
    // Objects were still applied before the check
    let cluster = harness.cluster.lock().unwrap();
    let sts = cluster.live("StatefulSet/db/orders").unwrap();
    assert_eq!(sts["spec"]["replicas"], 5);
    drop(cluster);

    // A new instance deleted before its pods are ready is never initiated
    let harness = Harness::new();
    harness.cluster.lock().unwrap().instance_deleted = true;
    let mut db = fixtures::replica_set("inventory", 3);
    for _ in 0..3 {
        harness.pass(&mut db).await;
    }
    assert!(harness.topology.lock().unwrap().initiations.is_empty());
    assert_ne!(phase(&db), InstancePhase::Ready);
}

/// Story: turning monitoring on adds the exporter sidecar and the
/// ServiceMonitor; turning it off removes both.
#[tokio::test]
async fn story_monitoring_toggle_applies_and_removes_service_monitor() {
    let harness = Harness::with_crds(DiscoveredCrds {
        service_monitor: true,
        certificate: false,
    });
    let mut db = ready_replica_set(&harness, 3).await;
    let monitor = "ServiceMonitor/db/orders-metrics";
    let containers = |harness: &Harness| -> Vec<String> {
        let cluster = harness.cluster.lock().unwrap();
        let sts = cluster.live("StatefulSet/db/orders").unwrap();
        sts["spec"]["template"]["spec"]["containers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap().to_string())
            .collect()
    };
    assert!(harness.cluster.lock().unwrap().applied_index(monitor).is_none());

    db.spec.monitoring = Some(MonitoringSpec {
        enabled: true,
        image: None,
        service_monitor: true,
    });
    bump_generation(&mut db);
    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Ready);
    assert!(harness.cluster.lock().unwrap().objects.contains_key(monitor));
    assert!(containers(&harness).iter().any(|c| c == EXPORTER_CONTAINER));

    db.spec.monitoring = None;
    bump_generation(&mut db);
    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Ready);
    {
        let cluster = harness.cluster.lock().unwrap();
        assert!(!cluster.objects.contains_key(monitor));
        assert_eq!(cluster.deleted, vec![monitor]);
    }
    assert!(!containers(&harness).iter().any(|c| c == EXPORTER_CONTAINER));
}

// ===== Sharded lifecycle =====

/// Story: config servers come up first, then the shards, then the routers;
/// shards are registered only through a ready router.
#[tokio::test]
async fn story_sharded_cluster_bootstraps_in_order() {
    let harness = Harness::new();
    harness.limit_pods("orders-cfg", 0);
    let mut db = fixtures::sharded("orders", 3, 2, 3, 2);

    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Provisioning);
    {
        let cluster = harness.cluster.lock().unwrap();
        assert!(cluster.applied_index("StatefulSet/db/orders-cfg").is_some());
        assert!(cluster.applied_index("StatefulSet/db/orders-shard-0").is_none());
        assert!(cluster.applied_index("Deployment/db/orders-mongos").is_none());
    }

    harness.unlimit_pods("orders-cfg");
    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Initializing);
    assert_eq!(
        harness.topology.lock().unwrap().initiations,
        vec![("orders-cfg".to_string(), true)]
    );
    assert!(harness
        .cluster
        .lock()
        .unwrap()
        .applied_index("StatefulSet/db/orders-shard-0")
        .is_none());

    // Config servers serving: both shards are created
    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Provisioning);
    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Initializing);
    {
        let topology = harness.topology.lock().unwrap();
        assert_eq!(topology.initiations.len(), 3);
        assert!(topology.initiations[1..].iter().all(|(_, cfg)| !cfg));
        assert!(harness
            .cluster
            .lock()
            .unwrap()
            .applied_index("Deployment/db/orders-mongos")
            .is_none());
        assert!(topology.shard_adds.is_empty());
    }

    // Shards serving: routers created and shards registered
    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Initializing);
    assert_eq!(
        harness.topology.lock().unwrap().shard_adds,
        vec!["orders-shard-0", "orders-shard-1"]
    );

    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Ready);
    let status = db.status.clone().unwrap();
    assert_eq!(status.registered_shards, vec!["orders-shard-0", "orders-shard-1"]);
    assert_eq!(status.ready_members, Some(9));

    let cluster = harness.cluster.lock().unwrap();
    let cfg = cluster.applied_index("StatefulSet/db/orders-cfg").unwrap();
    let shard0 = cluster.applied_index("StatefulSet/db/orders-shard-0").unwrap();
    let shard1 = cluster.applied_index("StatefulSet/db/orders-shard-1").unwrap();
    let mongos = cluster.applied_index("Deployment/db/orders-mongos").unwrap();
    assert!(cfg < shard0 && shard0 < mongos && shard1 < mongos);
    assert_eq!(
        cluster
            .applied
            .iter()
            .filter(|k| k.starts_with("StatefulSet/"))
            .count(),
        3
    );
}

/// Story: lowering the shard count drains the surplus shard and deletes its
/// workload only after the drain completes.
#[tokio::test]
async fn story_shard_scale_down_drains_before_delete() {
    let harness = Harness::new();
    let mut db = fixtures::sharded("orders", 3, 2, 3, 2);
    for _ in 0..6 {
        harness.pass(&mut db).await;
    }
    assert_eq!(phase(&db), InstancePhase::Ready);

    db.spec.sharded.as_mut().unwrap().shards.count = 1;
    bump_generation(&mut db);

    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Scaling);
    assert_eq!(db.status.as_ref().unwrap().reason.as_deref(), Some("DrainingShards"));
    assert!(harness.cluster.lock().unwrap().deleted.is_empty());

    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Scaling);
    assert_eq!(
        harness.cluster.lock().unwrap().deleted,
        vec!["StatefulSet/db/orders-shard-1"]
    );
    let status = db.status.clone().unwrap();
    assert_eq!(status.registered_shards, vec!["orders-shard-0"]);
    assert!(!status.is_initialized("orders-shard-1"));

    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Ready);
    assert_eq!(harness.cluster.lock().unwrap().deleted.len(), 1);

    let events = harness.events.reasons();
    let draining = events.iter().position(|r| r == reasons::SHARD_DRAINING).unwrap();
    let removed = events.iter().position(|r| r == reasons::SHARD_REMOVED).unwrap();
    assert!(draining < removed);
}

/// Story: a shard added and removed again before its pods ever became ready
/// is never registered; its StatefulSet is still deleted.
#[tokio::test]
async fn story_unready_surplus_shard_is_removed() {
    let harness = Harness::new();
    let mut db = fixtures::sharded("orders", 3, 2, 3, 2);
    for _ in 0..6 {
        harness.pass(&mut db).await;
    }
    assert_eq!(phase(&db), InstancePhase::Ready);

    harness.limit_pods("orders-shard-2", 0);
    db.spec.sharded.as_mut().unwrap().shards.count = 3;
    bump_generation(&mut db);
    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Scaling);
    assert!(harness
        .cluster
        .lock()
        .unwrap()
        .objects
        .contains_key("StatefulSet/db/orders-shard-2"));

    db.spec.sharded.as_mut().unwrap().shards.count = 2;
    bump_generation(&mut db);
    assert_eq!(harness.pass_to_phase(&mut db).await, InstancePhase::Ready);
    {
        let cluster = harness.cluster.lock().unwrap();
        assert_eq!(cluster.deleted, vec!["StatefulSet/db/orders-shard-2"]);
        assert!(!cluster.objects.contains_key("StatefulSet/db/orders-shard-2"));
    }
    {
        let topology = harness.topology.lock().unwrap();
        assert_eq!(topology.shards.len(), 2);
        assert!(topology.shards.iter().all(|s| !s.draining));
    }

    harness.pass(&mut db).await;
    assert_eq!(harness.cluster.lock().unwrap().deleted.len(), 1);
    assert!(!harness
        .events
        .reasons()
        .iter()
        .any(|r| r == reasons::SHARD_DRAINING));
}

// ===== Failure handling =====

/// Story: an inconsistent spec marks the instance Failed; it stays Failed
/// without further work until the spec changes.
#[tokio::test]
async fn story_inconsistent_spec_fails_until_generation_changes() {
    let harness = Harness::new();
    let mut db = fixtures::replica_set("orders", 3);
    db.spec.sharded = fixtures::sharded("orders", 3, 2, 3, 2).spec.sharded;

    let action = harness.pass(&mut db).await;
    assert_eq!(action, Action::await_change());
    let status = db.status.clone().unwrap();
    assert_eq!(status.phase, InstancePhase::Failed);
    assert_eq!(status.reason.as_deref(), Some("InvalidSpec"));
    assert!(status.message.unwrap().contains("mutually exclusive"));

    let writes = harness.cluster.lock().unwrap().statuses.len();
    assert_eq!(harness.pass(&mut db).await, Action::await_change());
    assert_eq!(harness.cluster.lock().unwrap().statuses.len(), writes);
    assert_eq!(harness.applied_count(), 0);

    db.spec.sharded = None;
    bump_generation(&mut db);
    assert_ne!(harness.pass_to_phase(&mut db).await, InstancePhase::Failed);
}

/// Story: transient API failures leave the status alone until the failure
/// budget runs out, then the instance is reported Degraded.
#[tokio::test]
async fn story_retry_budget_exhaustion_marks_degraded() {
    let statuses = Arc::new(Mutex::new(Vec::<MongoDBStatus>::new()));
    let mut kube = MockMongoKubeClient::new();
    kube.expect_get()
        .returning(|_: &ObjectKey| Err(Error::internal("api server unavailable")));
    let captured = statuses.clone();
    kube.expect_patch_status()
        .returning(move |_: &str, _: &str, status: &MongoDBStatus| {
            captured.lock().unwrap().push(status.clone());
            Ok(())
        });
    let ctx = Arc::new(Context::for_testing(
        Arc::new(kube),
        Arc::new(MockMongoAdmin::new()),
    ));
    let db = Arc::new(fixtures::replica_set("orders", 3));

    for _ in 0..4 {
        let result = reconcile(db.clone(), ctx.clone()).await;
        assert!(result.is_err());
        assert!(statuses.lock().unwrap().is_empty());
    }

    assert!(reconcile(db.clone(), ctx.clone()).await.is_err());
    let written = statuses.lock().unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].phase, InstancePhase::Degraded);
    assert_eq!(written[0].reason.as_deref(), Some(RETRY_BUDGET_EXHAUSTED));
    assert_eq!(written[0].consecutive_failures, 5);
}

/// Story: a pass that sees the deletion timestamp exits without touching the
/// cluster; owned objects are left to garbage collection.
#[tokio::test]
async fn story_deleted_instance_exits_without_commands() {
    // Mocks without expectations panic on any call
    let ctx = Arc::new(Context::for_testing(
        Arc::new(MockMongoKubeClient::new()),
        Arc::new(MockMongoAdmin::new()),
    ));
    let mut db = fixtures::replica_set("orders", 3);
    db.metadata = serde_json::from_value(json!({
        "name": "orders",
        "namespace": "db",
        "generation": 1,
        "deletionTimestamp": "2024-01-01T00:00:00Z"
    }))
    .unwrap();

    let action = reconcile(Arc::new(db), ctx).await.unwrap();
    assert_eq!(action, Action::await_change());
}

/// Story: an instance deleted between the watch event and the status write
/// is forgotten rather than counted as a failure.
#[tokio::test]
async fn story_vanished_instance_is_forgotten() {
    fn not_found() -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        }))
    }

    let mut kube = MockMongoKubeClient::new();
    kube.expect_get().returning(|_: &ObjectKey| Err(not_found()));
    kube.expect_patch_status()
        .returning(|_: &str, _: &str, _: &MongoDBStatus| Err(not_found()));
    kube.expect_instance_live()
        .returning(|_: &str, _: &str| Ok(false));
    let ctx = Arc::new(Context::for_testing(
        Arc::new(kube),
        Arc::new(MockMongoAdmin::new()),
    ));
    let key = instance_key("db", "orders");
    ctx.failures.record(&key);

    let action = reconcile(Arc::new(fixtures::replica_set("orders", 3)), ctx.clone())
        .await
        .unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(ctx.failures.get(&key), 0);
}
