//! Containers, volumes and pod templates shared by every workload
//!
//! Every pod runs an init container that installs the keyfile (and TLS
//! material) with the permissions mongod insists on, then the database or
//! router container, then the exporter sidecar when monitoring is enabled.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ExecAction,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe, SecretKeySelector, SecretVolumeSource, TCPSocketAction, Volume,
    VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::config_map::{INIT_SCRIPT_KEY, READINESS_PROBE_KEY};
use super::secret::KEYFILE_KEY;
use crate::crd::{MongoDB, StorageSpec, DEFAULT_EXPORTER_IMAGE, DEFAULT_MONGODB_REPOSITORY};
use crate::naming::{keyfile_secret_name, scripts_config_map_name, tls_secret_name, METRICS_PORT, MONGODB_PORT};

/// Database container name
pub const DATABASE_CONTAINER: &str = "mongod";
/// Router container name
pub const MONGOS_CONTAINER: &str = "mongos";
/// Exporter sidecar name
pub const EXPORTER_CONTAINER: &str = "mongodb-exporter";
const INIT_CONTAINER: &str = "init-member";

/// Mount path of the scripts config map
pub(crate) const SCRIPTS_DIR: &str = "/opt/mongo-operator/scripts";
/// Where the init container installs the keyfile
pub(crate) const KEYFILE_DIR: &str = "/var/lib/mongodb-keyfile";
/// Where the keyfile secret is mounted read-only
pub(crate) const KEYFILE_SOURCE_DIR: &str = "/etc/mongodb-keyfile";
/// Where the TLS secret is mounted read-only
pub(crate) const TLS_SOURCE_DIR: &str = "/etc/mongodb-tls";
/// Where the init container installs the combined PEM and CA
pub const TLS_DIR: &str = "/var/lib/mongodb-tls";

/// Internal user authenticated by the keyfile, used for administration
pub(crate) const CLUSTER_USER: &str = "__system";

/// Name of the persistent data volume
pub(crate) const DATA_VOLUME: &str = "data";

/// uid/gid of the mongodb user in the official images
pub(crate) const MONGODB_UID: i64 = 999;

/// Image for mongod and mongos containers
pub fn mongod_image(db: &MongoDB) -> String {
    db.spec.version.resolve_image(DEFAULT_MONGODB_REPOSITORY)
}

/// Image for the exporter sidecar
pub fn exporter_image(db: &MongoDB) -> String {
    db.spec
        .monitoring
        .as_ref()
        .and_then(|m| m.image.clone())
        .unwrap_or_else(|| DEFAULT_EXPORTER_IMAGE.to_string())
}

/// Secret holding the serving certificate, when TLS is enabled
pub(crate) fn tls_source_secret(db: &MongoDB) -> Option<String> {
    let tls = db.spec.tls.as_ref().filter(|t| t.enabled)?;
    Some(
        tls.secret_name
            .clone()
            .unwrap_or_else(|| tls_secret_name(&db.name_any())),
    )
}

/// Replica set role of a mongod
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MemberRole {
    ReplicaSet,
    ConfigServer,
    Shard,
}

impl MemberRole {
    fn flag(&self) -> Option<&'static str> {
        match self {
            MemberRole::ReplicaSet => None,
            MemberRole::ConfigServer => Some("--configsvr"),
            MemberRole::Shard => Some("--shardsvr"),
        }
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Server-side TLS flags shared by mongod and mongos
fn tls_args(db: &MongoDB) -> Vec<String> {
    if tls_source_secret(db).is_none() {
        return Vec::new();
    }
    vec![
        "--tlsMode".to_string(),
        "requireTLS".to_string(),
        "--tlsCertificateKeyFile".to_string(),
        format!("{TLS_DIR}/server.pem"),
        "--tlsCAFile".to_string(),
        format!("{TLS_DIR}/ca.crt"),
        "--tlsAllowConnectionsWithoutCertificates".to_string(),
    ]
}

fn keyfile_args() -> Vec<String> {
    vec!["--keyFile".to_string(), format!("{KEYFILE_DIR}/keyfile")]
}

fn support_mounts(db: &MongoDB) -> Vec<VolumeMount> {
    let mut mounts = vec![
        VolumeMount {
            name: "keyfile".to_string(),
            mount_path: KEYFILE_DIR.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "scripts".to_string(),
            mount_path: SCRIPTS_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];
    if tls_source_secret(db).is_some() {
        mounts.push(VolumeMount {
            name: "tls".to_string(),
            mount_path: TLS_DIR.to_string(),
            ..Default::default()
        });
    }
    mounts
}

fn readiness_probe() -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "sh".to_string(),
                format!("{SCRIPTS_DIR}/{READINESS_PROBE_KEY}"),
            ]),
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn liveness_probe() -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::String("mongodb".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(30),
        period_seconds: Some(20),
        failure_threshold: Some(6),
        ..Default::default()
    }
}

fn mongodb_port() -> ContainerPort {
    ContainerPort {
        name: Some("mongodb".to_string()),
        container_port: MONGODB_PORT,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Argument list for a mongod member
pub(crate) fn mongod_args(
    db: &MongoDB,
    replica_set_name: &str,
    role: MemberRole,
    storage: &StorageSpec,
) -> Vec<String> {
    let mut out = args(&["--replSet", replica_set_name, "--bind_ip_all"]);
    out.extend(args(&["--port", &MONGODB_PORT.to_string()]));
    out.extend(args(&["--dbpath", &storage.data_dir_path]));
    out.extend(keyfile_args());
    if let Some(flag) = role.flag() {
        out.push(flag.to_string());
    }
    out.extend(tls_args(db));
    out
}

/// The mongod container of a replica set member
pub(crate) fn database_container(
    db: &MongoDB,
    replica_set_name: &str,
    role: MemberRole,
    storage: &StorageSpec,
) -> Container {
    let mut mounts = vec![VolumeMount {
        name: DATA_VOLUME.to_string(),
        mount_path: storage.data_dir_path.clone(),
        ..Default::default()
    }];
    mounts.extend(support_mounts(db));

    Container {
        name: DATABASE_CONTAINER.to_string(),
        image: Some(mongod_image(db)),
        command: Some(vec!["mongod".to_string()]),
        args: Some(mongod_args(db, replica_set_name, role, storage)),
        ports: Some(vec![mongodb_port()]),
        volume_mounts: Some(mounts),
        readiness_probe: Some(readiness_probe()),
        liveness_probe: Some(liveness_probe()),
        ..Default::default()
    }
}

/// The mongos router container
pub(crate) fn mongos_container(db: &MongoDB, config_db: &str) -> Container {
    let mut out = args(&["--configdb", config_db, "--bind_ip_all"]);
    out.extend(args(&["--port", &MONGODB_PORT.to_string()]));
    out.extend(keyfile_args());
    out.extend(tls_args(db));

    Container {
        name: MONGOS_CONTAINER.to_string(),
        image: Some(mongod_image(db)),
        command: Some(vec!["mongos".to_string()]),
        args: Some(out),
        ports: Some(vec![mongodb_port()]),
        volume_mounts: Some(support_mounts(db)),
        readiness_probe: Some(readiness_probe()),
        liveness_probe: Some(liveness_probe()),
        ..Default::default()
    }
}

fn exporter_uri(db: &MongoDB) -> String {
    let mut uri =
        format!("mongodb://localhost:{MONGODB_PORT}/?directConnection=true&authSource=local");
    if tls_source_secret(db).is_some() {
        uri.push_str(&format!(
            "&tls=true&tlsCAFile={TLS_DIR}/ca.crt&tlsCertificateKeyFile={TLS_DIR}/server.pem&tlsAllowInvalidHostnames=true"
        ));
    }
    uri
}

/// `MONGODB_PASSWORD` read from the keyfile secret
pub(crate) fn cluster_password_env(db: &MongoDB) -> EnvVar {
    EnvVar {
        name: "MONGODB_PASSWORD".to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: keyfile_secret_name(&db.name_any()),
                key: KEYFILE_KEY.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Metrics exporter sidecar
pub(crate) fn exporter_container(db: &MongoDB) -> Container {
    let mounts = tls_source_secret(db).map(|_| {
        vec![VolumeMount {
            name: "tls".to_string(),
            mount_path: TLS_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]
    });

    Container {
        name: EXPORTER_CONTAINER.to_string(),
        image: Some(exporter_image(db)),
        args: Some(vec![
            format!("--mongodb.uri={}", exporter_uri(db)),
            "--collect-all".to_string(),
            "--compatible-mode".to_string(),
            format!("--web.listen-address=:{METRICS_PORT}"),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("metrics".to_string()),
            container_port: METRICS_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(vec![
            EnvVar {
                name: "MONGODB_USER".to_string(),
                value: Some(CLUSTER_USER.to_string()),
                ..Default::default()
            },
            cluster_password_env(db),
        ]),
        volume_mounts: mounts,
        ..Default::default()
    }
}

fn init_container(db: &MongoDB) -> Container {
    let mut mounts = vec![
        VolumeMount {
            name: "keyfile-source".to_string(),
            mount_path: KEYFILE_SOURCE_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: "keyfile".to_string(),
            mount_path: KEYFILE_DIR.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "scripts".to_string(),
            mount_path: SCRIPTS_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];
    if tls_source_secret(db).is_some() {
        mounts.push(VolumeMount {
            name: "tls-source".to_string(),
            mount_path: TLS_SOURCE_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "tls".to_string(),
            mount_path: TLS_DIR.to_string(),
            ..Default::default()
        });
    }

    Container {
        name: INIT_CONTAINER.to_string(),
        image: Some(mongod_image(db)),
        command: Some(vec![
            "sh".to_string(),
            format!("{SCRIPTS_DIR}/{INIT_SCRIPT_KEY}"),
        ]),
        volume_mounts: Some(mounts),
        ..Default::default()
    }
}

fn support_volumes(db: &MongoDB) -> Vec<Volume> {
    let instance = db.name_any();
    let mut volumes = vec![
        Volume {
            name: "keyfile-source".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(keyfile_secret_name(&instance)),
                default_mode: Some(0o440),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "keyfile".to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "scripts".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: scripts_config_map_name(&instance),
                default_mode: Some(0o555),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    if let Some(secret) = tls_source_secret(db) {
        volumes.push(Volume {
            name: "tls-source".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret),
                default_mode: Some(0o440),
                ..Default::default()
            }),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "tls".to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    volumes
}

/// Pod template around a main container.
///
/// Container order is `[main]` or `[main, exporter]`.
pub(crate) fn pod_template(
    db: &MongoDB,
    labels: BTreeMap<String, String>,
    main: Container,
) -> PodTemplateSpec {
    let mut containers = vec![main];
    if db.spec.monitoring_enabled() {
        containers.push(exporter_container(db));
    }

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            init_containers: Some(vec![init_container(db)]),
            containers,
            volumes: Some(support_volumes(db)),
            security_context: Some(PodSecurityContext {
                run_as_user: Some(MONGODB_UID),
                run_as_group: Some(MONGODB_UID),
                fs_group: Some(MONGODB_UID),
                run_as_non_root: Some(true),
                ..Default::default()
            }),
            termination_grace_period_seconds: Some(30),
            ..Default::default()
        }),
    }
}

/// Volume claim template bound to a storage spec.
///
/// An empty storage class leaves the field unset so the cluster default applies.
pub(crate) fn data_claim_template(storage: &StorageSpec) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage.storage_class().map(str::to_string),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
