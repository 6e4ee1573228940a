//! Logical backups and the one-shot restore
//!
//! Backups run `mongodump --archive --gzip` from a CronJob into a dedicated
//! volume. A restore runs `mongorestore` once, from an archive on that same
//! volume, after the instance first reaches `Ready`. Both authenticate as the
//! internal cluster user with the keyfile contents, like the exporter.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, PodSecurityContext,
    PodSpec, PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::controller::{ensure_typed, key_of, to_object, Context, ObjectKey};
use crate::crd::{BackupSpec, MongoDB, MongoDBStatus, Topology};
use crate::events::{actions, reasons};
use crate::naming::{
    backup_name, client_service_name, labels, member_hosts, replica_set_workload_name,
    restore_name, Component, MONGODB_PORT,
};
use crate::resources::{
    cluster_password_env, data_claim_template, instance_namespace, mongod_image, owned_meta,
    tls_source_secret, CLUSTER_USER, MONGODB_UID, TLS_SOURCE_DIR,
};
use crate::Error;

/// Mount path of the backup volume
pub const BACKUP_DIR: &str = "/backup";

const BACKUP_VOLUME: &str = "backup";
const TLS_VOLUME: &str = "tls";

/// Where the one-shot restore stands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreProgress {
    /// No restore in the spec
    NotRequested,
    /// The restore Job is running
    Running,
    /// The archive has been restored
    Completed,
}

/// Connection string the tools use.
///
/// Replica sets are reached through their member addresses, sharded clusters
/// through the mongos client service.
pub fn tools_uri(db: &MongoDB) -> Result<String, Error> {
    let instance = db.name_any();
    let namespace = instance_namespace(db);
    let uri = match db.spec.topology()? {
        Topology::ReplicaSet(rs) => format!(
            "mongodb://{}/?replicaSet={}&authSource=local",
            member_hosts(&replica_set_workload_name(&instance), rs.members, &instance, &namespace).join(","),
            db.spec.replica_set_name(&instance)
        ),
        Topology::Sharded(_) => format!(
            "mongodb://{}.{namespace}.svc.cluster.local:{MONGODB_PORT}/?authSource=local",
            client_service_name(&instance)
        ),
    };
    Ok(uri)
}

/// Pick the CA file, falling back to the serving certificate when the
/// secret carries no `ca.crt`
fn tls_prelude(db: &MongoDB) -> String {
    if tls_source_secret(db).is_some() {
        format!(
            "ca={TLS_SOURCE_DIR}/ca.crt\n\
             [ -f \"$ca\" ] || ca={TLS_SOURCE_DIR}/tls.crt\n"
        )
    } else {
        String::new()
    }
}

fn tls_flags(db: &MongoDB) -> String {
    if tls_source_secret(db).is_some() {
        " --tls --tlsCAFile \"$ca\" --tlsAllowInvalidHostnames".to_string()
    } else {
        String::new()
    }
}

fn auth_flags() -> String {
    format!("--uri \"$MONGODB_URI\" --username {CLUSTER_USER} --password \"$MONGODB_PASSWORD\"")
}

/// Shell script run by each backup Job
pub fn dump_script(db: &MongoDB) -> String {
    format!(
        "set -eu\n\
         {ca}archive=\"{BACKUP_DIR}/{instance}-$(date -u +%Y%m%dT%H%M%SZ).archive.gz\"\n\
         mongodump {auth}{tls} --archive=\"$archive\" --gzip\n\
         echo \"wrote $archive\"\n",
        instance = db.name_any(),
        ca = tls_prelude(db),
        auth = auth_flags(),
        tls = tls_flags(db),
    )
}

/// Shell script run by the restore Job
pub fn restore_script(db: &MongoDB, archive: &str) -> String {
    format!(
        "set -eu\n\
         {ca}mongorestore {auth}{tls} --archive=\"{BACKUP_DIR}/{archive}\" --gzip\n",
        ca = tls_prelude(db),
        auth = auth_flags(),
        tls = tls_flags(db),
    )
}

fn tools_pod(db: &MongoDB, image: String, script: String, restart: &str) -> Result<PodSpec, Error> {
    let instance = db.name_any();
    let mut mounts = vec![VolumeMount {
        name: BACKUP_VOLUME.to_string(),
        mount_path: BACKUP_DIR.to_string(),
        ..Default::default()
    }];
    let mut volumes = vec![Volume {
        name: BACKUP_VOLUME.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: backup_name(&instance),
            read_only: Some(false),
        }),
        ..Default::default()
    }];
    if let Some(secret) = tls_source_secret(db) {
        mounts.push(VolumeMount {
            name: TLS_VOLUME.to_string(),
            mount_path: TLS_SOURCE_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(Volume {
            name: TLS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    Ok(PodSpec {
        containers: vec![Container {
            name: "tools".to_string(),
            image: Some(image),
            command: Some(vec!["sh".to_string(), "-c".to_string(), script]),
            env: Some(vec![
                EnvVar {
                    name: "MONGODB_URI".to_string(),
                    value: Some(tools_uri(db)?),
                    ..Default::default()
                },
                cluster_password_env(db),
            ]),
            volume_mounts: Some(mounts),
            ..Default::default()
        }],
        volumes: Some(volumes),
        restart_policy: Some(restart.to_string()),
        security_context: Some(PodSecurityContext {
            run_as_user: Some(MONGODB_UID),
            run_as_group: Some(MONGODB_UID),
            fs_group: Some(MONGODB_UID),
            run_as_non_root: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn backup_labels(db: &MongoDB) -> BTreeMap<String, String> {
    labels(&db.name_any(), Component::Backup)
}

fn pod_template(db: &MongoDB, spec: PodSpec) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(backup_labels(db)),
            ..Default::default()
        }),
        spec: Some(spec),
    }
}

/// Volume receiving the archives
pub fn build_backup_claim(db: &MongoDB, backup: &BackupSpec) -> PersistentVolumeClaim {
    let mut claim = data_claim_template(&backup.storage);
    claim.metadata = owned_meta(db, backup_name(&db.name_any()), backup_labels(db));
    claim
}

/// CronJob running `mongodump` on the configured schedule
pub fn build_backup_cronjob(db: &MongoDB, backup: &BackupSpec) -> Result<CronJob, Error> {
    let image = backup.image.clone().unwrap_or_else(|| mongod_image(db));
    let pod = tools_pod(db, image, dump_script(db), "Never")?;

    Ok(CronJob {
        metadata: owned_meta(db, backup_name(&db.name_any()), backup_labels(db)),
        spec: Some(CronJobSpec {
            schedule: backup.schedule.clone(),
            concurrency_policy: Some("Forbid".to_string()),
            successful_jobs_history_limit: Some(3),
            failed_jobs_history_limit: Some(1),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(backup_labels(db)),
                    ..Default::default()
                }),
                spec: Some(JobSpec {
                    backoff_limit: Some(2),
                    template: pod_template(db, pod),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Job restoring the configured archive, `None` without a restore
pub fn build_restore_job(db: &MongoDB) -> Result<Option<Job>, Error> {
    let Some(restore) = db.spec.restore.as_ref() else {
        return Ok(None);
    };
    let image = restore.image.clone().unwrap_or_else(|| mongod_image(db));
    let pod = tools_pod(db, image, restore_script(db, &restore.archive), "OnFailure")?;

    Ok(Some(Job {
        metadata: owned_meta(db, restore_name(&db.name_any()), backup_labels(db)),
        spec: Some(JobSpec {
            backoff_limit: Some(3),
            template: pod_template(db, pod),
            ..Default::default()
        }),
        ..Default::default()
    }))
}

/// Keep the backup volume and CronJob in line with the spec.
///
/// The volume is created once and kept when backups are disabled; the
/// CronJob is removed.
pub async fn reconcile_backup(ctx: &Context, db: &MongoDB) -> Result<(), Error> {
    let cronjob_key = ObjectKey::new(
        "batch/v1",
        "CronJob",
        instance_namespace(db),
        backup_name(&db.name_any()),
    );

    let Some(backup) = db.spec.backup.as_ref().filter(|b| b.enabled) else {
        if ctx.kube.get(&cronjob_key).await?.is_some() {
            ctx.kube.delete(&cronjob_key).await?;
            info!(object = %cronjob_key, "backups disabled, removed CronJob");
        }
        return Ok(());
    };

    let claim = build_backup_claim(db, backup);
    if ctx.kube.get(&key_of(&claim)).await?.is_none()
        && ctx.kube.create_if_absent(&to_object(&claim)?).await?
    {
        info!(claim = %backup_name(&db.name_any()), "created backup volume");
    }

    ensure_typed(ctx, &build_backup_cronjob(db, backup)?).await?;
    Ok(())
}

/// Run the restore Job once and record its completion in `status`
pub async fn reconcile_restore(
    ctx: &Context,
    db: &MongoDB,
    status: &mut MongoDBStatus,
) -> Result<RestoreProgress, Error> {
    let Some(job) = build_restore_job(db)? else {
        return Ok(RestoreProgress::NotRequested);
    };
    if status.restore_completed {
        return Ok(RestoreProgress::Completed);
    }

    let key = key_of(&job);
    let live = match ctx.kube.get(&key).await? {
        Some(live) => live,
        None => {
            if ctx.kube.create_if_absent(&to_object(&job)?).await? {
                info!(job = %key, "started restore");
            }
            return Ok(RestoreProgress::Running);
        }
    };

    let succeeded = live
        .pointer("/status/succeeded")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0);
    if succeeded > 0 {
        status.restore_completed = true;
        info!(job = %key, "restore completed");
        ctx.events
            .publish(
                &db.object_ref(&()),
                EventType::Normal,
                reasons::RESTORE_COMPLETED,
                actions::RESTORE,
                db.spec
                    .restore
                    .as_ref()
                    .map(|r| format!("Restored archive {}", r.archive)),
            )
            .await;
        return Ok(RestoreProgress::Completed);
    }

    let failed = live
        .pointer("/status/conditions")
        .and_then(serde_json::Value::as_array)
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c["type"] == "Failed" && c["status"] == "True")
        });
    if failed {
        return Err(Error::admin_permanent(
            "mongorestore",
            key.to_string(),
            "restore job failed; delete the job to retry",
        ));
    }

    debug!(job = %key, "restore running");
    Ok(RestoreProgress::Running)
}
