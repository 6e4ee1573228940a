//! `mongosh` over the pod exec subresource

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

use super::commands::{self, Reply, Script};
use super::{AdminTarget, InitiateOutcome, MongoAdmin, ReplicaSetStatus, ShardInfo, ShardRemoval};
use crate::resources::{local_shell_flags, CLUSTER_USER, KEYFILE_DIR};
use crate::Error;

/// Upper bound for one shell invocation, including reconfiguration waits
const EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// [`MongoAdmin`] backed by `kubectl exec`-style shell invocations
pub struct PodExecAdmin {
    client: Client,
    timeout: Duration,
}

impl PodExecAdmin {
    /// Create an admin client using the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            timeout: EXEC_TIMEOUT,
        }
    }

    /// `sh -c` wrapper authenticating as the internal cluster user.
    ///
    /// The script travels as a positional argument, so it is never re-quoted.
    fn shell_command(target: &AdminTarget, script: &Script) -> Vec<String> {
        let shell = format!(
            "exec mongosh {} --username {CLUSTER_USER} --password \"$(cat {KEYFILE_DIR}/keyfile)\" \
--authenticationDatabase local --eval \"$1\"",
            local_shell_flags(target.tls)
        );
        vec![
            "sh".to_string(),
            "-c".to_string(),
            shell,
            "mongosh".to_string(),
            script.source.clone(),
        ]
    }

    #[instrument(skip(self, target, script), fields(target = %target, command = script.command))]
    async fn run(&self, target: &AdminTarget, script: Script) -> Result<Reply, Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let params = AttachParams::default()
            .container(target.container.clone())
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let command = Self::shell_command(target, &script);
        let target_name = target.to_string();

        let exec = async {
            let mut attached = pods
                .exec(&target.pod, command, &params)
                .await
                .map_err(|e| Error::admin(script.command, &target_name, e.to_string()))?;

            let mut stdout = String::new();
            let mut stderr = String::new();
            let out = attached.stdout();
            let err = attached.stderr();
            let read_out = async {
                if let Some(mut out) = out {
                    out.read_to_string(&mut stdout).await?;
                }
                Ok::<_, std::io::Error>(())
            };
            let read_err = async {
                if let Some(mut err) = err {
                    err.read_to_string(&mut stderr).await?;
                }
                Ok::<_, std::io::Error>(())
            };
            let (out_res, err_res) = tokio::join!(read_out, read_err);
            out_res
                .and(err_res)
                .map_err(|e| Error::admin(script.command, &target_name, e.to_string()))?;

            if let Some(status) = attached.take_status() {
                if let Some(status) = status.await {
                    debug!(status = ?status.status, "shell exited");
                }
            }

            if !stderr.trim().is_empty() {
                debug!(stderr = %stderr.trim(), "shell wrote to stderr");
            }
            Ok::<_, Error>(commands::parse_reply(&stdout))
        };

        tokio::time::timeout(self.timeout, exec)
            .await
            .map_err(|_| {
                Error::admin(
                    script.command,
                    &target_name,
                    format!("no reply within {}s", self.timeout.as_secs()),
                )
            })?
    }
}

#[async_trait]
impl MongoAdmin for PodExecAdmin {
    async fn initiate(
        &self,
        target: &AdminTarget,
        replica_set: &str,
        members: &[String],
        config_server: bool,
    ) -> Result<InitiateOutcome, Error> {
        let reply = self
            .run(target, commands::initiate(replica_set, members, config_server))
            .await?;
        commands::initiate_outcome(reply, &target.to_string())
    }

    async fn reconfigure(
        &self,
        target: &AdminTarget,
        add: &[String],
        remove: &[String],
    ) -> Result<(), Error> {
        let reply = self.run(target, commands::reconfigure(add, remove)).await?;
        commands::expect_ok(reply, "replSetReconfig", &target.to_string()).map(|_| ())
    }

    async fn status(&self, target: &AdminTarget) -> Result<Option<ReplicaSetStatus>, Error> {
        let reply = self.run(target, commands::status()).await?;
        commands::status_value(commands::expect_ok(
            reply,
            "replSetGetStatus",
            &target.to_string(),
        )?)
    }

    async fn add_shard(&self, target: &AdminTarget, connection_string: &str) -> Result<(), Error> {
        let reply = self.run(target, commands::add_shard(connection_string)).await?;
        commands::expect_ok(reply, "addShard", &target.to_string()).map(|_| ())
    }

    async fn list_shards(&self, target: &AdminTarget) -> Result<Vec<ShardInfo>, Error> {
        let reply = self.run(target, commands::list_shards()).await?;
        commands::shards_value(commands::expect_ok(
            reply,
            "listShards",
            &target.to_string(),
        )?)
    }

    async fn remove_shard(
        &self,
        target: &AdminTarget,
        shard: &str,
    ) -> Result<ShardRemoval, Error> {
        let reply = self.run(target, commands::remove_shard(shard)).await?;
        commands::removal_outcome(reply, &target.to_string())
    }
}
