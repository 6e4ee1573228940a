//! Operator configuration
//!
//! Every flag has an environment fallback so the operator can be configured
//! from its Deployment manifest alone.

use std::time::Duration;

use clap::Parser;

use crate::controller::{ReconcileSettings, FIELD_MANAGER};
use crate::telemetry::{LogFormat, TelemetryConfig};

/// Kubernetes operator for MongoDB replica sets and sharded clusters
#[derive(Parser, Debug, Clone)]
#[command(name = "mongo-operator", version, about, long_about = None)]
pub struct OperatorConfig {
    /// Print the MongoDB CRD as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Instances reconciled concurrently
    #[arg(long, env = "MONGO_OPERATOR_CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,

    /// Consecutive failed passes before an instance is reported Degraded
    #[arg(long, env = "MONGO_OPERATOR_FAILURE_BUDGET", default_value_t = 5)]
    pub failure_budget: u32,

    /// Seconds between passes while an instance is settling
    #[arg(long, env = "MONGO_OPERATOR_PROGRESS_REQUEUE_SECS", default_value_t = 10)]
    pub progress_requeue_secs: u64,

    /// Seconds between passes for converged instances
    #[arg(long, env = "MONGO_OPERATOR_STEADY_REQUEUE_SECS", default_value_t = 60)]
    pub steady_requeue_secs: u64,

    /// Maximum age in seconds of an unchanged status
    #[arg(long, env = "MONGO_OPERATOR_STATUS_REFRESH_SECS", default_value_t = 300)]
    pub status_refresh_secs: u64,

    /// Field manager for server-side apply
    #[arg(long, env = "MONGO_OPERATOR_FIELD_MANAGER", default_value = FIELD_MANAGER)]
    pub field_manager: String,

    /// Log output: json or text
    #[arg(long, env = "MONGO_OPERATOR_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

impl OperatorConfig {
    /// Reconcile tunables derived from the flags
    pub fn settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            failure_budget: self.failure_budget.max(1),
            progress_requeue: Duration::from_secs(self.progress_requeue_secs),
            steady_requeue: Duration::from_secs(self.steady_requeue_secs),
            status_refresh: Duration::from_secs(self.status_refresh_secs),
            ..ReconcileSettings::default()
        }
    }

    /// Logging setup derived from the flags
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            format: self.log_format,
            ..TelemetryConfig::default()
        }
    }
}
