//! Shared controller state

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::Client;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::client::{DiscoveredCrds, KubeClientImpl, MongoKubeClient, FIELD_MANAGER};
use crate::admin::{MongoAdmin, PodExecAdmin};
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::retry::RetryConfig;

/// Tunables for reconcile passes
#[derive(Clone, Debug)]
pub struct ReconcileSettings {
    /// Consecutive failed passes before an instance is reported `Degraded`
    pub failure_budget: u32,
    /// Requeue interval while waiting for pods or commands to settle
    pub progress_requeue: Duration,
    /// Requeue interval for converged instances
    pub steady_requeue: Duration,
    /// Maximum age of the status while nothing changes
    pub status_refresh: Duration,
    /// Retry schedule for conflicting applies within a pass
    pub apply_retry: RetryConfig,
    /// Backoff schedule for failed passes
    pub requeue_backoff: RetryConfig,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            failure_budget: 5,
            progress_requeue: Duration::from_secs(10),
            steady_requeue: Duration::from_secs(60),
            status_refresh: Duration::from_secs(300),
            apply_retry: RetryConfig::with_max_attempts(3),
            requeue_backoff: RetryConfig::requeue(),
        }
    }
}

/// Per-instance mutexes ensuring one reconcile pass per identity at a time
#[derive(Default)]
pub struct InstanceLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl InstanceLocks {
    /// Wait for exclusive access to an instance.
    ///
    /// The guard is held for the whole pass.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the mutex of a deleted instance
    pub fn forget(&self, key: &str) {
        self.locks.remove(key);
    }
}

/// Consecutive failed passes per instance
#[derive(Default)]
pub struct FailureTracker {
    counts: DashMap<String, u32>,
}

impl FailureTracker {
    /// Count a failed pass, returning the new streak length
    pub fn record(&self, key: &str) -> u32 {
        let mut entry = self.counts.entry(key.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    }

    /// Current streak length
    pub fn get(&self, key: &str) -> u32 {
        self.counts.get(key).map(|c| *c).unwrap_or(0)
    }

    /// End the streak after a successful pass
    pub fn reset(&self, key: &str) {
        self.counts.remove(key);
    }
}

/// Controller context containing shared state and clients
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .crds(DiscoveredCrds::discover(client.clone()).await?)
///     .settings(settings)
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn MongoKubeClient>,
    /// Administration client for replica set and shard commands
    pub admin: Arc<dyn MongoAdmin>,
    /// Event recorder
    pub events: Arc<dyn EventPublisher>,
    /// Optional CRDs present in the cluster
    pub crds: DiscoveredCrds,
    /// Reconcile tunables
    pub settings: ReconcileSettings,
    /// Single-flight guard per instance
    pub locks: InstanceLocks,
    /// Failure streaks per instance
    pub failures: FailureTracker,
}

/// Key under which per-instance state is tracked
pub fn instance_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl Context {
    /// Drop the lock and failure streak of an instance that no longer exists
    pub fn forget_instance(&self, key: &str) {
        self.locks.forget(key);
        self.failures.reset(key);
    }

    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn MongoKubeClient>, admin: Arc<dyn MongoAdmin>) -> Self {
        Self {
            kube,
            admin,
            events: Arc::new(crate::events::NoopEventPublisher),
            crds: DiscoveredCrds::default(),
            settings: ReconcileSettings::default(),
            locks: InstanceLocks::default(),
            failures: FailureTracker::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    crds: DiscoveredCrds,
    settings: ReconcileSettings,
    field_manager: String,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            crds: DiscoveredCrds::default(),
            settings: ReconcileSettings::default(),
            field_manager: FIELD_MANAGER.to_string(),
        }
    }

    /// Field manager for applies and status writes; also the event reporter
    pub fn field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    /// Set the optional CRDs found at startup
    pub fn crds(mut self, crds: DiscoveredCrds) -> Self {
        self.crds = crds;
        self
    }

    /// Set reconcile tunables
    pub fn settings(mut self, settings: ReconcileSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: Arc::new(
                KubeClientImpl::new(self.client.clone())
                    .with_field_manager(self.field_manager.clone()),
            ),
            admin: Arc::new(PodExecAdmin::new(self.client.clone())),
            events: Arc::new(KubeEventPublisher::new(self.client, &self.field_manager)),
            crds: self.crds,
            settings: self.settings,
            locks: InstanceLocks::default(),
            failures: FailureTracker::default(),
        }
    }
}
