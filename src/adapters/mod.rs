//! Optional-feature adapters
//!
//! Narrow sub-routines the reconciler runs when the corresponding feature is
//! requested on an instance:
//!
//! - [`tls`] - cert-manager `Certificate` and waiting for the serving secret
//! - [`monitoring`] - Prometheus Operator `ServiceMonitor`
//! - [`backup`] - scheduled `mongodump` CronJob and the one-shot restore Job
//!
//! Objects whose CRD is not installed are skipped; the exporter sidecar itself
//! is part of the pod template and needs no adapter.

pub mod backup;
pub mod monitoring;
pub mod tls;

pub use backup::{reconcile_backup, reconcile_restore, RestoreProgress};
pub use monitoring::reconcile_service_monitor;
pub use tls::{ensure_tls, TlsState};
