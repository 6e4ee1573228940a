//! Prometheus Operator wiring

use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::controller::{ensure_applied, Context, ObjectKey};
use crate::crd::{MongoDB, Topology};
use crate::naming::{component_selector, labels, service_monitor_name, Component};
use crate::resources::{instance_namespace, owned_meta, shared_component};
use crate::Error;

fn scraped_component(db: &MongoDB) -> Component {
    match db.spec.topology() {
        Ok(Topology::Sharded(_)) => Component::Mongos,
        _ => Component::ReplicaSet,
    }
}

/// Whether a `ServiceMonitor` is requested
pub fn service_monitor_requested(db: &MongoDB) -> bool {
    db.spec.monitoring_enabled()
        && db
            .spec
            .monitoring
            .as_ref()
            .is_some_and(|m| m.service_monitor)
}

/// `ServiceMonitor` scraping the client service's metrics port
pub fn build_service_monitor(db: &MongoDB) -> Result<Value, Error> {
    let instance = db.name_any();
    let metadata = owned_meta(
        db,
        service_monitor_name(&instance),
        labels(&instance, shared_component(db)),
    );

    Ok(json!({
        "apiVersion": "monitoring.coreos.com/v1",
        "kind": "ServiceMonitor",
        "metadata": serde_json::to_value(metadata)?,
        "spec": {
            "selector": {
                "matchLabels": component_selector(&instance, scraped_component(db))
            },
            "namespaceSelector": {
                "matchNames": [instance_namespace(db)]
            },
            "endpoints": [{
                "port": "metrics",
                "path": "/metrics",
                "interval": "30s"
            }]
        }
    }))
}

/// Apply or remove the `ServiceMonitor`.
///
/// No-op when the Prometheus Operator CRD is not installed.
pub async fn reconcile_service_monitor(ctx: &Context, db: &MongoDB) -> Result<(), Error> {
    if !ctx.crds.service_monitor {
        if service_monitor_requested(db) {
            debug!("ServiceMonitor CRD not installed, skipping");
        }
        return Ok(());
    }

    if service_monitor_requested(db) {
        ensure_applied(ctx, &build_service_monitor(db)?).await?;
        return Ok(());
    }

    let key = ObjectKey::new(
        "monitoring.coreos.com/v1",
        "ServiceMonitor",
        instance_namespace(db),
        service_monitor_name(&db.name_any()),
    );
    if ctx.kube.get(&key).await?.is_some() {
        ctx.kube.delete(&key).await?;
        info!(object = %key, "removed ServiceMonitor");
    }
    Ok(())
}
