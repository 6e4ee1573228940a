//! mongo-operator - runs the MongoDB controller

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::runtime::controller::{Config as ControllerConfig, Error as ControllerError};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use mongo_operator::config::OperatorConfig;
use mongo_operator::controller::{error_policy, instance_key, reconcile, Context, DiscoveredCrds};
use mongo_operator::crd::MongoDB;
use mongo_operator::naming::{LABEL_MANAGED_BY, MANAGED_BY};
use mongo_operator::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();

    if config.crd {
        let crd = serde_yaml::to_string(&MongoDB::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(config.telemetry())?;
    run_controller(config).await
}

fn namespaced<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    tracing::info!(
        namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        concurrency = config.concurrency,
        "mongo-operator starting"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let crds = DiscoveredCrds::discover(client.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to discover optional CRDs: {}", e))?;

    let ctx = Arc::new(
        Context::builder(client.clone())
            .crds(crds)
            .settings(config.settings())
            .field_manager(config.field_manager.clone())
            .build(),
    );

    let namespace = config.watch_namespace.as_deref();
    let owned = WatcherConfig::default().labels(&format!("{LABEL_MANAGED_BY}={MANAGED_BY}"));

    Controller::new(namespaced::<MongoDB>(&client, namespace), WatcherConfig::default())
        .owns(namespaced::<StatefulSet>(&client, namespace), owned.clone())
        .owns(namespaced::<Deployment>(&client, namespace), owned.clone())
        .owns(namespaced::<Service>(&client, namespace), owned.clone())
        .owns(namespaced::<ConfigMap>(&client, namespace), owned)
        .with_config(ControllerConfig::default().concurrency(config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| {
            let ctx = ctx.clone();
            async move {
                match result {
                    Ok((instance, action)) => {
                        tracing::debug!(instance = %instance, ?action, "reconciliation completed");
                    }
                    Err(ControllerError::ObjectNotFound(instance)) => {
                        let namespace = instance.namespace.as_deref().unwrap_or("default");
                        tracing::debug!(instance = %instance, "instance deleted, forgetting it");
                        ctx.forget_instance(&instance_key(namespace, &instance.name));
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "reconciliation error");
                    }
                }
            }
        })
        .await;

    tracing::info!("mongo-operator shutting down");
    Ok(())
}
