//! Serving certificates
//!
//! With an `issuerRef`, a cert-manager `Certificate` covering the client
//! service and every member address is applied. Either way the workloads are
//! held back until the serving secret exists, since every pod mounts it.

use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::controller::{ensure_applied, Context, ObjectKey};
use crate::crd::MongoDB;
use crate::naming::{client_service_name, headless_service_name, labels, tls_secret_name};
use crate::resources::{instance_namespace, owned_meta, shared_component, tls_source_secret};
use crate::Error;

/// TLS readiness of an instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TlsState {
    /// TLS is not enabled
    NotRequired,
    /// The serving secret exists
    Ready,
    /// Waiting for the named secret to appear
    Pending(String),
}

/// DNS names the serving certificate must cover
pub fn certificate_dns_names(db: &MongoDB) -> Vec<String> {
    let instance = db.name_any();
    let namespace = instance_namespace(db);
    let client = client_service_name(&instance);
    let headless = headless_service_name(&instance);
    vec![
        client.clone(),
        format!("{client}.{namespace}"),
        format!("{client}.{namespace}.svc"),
        format!("{client}.{namespace}.svc.cluster.local"),
        format!("*.{headless}.{namespace}.svc.cluster.local"),
        format!("*.{headless}.{namespace}.svc"),
        "localhost".to_string(),
    ]
}

/// cert-manager `Certificate` for the instance, `None` without an issuer
pub fn build_certificate(db: &MongoDB) -> Result<Option<Value>, Error> {
    let Some(issuer) = db
        .spec
        .tls
        .as_ref()
        .filter(|t| t.enabled)
        .and_then(|t| t.issuer_ref.as_ref())
    else {
        return Ok(None);
    };

    let instance = db.name_any();
    let name = tls_secret_name(&instance);
    let metadata = owned_meta(db, name.clone(), labels(&instance, shared_component(db)));

    Ok(Some(json!({
        "apiVersion": "cert-manager.io/v1",
        "kind": "Certificate",
        "metadata": serde_json::to_value(metadata)?,
        "spec": {
            "secretName": name,
            "commonName": client_service_name(&instance),
            "dnsNames": certificate_dns_names(db),
            "usages": ["server auth", "client auth"],
            "issuerRef": {
                "name": issuer.name,
                "kind": issuer.kind,
                "group": "cert-manager.io"
            }
        }
    })))
}

/// Apply the certificate if one is requested and report whether pods can start
pub async fn ensure_tls(ctx: &Context, db: &MongoDB) -> Result<TlsState, Error> {
    let Some(secret) = tls_source_secret(db) else {
        return Ok(TlsState::NotRequired);
    };

    if let Some(certificate) = build_certificate(db)? {
        if !ctx.crds.certificate {
            return Err(Error::validation_for_field(
                db.name_any(),
                "spec.tls.issuerRef",
                "cert-manager is not installed in the cluster",
            ));
        }
        ensure_applied(ctx, &certificate).await?;
    }

    let key = ObjectKey::new("v1", "Secret", instance_namespace(db), secret.clone());
    if ctx.kube.get(&key).await?.is_some() {
        debug!(secret = %secret, "serving secret present");
        Ok(TlsState::Ready)
    } else {
        info!(secret = %secret, "waiting for serving secret");
        Ok(TlsState::Pending(secret))
    }
}
