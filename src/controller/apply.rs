//! Idempotent application of desired objects

use serde_json::Value;
use tracing::{debug, info};

use super::client::{to_object, ObjectKey};
use super::diff::{needs_apply, WorkloadReadiness};
use super::Context;
use crate::crd::MongoDB;
use crate::resources::{build_keyfile_secret, DesiredObjects};
use crate::retry::retry_with_backoff;
use crate::Error;

/// Apply an object unless the live copy already matches it.
///
/// Returns the live object after the call. Conflicts are retried against a
/// fresh read; ownership is never forced.
pub async fn ensure_applied(ctx: &Context, desired: &Value) -> Result<Value, Error> {
    let key = ObjectKey::of(desired)?;

    retry_with_backoff(
        &ctx.settings.apply_retry,
        "apply",
        || async {
            let live = ctx.kube.get(&key).await?;
            if !needs_apply(desired, live.as_ref()) {
                debug!(object = %key, "up to date");
                return Ok(live.unwrap_or_else(|| desired.clone()));
            }
            ctx.kube.apply(desired).await?;
            info!(object = %key, "applied");
            Ok(ctx.kube.get(&key).await?.unwrap_or_else(|| desired.clone()))
        },
        Error::is_retryable,
    )
    .await
}

/// Apply a typed object, see [`ensure_applied`]
pub async fn ensure_typed<K: serde::Serialize>(ctx: &Context, object: &K) -> Result<Value, Error> {
    ensure_applied(ctx, &to_object(object)?).await
}

/// Apply a workload and report its rollout state
pub async fn ensure_workload<K: serde::Serialize>(
    ctx: &Context,
    object: &K,
) -> Result<WorkloadReadiness, Error> {
    let live = ensure_typed(ctx, object).await?;
    Ok(WorkloadReadiness::from_object(&live))
}

/// Secret, config map and services, in that order.
///
/// The keyfile secret is only ever created: existing key material is never
/// replaced.
pub async fn ensure_shared(ctx: &Context, db: &MongoDB, objects: &DesiredObjects) -> Result<(), Error> {
    let secret_key = ObjectKey::new(
        "v1",
        "Secret",
        crate::resources::instance_namespace(db),
        crate::naming::keyfile_secret_name(&kube::ResourceExt::name_any(db)),
    );
    if ctx.kube.get(&secret_key).await?.is_none() {
        let secret = build_keyfile_secret(db)?;
        if ctx.kube.create_if_absent(&to_object(&secret)?).await? {
            info!(secret = %secret_key, "created keyfile secret");
        }
    }

    ensure_typed(ctx, &objects.config_map).await?;
    ensure_typed(ctx, &objects.headless_service).await?;
    ensure_typed(ctx, &objects.client_service).await?;
    Ok(())
}
