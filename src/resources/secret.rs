//! Keyfile secret
//!
//! The keyfile authenticates members to each other. It is generated once per
//! instance; the reconciler only creates it when absent, because replacing it
//! would lock already-initialized members out of the replica set.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use rand::rngs::OsRng;
use rand::RngCore;

use super::{owned_meta, shared_component};
use crate::crd::MongoDB;
use crate::naming::{keyfile_secret_name, labels};
use crate::Error;

/// Key holding the keyfile contents
pub const KEYFILE_KEY: &str = "keyfile";

/// Random bytes per keyfile; base64 encodes to 1008 characters, under mongod's 1024 limit
const KEYFILE_BYTES: usize = 756;

/// Build the keyfile secret with fresh random key material.
///
/// Fails only when the operating system entropy source is unavailable.
pub fn build_keyfile_secret(db: &MongoDB) -> Result<Secret, Error> {
    let mut material = vec![0u8; KEYFILE_BYTES];
    OsRng
        .try_fill_bytes(&mut material)
        .map_err(|e| Error::entropy(e.to_string()))?;

    let instance = db.name_any();

    Ok(Secret {
        metadata: owned_meta(
            db,
            keyfile_secret_name(&instance),
            labels(&instance, shared_component(db)),
        ),
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([(
            KEYFILE_KEY.to_string(),
            STANDARD.encode(&material),
        )])),
        ..Default::default()
    })
}
