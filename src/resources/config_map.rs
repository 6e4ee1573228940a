//! Scripts config map mounted into every pod

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;

use super::pod::{tls_source_secret, KEYFILE_DIR, KEYFILE_SOURCE_DIR, TLS_DIR, TLS_SOURCE_DIR};
use super::{owned_meta, shared_component};
use crate::crd::MongoDB;
use crate::naming::{labels, scripts_config_map_name, MONGODB_PORT};

/// Readiness probe script key
pub const READINESS_PROBE_KEY: &str = "readiness-probe.sh";
/// Init container script key
pub const INIT_SCRIPT_KEY: &str = "init-member.sh";

/// Shell flags for connecting to the local member, TLS-aware
pub(crate) fn local_shell_flags(tls: bool) -> String {
    let mut flags = format!("--host localhost --port {MONGODB_PORT} --quiet");
    if tls {
        flags.push_str(&format!(
            " --tls --tlsCAFile {TLS_DIR}/ca.crt --tlsCertificateKeyFile {TLS_DIR}/server.pem --tlsAllowInvalidHostnames"
        ));
    }
    flags
}

fn readiness_script(tls: bool) -> String {
    format!(
        r#"#!/bin/sh
# Ready once the local process answers ping.
exec mongosh {flags} --eval 'quit(db.adminCommand({{ ping: 1 }}).ok === 1 ? 0 : 1)'
"#,
        flags = local_shell_flags(tls)
    )
}

fn init_script() -> String {
    format!(
        r#"#!/bin/sh
set -eu
# mongod refuses a keyfile readable by group or others.
cp {KEYFILE_SOURCE_DIR}/keyfile {KEYFILE_DIR}/keyfile
chmod 0400 {KEYFILE_DIR}/keyfile

if [ -f {TLS_SOURCE_DIR}/tls.crt ]; then
  cat {TLS_SOURCE_DIR}/tls.crt {TLS_SOURCE_DIR}/tls.key > {TLS_DIR}/server.pem
  if [ -f {TLS_SOURCE_DIR}/ca.crt ]; then
    cp {TLS_SOURCE_DIR}/ca.crt {TLS_DIR}/ca.crt
  else
    cp {TLS_SOURCE_DIR}/tls.crt {TLS_DIR}/ca.crt
  fi
  chmod 0400 {TLS_DIR}/server.pem
fi
"#
    )
}

/// Config map with the readiness probe and init scripts
pub fn build_scripts_config_map(db: &MongoDB) -> ConfigMap {
    let instance = db.name_any();
    let tls = tls_source_secret(db).is_some();

    ConfigMap {
        metadata: owned_meta(
            db,
            scripts_config_map_name(&instance),
            labels(&instance, shared_component(db)),
        ),
        data: Some(BTreeMap::from([
            (READINESS_PROBE_KEY.to_string(), readiness_script(tls)),
            (INIT_SCRIPT_KEY.to_string(), init_script()),
        ])),
        ..Default::default()
    }
}
