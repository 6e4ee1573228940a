//! mongosh scripts and reply parsing
//!
//! Every script is wrapped so that it prints exactly one JSON line:
//! `{"ok":1,...}` on success or `{"ok":0,"code":..,"codeName":..,"errmsg":..}`
//! when the command throws. Values are embedded as JSON literals, which are
//! valid JavaScript.

use serde::Deserialize;
use serde_json::Value;

use super::{InitiateOutcome, ReplicaSetStatus, ShardInfo, ShardRemoval};
use crate::Error;

/// Server error codes
pub(crate) mod codes {
    pub const BAD_VALUE: i64 = 2;
    pub const FAILED_TO_PARSE: i64 = 9;
    pub const UNAUTHORIZED: i64 = 13;
    pub const TYPE_MISMATCH: i64 = 14;
    pub const AUTHENTICATION_FAILED: i64 = 18;
    pub const ALREADY_INITIALIZED: i64 = 23;
    pub const COMMAND_NOT_FOUND: i64 = 59;
    pub const SHARD_NOT_FOUND: i64 = 70;
    pub const INVALID_OPTIONS: i64 = 72;
    pub const NOT_YET_INITIALIZED: i64 = 94;
}

/// Codes that will not clear by retrying the same command
const FATAL_CODES: &[i64] = &[
    codes::BAD_VALUE,
    codes::FAILED_TO_PARSE,
    codes::UNAUTHORIZED,
    codes::TYPE_MISMATCH,
    codes::AUTHENTICATION_FAILED,
    codes::COMMAND_NOT_FOUND,
    codes::INVALID_OPTIONS,
];

/// A script paired with the command name used in errors and logs
#[derive(Clone, Debug)]
pub(crate) struct Script {
    pub command: &'static str,
    pub source: String,
}

fn literal<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn wrap(command: &'static str, body: &str) -> Script {
    let source = format!(
        "(function () {{ try {{ const r = (function () {{ {body} }})(); \
print(EJSON.stringify(Object.assign({{ ok: 1 }}, r || {{}}), {{ relaxed: true }})); \
}} catch (e) {{ print(EJSON.stringify({{ ok: 0, code: e.code || 0, codeName: e.codeName || '', \
errmsg: String(e.message || e) }})); }} }})()"
    );
    Script { command, source }
}

pub(crate) fn initiate(replica_set: &str, members: &[String], config_server: bool) -> Script {
    let members: Vec<Value> = members
        .iter()
        .enumerate()
        .map(|(id, host)| serde_json::json!({ "_id": id, "host": host }))
        .collect();
    let config = serde_json::json!({
        "_id": replica_set,
        "configsvr": config_server,
        "members": members,
    });
    wrap(
        "replSetInitiate",
        &format!("db.adminCommand({{ replSetInitiate: {} }}); return {{}};", literal(&config)),
    )
}

/// Membership changes are applied one voting member per step, since the
/// server rejects a new config that changes more than one vote at a time.
pub(crate) fn reconfigure(add: &[String], remove: &[String]) -> Script {
    wrap(
        "replSetReconfig",
        &format!(
            "const add = {add}; const remove = {remove}; \
for (const host of remove) {{ \
  const cfg = rs.conf(); \
  if (!cfg.members.some(m => m.host === host)) continue; \
  cfg.members = cfg.members.filter(m => m.host !== host); \
  rs.reconfig(cfg); \
}} \
for (const host of add) {{ \
  const cfg = rs.conf(); \
  if (cfg.members.some(m => m.host === host)) continue; \
  const id = cfg.members.reduce((max, m) => Math.max(max, m._id), -1) + 1; \
  cfg.members.push({{ _id: id, host: host }}); \
  rs.reconfig(cfg); \
}} \
return {{}};",
            add = literal(add),
            remove = literal(remove),
        ),
    )
}

pub(crate) fn status() -> Script {
    wrap(
        "replSetGetStatus",
        &format!(
            "try {{ \
  const s = db.adminCommand({{ replSetGetStatus: 1 }}); \
  return {{ initialized: true, status: {{ set: s.set, members: s.members.map(m => ({{ host: m.name, state: m.stateStr, healthy: m.health === 1 }})) }} }}; \
}} catch (e) {{ \
  if (e.code === {}) return {{ initialized: false }}; \
  throw e; \
}}",
            codes::NOT_YET_INITIALIZED
        ),
    )
}

pub(crate) fn add_shard(connection_string: &str) -> Script {
    wrap(
        "addShard",
        &format!(
            "db.adminCommand({{ addShard: {} }}); return {{}};",
            literal(connection_string)
        ),
    )
}

pub(crate) fn list_shards() -> Script {
    wrap(
        "listShards",
        "const r = db.adminCommand({ listShards: 1 }); \
return { shards: r.shards.map(s => ({ id: s._id, host: s.host, draining: !!s.draining })) };",
    )
}

pub(crate) fn remove_shard(shard: &str) -> Script {
    wrap(
        "removeShard",
        &format!(
            "const r = db.adminCommand({{ removeShard: {} }}); \
return {{ state: r.state, remaining: r.remaining ? r.remaining.chunks : null }};",
            literal(shard)
        ),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Failure {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    code_name: String,
    #[serde(default)]
    errmsg: String,
}

/// A command the server rejected
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct CommandFailure {
    pub code: i64,
    pub code_name: String,
    pub message: String,
}

impl CommandFailure {
    pub fn is_fatal(&self) -> bool {
        FATAL_CODES.contains(&self.code)
    }

    pub fn into_error(self, command: &str, target: &str) -> Error {
        let message = if self.code_name.is_empty() {
            self.message
        } else {
            format!("{} ({}): {}", self.code_name, self.code, self.message)
        };
        if FATAL_CODES.contains(&self.code) {
            Error::admin_permanent(command, target, message)
        } else {
            Error::admin(command, target, message)
        }
    }
}

/// Outcome of parsing shell output
#[derive(Debug, PartialEq)]
pub(crate) enum Reply {
    Ok(Value),
    Failed(CommandFailure),
    /// No JSON line in the output; the shell never ran the script
    Unparseable(String),
}

/// Parse the last JSON line printed by a wrapped script
pub(crate) fn parse_reply(output: &str) -> Reply {
    let line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('{'));

    let Some(line) = line else {
        return Reply::Unparseable(output.trim().to_string());
    };

    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Reply::Unparseable(format!("{e}: {line}")),
    };

    let ok = value.get("ok").and_then(Value::as_f64).unwrap_or(0.0);
    if ok >= 1.0 {
        return Reply::Ok(value);
    }

    match serde_json::from_value::<Failure>(value) {
        Ok(f) => Reply::Failed(CommandFailure {
            code: f.code,
            code_name: f.code_name,
            message: f.errmsg,
        }),
        Err(e) => Reply::Unparseable(e.to_string()),
    }
}

/// Turn a reply into a value or a classified error
pub(crate) fn expect_ok(reply: Reply, command: &str, target: &str) -> Result<Value, Error> {
    match reply {
        Reply::Ok(value) => Ok(value),
        Reply::Failed(failure) => Err(failure.into_error(command, target)),
        Reply::Unparseable(output) => Err(Error::admin(
            command,
            target,
            format!("unrecognized shell output: {output}"),
        )),
    }
}

pub(crate) fn initiate_outcome(
    reply: Reply,
    target: &str,
) -> Result<InitiateOutcome, Error> {
    match reply {
        Reply::Failed(f) if f.code == codes::ALREADY_INITIALIZED => {
            Ok(InitiateOutcome::AlreadyInitialized)
        }
        other => expect_ok(other, "replSetInitiate", target).map(|_| InitiateOutcome::Initiated),
    }
}

pub(crate) fn status_value(value: Value) -> Result<Option<ReplicaSetStatus>, Error> {
    if !value
        .get("initialized")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Ok(None);
    }
    let status = value
        .get("status")
        .cloned()
        .ok_or_else(|| Error::serialization("replSetGetStatus reply without status"))?;
    Ok(Some(serde_json::from_value(status)?))
}

pub(crate) fn shards_value(value: Value) -> Result<Vec<ShardInfo>, Error> {
    let shards = value.get("shards").cloned().unwrap_or(Value::Array(vec![]));
    Ok(serde_json::from_value(shards)?)
}

pub(crate) fn removal_outcome(reply: Reply, target: &str) -> Result<ShardRemoval, Error> {
    let value = match reply {
        Reply::Failed(f) if f.code == codes::SHARD_NOT_FOUND => return Ok(ShardRemoval::Completed),
        other => expect_ok(other, "removeShard", target)?,
    };
    match value.get("state").and_then(Value::as_str) {
        Some("completed") => Ok(ShardRemoval::Completed),
        _ => Ok(ShardRemoval::Draining {
            remaining_chunks: value.get("remaining").and_then(Value::as_u64),
        }),
    }
}
