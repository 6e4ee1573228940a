//! Desired-vs-live comparison and workload readiness

use serde_json::Value;

/// Whether `desired` must be applied over `live`.
///
/// The live object is considered up to date when every field of the desired
/// object is present with an equal value; fields only the server sets
/// (defaults, status, managed fields) are ignored. Arrays must match
/// element-wise with the same length.
pub fn needs_apply(desired: &Value, live: Option<&Value>) -> bool {
    match live {
        None => true,
        Some(live) => !is_subset(desired, live),
    }
}

fn is_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d
            .iter()
            .all(|(k, v)| v.is_null() || l.get(k).is_some_and(|lv| is_subset(v, lv))),
        (Value::Array(d), Value::Array(l)) => {
            d.len() == l.len() && d.iter().zip(l).all(|(dv, lv)| is_subset(dv, lv))
        }
        (Value::Number(d), Value::Number(l)) => d.as_f64() == l.as_f64(),
        (d, l) => d == l,
    }
}

/// Rollout state of a StatefulSet or Deployment read from its live object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkloadReadiness {
    /// `spec.replicas`
    pub desired: u32,
    /// `status.readyReplicas`
    pub ready: u32,
    /// `status.updatedReplicas`
    pub updated: u32,
    /// The controller has observed the latest spec
    pub observed: bool,
}

impl WorkloadReadiness {
    /// Read readiness from a live workload object
    pub fn from_object(object: &Value) -> Self {
        let count = |pointer: &str| {
            object
                .pointer(pointer)
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32
        };
        let generation = object.pointer("/metadata/generation").and_then(Value::as_i64);
        let observed_generation = object
            .pointer("/status/observedGeneration")
            .and_then(Value::as_i64);

        Self {
            desired: count("/spec/replicas"),
            ready: count("/status/readyReplicas"),
            updated: count("/status/updatedReplicas"),
            observed: match (generation, observed_generation) {
                (Some(g), Some(o)) => o >= g,
                (None, _) => true,
                _ => false,
            },
        }
    }

    /// Every desired pod runs the current template and is ready
    pub fn is_ready(&self) -> bool {
        self.observed && self.ready >= self.desired && self.updated >= self.desired
    }
}
