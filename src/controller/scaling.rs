//! Replica set membership planning
//!
//! Removal always precedes the replica-count decrement, and additions wait
//! until every new pod is ready, so the workload never drops a member the
//! replica set still counts on.

use std::collections::BTreeSet;

use crate::naming::member_ordinal;

/// Next membership step for one replica set
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberAction {
    /// Membership matches the desired hosts
    InSync,
    /// Remove these hosts before shrinking the workload
    Remove(Vec<String>),
    /// Add these hosts in one reconfiguration
    Add(Vec<String>),
    /// New members exist in the spec but their pods are not all ready yet
    WaitForPods {
        /// Ready pods
        ready: u32,
        /// Desired pods
        desired: u32,
    },
}

/// Plan the next membership change.
///
/// `desired` and `registered` are member hosts; `ready_pods` is the ready
/// replica count of the workload.
pub fn plan_member_change(desired: &[String], registered: &[String], ready_pods: u32) -> MemberAction {
    let desired_set: BTreeSet<&String> = desired.iter().collect();
    let registered_set: BTreeSet<&String> = registered.iter().collect();

    let remove: Vec<String> = registered
        .iter()
        .filter(|h| !desired_set.contains(h))
        .cloned()
        .collect();
    if !remove.is_empty() {
        return MemberAction::Remove(remove);
    }

    let add: Vec<String> = desired
        .iter()
        .filter(|h| !registered_set.contains(h))
        .cloned()
        .collect();
    if add.is_empty() {
        return MemberAction::InSync;
    }

    let wanted = desired.len() as u32;
    if ready_pods < wanted {
        return MemberAction::WaitForPods {
            ready: ready_pods,
            desired: wanted,
        };
    }
    MemberAction::Add(add)
}

/// Replica count that keeps every registered member's pod alive.
///
/// Never below the highest registered ordinal of `workload` plus one.
pub fn safe_replicas(desired: u32, registered: &[String], workload: &str) -> u32 {
    registered
        .iter()
        .filter_map(|h| member_ordinal(h, workload))
        .map(|ordinal| ordinal + 1)
        .fold(desired, u32::max)
}
