//! Status transitions
//!
//! A pass works on a copy of the status (initialized replica sets, registered
//! shards, restore flag) and finishes it with an [`Outcome`]. The status is
//! written only when something visible changed or the last write is older
//! than the refresh interval.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::crd::{Condition, ConditionStatus, InstancePhase, MongoDBStatus};

/// Reason recorded when the failure budget runs out
pub const RETRY_BUDGET_EXHAUSTED: &str = "RetryBudgetExhausted";

/// What a reconcile pass concluded
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    /// Phase to report
    pub phase: InstancePhase,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// Healthy data-bearing members, when known
    pub ready_members: Option<u32>,
}

impl Outcome {
    /// Outcome with the given phase, reason and message
    pub fn new(phase: InstancePhase, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase,
            reason: reason.into(),
            message: message.into(),
            ready_members: None,
        }
    }

    /// Record the healthy member count
    pub fn with_ready_members(mut self, count: u32) -> Self {
        self.ready_members = Some(count);
        self
    }

    /// Whether the instance should be rechecked soon
    pub fn is_settling(&self) -> bool {
        !matches!(self.phase, InstancePhase::Ready | InstancePhase::Failed)
    }
}

/// Whether the instance has completed bootstrap at least once
pub fn has_bootstrapped(status: Option<&MongoDBStatus>) -> bool {
    status.is_some_and(|s| {
        matches!(
            s.phase,
            InstancePhase::Ready | InstancePhase::Scaling | InstancePhase::Degraded
        )
    })
}

/// Apply an outcome to the working status
pub fn finish(
    previous: Option<&MongoDBStatus>,
    mut status: MongoDBStatus,
    outcome: &Outcome,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> MongoDBStatus {
    let phase_changed = previous.map(|p| p.phase) != Some(outcome.phase);

    status.phase = outcome.phase;
    status.reason = Some(outcome.reason.clone());
    status.message = Some(outcome.message.clone());
    status.observed_generation = generation;
    status.last_update_time = Some(now);
    if outcome.ready_members.is_some() {
        status.ready_members = outcome.ready_members;
    }
    if phase_changed || status.last_transition_time.is_none() {
        status.last_transition_time = Some(now);
    }

    let ready = if outcome.phase == InstancePhase::Ready {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };
    let transition = previous
        .and_then(|p| p.conditions.iter().find(|c| c.type_ == "Ready"))
        .filter(|c| c.status == ready)
        .map(|c| c.last_transition_time)
        .unwrap_or(now);
    status.conditions = vec![Condition {
        type_: "Ready".to_string(),
        status: ready,
        reason: outcome.reason.clone(),
        message: outcome.message.clone(),
        last_transition_time: transition,
    }];

    status
}

/// Whether `next` has to be written over `previous`
pub fn should_write(
    previous: Option<&MongoDBStatus>,
    next: &MongoDBStatus,
    now: DateTime<Utc>,
    refresh: Duration,
) -> bool {
    let Some(previous) = previous else {
        return true;
    };

    let visible_change = previous.phase != next.phase
        || previous.reason != next.reason
        || previous.message != next.message
        || previous.observed_generation != next.observed_generation
        || previous.ready_members != next.ready_members
        || previous.initialized_replica_sets != next.initialized_replica_sets
        || previous.registered_shards != next.registered_shards
        || previous.consecutive_failures != next.consecutive_failures
        || previous.restore_completed != next.restore_completed;
    if visible_change {
        return true;
    }

    let refresh = chrono::Duration::from_std(refresh).unwrap_or(chrono::Duration::MAX);
    previous
        .last_update_time
        .map_or(true, |last| now - last >= refresh)
}

/// Record a confirmed replica set initiation
pub fn mark_initialized(status: &mut MongoDBStatus, replica_set: &str) {
    if !status.is_initialized(replica_set) {
        status.initialized_replica_sets.push(replica_set.to_string());
        status.initialized_replica_sets.sort();
    }
}

/// Forget a replica set (data lost or shard removed)
pub fn forget_initialized(status: &mut MongoDBStatus, replica_set: &str) {
    status.initialized_replica_sets.retain(|rs| rs != replica_set);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn story_transition_time_moves_only_on_phase_change() {
        let provisioning = Outcome::new(InstancePhase::Provisioning, "WaitingForPods", "0/3 ready");
        let first = finish(None, MongoDBStatus::default(), &provisioning, Some(1), at(0));
        assert_eq!(first.last_transition_time, Some(at(0)));

        let again = finish(Some(&first), first.clone(), &provisioning, Some(1), at(30));
        assert_eq!(again.last_transition_time, Some(at(0)));
        assert_eq!(again.last_update_time, Some(at(30)));

        let ready = Outcome::new(InstancePhase::Ready, "InstanceReady", "3/3 healthy");
        let done = finish(Some(&again), again.clone(), &ready, Some(1), at(60));
        assert_eq!(done.last_transition_time, Some(at(60)));
        assert_eq!(done.conditions[0].status, ConditionStatus::True);
    }

    #[test]
    fn story_steady_status_refreshes_every_interval() {
        let ready = Outcome::new(InstancePhase::Ready, "InstanceReady", "3/3 healthy");
        let written = finish(None, MongoDBStatus::default(), &ready, Some(1), at(0));
        let refresh = Duration::from_secs(300);

        let next = finish(Some(&written), written.clone(), &ready, Some(1), at(60));
        assert!(!should_write(Some(&written), &next, at(60), refresh));

        let later = finish(Some(&written), written.clone(), &ready, Some(1), at(300));
        assert!(should_write(Some(&written), &later, at(300), refresh));
    }

    #[test]
    fn visible_changes_are_written_immediately() {
        let ready = Outcome::new(InstancePhase::Ready, "InstanceReady", "3/3 healthy");
        let written = finish(None, MongoDBStatus::default(), &ready, Some(1), at(0));

        let degraded = Outcome::new(InstancePhase::Degraded, "QuorumLost", "1/3 healthy");
        let next = finish(Some(&written), written.clone(), &degraded, Some(1), at(1));
        assert!(should_write(Some(&written), &next, at(1), Duration::from_secs(300)));
        assert_eq!(next.conditions[0].status, ConditionStatus::False);
    }

    #[test]
    fn initialized_sets_are_unique() {
        let mut status = MongoDBStatus::default();
        mark_initialized(&mut status, "orders-shard-1");
        mark_initialized(&mut status, "orders-cfg");
        mark_initialized(&mut status, "orders-cfg");
        assert_eq!(status.initialized_replica_sets, vec!["orders-cfg", "orders-shard-1"]);
        forget_initialized(&mut status, "orders-cfg");
        assert!(!status.is_initialized("orders-cfg"));
    }

    #[test]
    fn only_steady_phases_count_as_bootstrapped() {
        let mut status = MongoDBStatus::default();
        assert!(!has_bootstrapped(Some(&status)));
        status.phase = InstancePhase::Initializing;
        assert!(!has_bootstrapped(Some(&status)));
        status.phase = InstancePhase::Degraded;
        assert!(has_bootstrapped(Some(&status)));
        assert!(!has_bootstrapped(None));
    }
}
