//! Per-VM diff of desired against observed state.
//!
//! The planner is pure: it looks at one desired record and its observed
//! counterpart and decides what, if anything, has to happen. It never talks
//! to the store or the agent.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::vm::{VmRecord, VmSpec, VmState};

/// A lifecycle command for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Create the VM, or start it if it already exists.
    Create(VmSpec),
    Stop(String),
    Destroy(String),
}

impl Action {
    /// The command that drives `desired` toward `target`.
    pub fn for_target(desired: &VmRecord, target: VmState) -> Option<Action> {
        match target {
            VmState::Running => Some(Action::Create(desired.spec())),
            VmState::Stopped => Some(Action::Stop(desired.name.clone())),
            VmState::Destroyed => Some(Action::Destroy(desired.name.clone())),
            VmState::Requested | VmState::Provisioning | VmState::Failed => None,
        }
    }

    pub fn vm_name(&self) -> &str {
        match self {
            Action::Create(spec) => &spec.name,
            Action::Stop(name) | Action::Destroy(name) => name,
        }
    }

    /// Observed state written back once the agent acknowledges the command.
    pub fn expected_state(&self) -> VmState {
        match self {
            Action::Create(_) => VmState::Running,
            Action::Stop(_) => VmState::Stopped,
            Action::Destroy(_) => VmState::Destroyed,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Create(_) => "create",
            Action::Stop(_) => "stop",
            Action::Destroy(_) => "destroy",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.vm_name())
    }
}

/// Outcome of planning a single VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Observed already matches the target.
    InSync,
    /// A previous action is still under way and has not stalled yet.
    InProgress,
    /// Observed is `Destroyed` but the operator wants something else. The
    /// name has to be pruned before it can be reused.
    Terminal,
    Act(Action),
    /// The desired record names a state with no target.
    Invalid(VmState),
}

/// Decide what to do for one VM.
///
/// `stall_after` bounds how long an observed `Requested`/`Provisioning`
/// record is trusted to still be making progress.
pub fn plan(
    desired: &VmRecord,
    observed: Option<&VmRecord>,
    now: DateTime<Utc>,
    stall_after: Duration,
) -> Decision {
    let Some(target) = desired.state.target() else {
        return Decision::Invalid(desired.state);
    };
    let act = || match Action::for_target(desired, target) {
        Some(action) => Decision::Act(action),
        None => Decision::Invalid(desired.state),
    };

    let Some(observed) = observed else {
        return act();
    };

    if observed.state.is_terminal() {
        return if target.is_terminal() {
            Decision::InSync
        } else {
            Decision::Terminal
        };
    }

    if observed.state.is_in_progress() {
        // A timestamp from the future counts as fresh
        let age = (now - observed.updated_at).to_std().unwrap_or(Duration::ZERO);
        return if age < stall_after {
            Decision::InProgress
        } else {
            act()
        };
    }

    if observed.state == target {
        Decision::InSync
    } else {
        act()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALL: Duration = Duration::from_secs(60);

    fn record(state: VmState) -> VmRecord {
        VmRecord::new("web1", 2, 2048, "ubuntu-22.04", state)
    }

    #[test]
    fn test_absent_observed_creates() {
        let desired = record(VmState::Running);
        let decision = plan(&desired, None, Utc::now(), STALL);
        assert_eq!(
            decision,
            Decision::Act(Action::Create(VmSpec {
                name: "web1".into(),
                cpu: 2,
                ram: 2048,
                image: "ubuntu-22.04".into(),
            }))
        );
    }

    #[test]
    fn test_requested_means_run() {
        let desired = record(VmState::Requested);
        let observed = record(VmState::Running);
        assert_eq!(plan(&desired, Some(&observed), Utc::now(), STALL), Decision::InSync);
        assert!(matches!(
            plan(&desired, None, Utc::now(), STALL),
            Decision::Act(Action::Create(_))
        ));
    }

    #[test]
    fn test_matching_states_are_in_sync() {
        for state in [VmState::Running, VmState::Stopped, VmState::Destroyed] {
            let decision = plan(&record(state), Some(&record(state)), Utc::now(), STALL);
            assert_eq!(decision, Decision::InSync, "state {state}");
        }
    }

    #[test]
    fn test_mismatch_picks_action_from_desired() {
        let now = Utc::now();
        let running = record(VmState::Running);
        let stopped = record(VmState::Stopped);
        let destroyed = record(VmState::Destroyed);

        assert_eq!(
            plan(&stopped, Some(&running), now, STALL),
            Decision::Act(Action::Stop("web1".into()))
        );
        assert_eq!(
            plan(&destroyed, Some(&running), now, STALL),
            Decision::Act(Action::Destroy("web1".into()))
        );
        assert!(matches!(
            plan(&running, Some(&stopped), now, STALL),
            Decision::Act(Action::Create(_))
        ));
    }

    #[test]
    fn test_failed_is_retried() {
        let mut observed = record(VmState::Failed);
        observed.last_error = Some("agent unavailable".into());
        assert!(matches!(
            plan(&record(VmState::Running), Some(&observed), Utc::now(), STALL),
            Decision::Act(Action::Create(_))
        ));
    }

    #[test]
    fn test_provisioning_waits_until_stalled() {
        let desired = record(VmState::Running);
        let mut observed = record(VmState::Provisioning);
        let now = Utc::now();

        observed.updated_at = now - chrono::Duration::seconds(10);
        assert_eq!(plan(&desired, Some(&observed), now, STALL), Decision::InProgress);

        observed.updated_at = now - chrono::Duration::seconds(61);
        assert!(matches!(
            plan(&desired, Some(&observed), now, STALL),
            Decision::Act(Action::Create(_))
        ));
    }

    #[test]
    fn test_future_timestamp_counts_as_fresh() {
        let now = Utc::now();
        let mut observed = record(VmState::Requested);
        observed.updated_at = now + chrono::Duration::seconds(30);
        assert_eq!(
            plan(&record(VmState::Running), Some(&observed), now, STALL),
            Decision::InProgress
        );
    }

    #[test]
    fn test_destroyed_observed_is_terminal() {
        let observed = record(VmState::Destroyed);
        assert_eq!(
            plan(&record(VmState::Running), Some(&observed), Utc::now(), STALL),
            Decision::Terminal
        );
        assert_eq!(
            plan(&record(VmState::Stopped), Some(&observed), Utc::now(), STALL),
            Decision::Terminal
        );
    }

    #[test]
    fn test_outcome_states_are_invalid_intent() {
        for state in [VmState::Provisioning, VmState::Failed] {
            assert_eq!(
                plan(&record(state), None, Utc::now(), STALL),
                Decision::Invalid(state)
            );
        }
    }

    #[test]
    fn test_action_expected_state() {
        assert_eq!(
            Action::for_target(&record(VmState::Running), VmState::Running)
                .unwrap()
                .expected_state(),
            VmState::Running
        );
        assert_eq!(Action::Stop("a".into()).expected_state(), VmState::Stopped);
        assert_eq!(Action::Destroy("a".into()).expected_state(), VmState::Destroyed);
        assert_eq!(Action::Destroy("db1".into()).to_string(), "destroy db1");
        assert!(Action::for_target(&record(VmState::Running), VmState::Failed).is_none());
    }
}
