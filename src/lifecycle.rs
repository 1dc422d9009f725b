// =============================================================================
// LIFECYCLE MODULE
// =============================================================================
// The drop state machine: which lifecycle actions are legal in which
// state, and which actor may take them.
//
//   pending_approval --Approve(admin)--> approved
//   approved --Activate(admin|scheduler)--> active
//   active <--Pause/Resume(admin)--> inactive
//   active --Close(admin, or scheduler past end_time)--> completed
//   active --Expire(scheduler)--> expired          (terminal, no recovery)
//   any non-terminal --Cancel(admin)--> cancelled
//
// `transition` is a pure function over (status, action, actor); side
// effects (start/end timestamps, discount initialization, settlement)
// belong to the orchestration around it, inside a transaction holding a
// row lock on the drop. The scheduler's end_time gate for Close is also
// the caller's job: this table only knows states and capabilities.
// =============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::DropStatus;

/// Who is asking for the transition. Consumers never drive the drop
/// lifecycle; the variant exists so requests can be rejected with a
/// capability error instead of being unrepresentable at the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Admin,
    Scheduler,
    Consumer,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Actor::Admin => "admin",
            Actor::Scheduler => "scheduler",
            Actor::Consumer => "consumer",
        };
        f.write_str(s)
    }
}

/// Lifecycle actions on a drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropAction {
    Approve,
    Activate,
    Pause,
    Resume,
    Close,
    Expire,
    Cancel,
}

impl fmt::Display for DropAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropAction::Approve => "approve",
            DropAction::Activate => "activate",
            DropAction::Pause => "pause",
            DropAction::Resume => "resume",
            DropAction::Close => "close",
            DropAction::Expire => "expire",
            DropAction::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// Resolve the target state for `action` taken by `actor` on a drop in
/// `status`. Illegal (state, action) pairs fail with `InvalidTransition`;
/// a legal pair taken by the wrong actor fails with a capability error.
pub fn transition(
    status: DropStatus,
    action: DropAction,
    actor: Actor,
) -> Result<DropStatus, AppError> {
    use DropAction::*;
    use DropStatus::*;

    let (target, allowed): (DropStatus, &[Actor]) = match (status, action) {
        (PendingApproval, Approve) => (Approved, &[Actor::Admin]),
        (Approved, Activate) => (Active, &[Actor::Admin, Actor::Scheduler]),
        (Active, Pause) => (Inactive, &[Actor::Admin]),
        (Inactive, Resume) => (Active, &[Actor::Admin]),
        (Active, Close) => (Completed, &[Actor::Admin, Actor::Scheduler]),
        (Active, Expire) => (Expired, &[Actor::Scheduler]),
        (from, Cancel) if !from.is_terminal() => (Cancelled, &[Actor::Admin]),

        (from, action) => {
            return Err(AppError::InvalidTransition {
                from: from.as_str().to_string(),
                action: action.to_string(),
            })
        }
    };

    if !allowed.contains(&actor) {
        return Err(AppError::State(format!(
            "{} may not {} a drop in state {}",
            actor,
            action,
            status.as_str()
        )));
    }

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_through_the_lifecycle() {
        let s = transition(DropStatus::PendingApproval, DropAction::Approve, Actor::Admin).unwrap();
        assert_eq!(s, DropStatus::Approved);

        let s = transition(s, DropAction::Activate, Actor::Scheduler).unwrap();
        assert_eq!(s, DropStatus::Active);

        let s = transition(s, DropAction::Close, Actor::Scheduler).unwrap();
        assert_eq!(s, DropStatus::Completed);
    }

    #[test]
    fn pause_is_a_sub_state_of_active_only() {
        let paused = transition(DropStatus::Active, DropAction::Pause, Actor::Admin).unwrap();
        assert_eq!(paused, DropStatus::Inactive);

        let resumed = transition(paused, DropAction::Resume, Actor::Admin).unwrap();
        assert_eq!(resumed, DropStatus::Active);

        // No pausing from anywhere else
        assert!(transition(DropStatus::Approved, DropAction::Pause, Actor::Admin).is_err());
        // And no closing/expiring while paused
        assert!(transition(DropStatus::Inactive, DropAction::Close, Actor::Admin).is_err());
        assert!(transition(DropStatus::Inactive, DropAction::Expire, Actor::Scheduler).is_err());
    }

    #[test]
    fn any_non_terminal_state_can_be_cancelled_by_admin() {
        for status in [
            DropStatus::PendingApproval,
            DropStatus::Approved,
            DropStatus::Active,
            DropStatus::Inactive,
        ] {
            let s = transition(status, DropAction::Cancel, Actor::Admin).unwrap();
            assert_eq!(s, DropStatus::Cancelled);
        }
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for status in [
            DropStatus::Completed,
            DropStatus::Expired,
            DropStatus::Cancelled,
        ] {
            for action in [
                DropAction::Approve,
                DropAction::Activate,
                DropAction::Pause,
                DropAction::Resume,
                DropAction::Close,
                DropAction::Expire,
                DropAction::Cancel,
            ] {
                assert!(
                    transition(status, action, Actor::Admin).is_err(),
                    "{:?} should reject {:?}",
                    status,
                    action
                );
            }
        }
    }

    #[test]
    fn expired_is_terminal_with_no_manual_recovery() {
        assert!(transition(DropStatus::Expired, DropAction::Activate, Actor::Admin).is_err());
        assert!(transition(DropStatus::Expired, DropAction::Resume, Actor::Admin).is_err());
        assert!(transition(DropStatus::Expired, DropAction::Cancel, Actor::Admin).is_err());
    }

    #[test]
    fn actor_capabilities_are_enforced() {
        // Only admins approve
        assert!(matches!(
            transition(DropStatus::PendingApproval, DropAction::Approve, Actor::Scheduler),
            Err(AppError::State(_))
        ));
        // Only the scheduler expires
        assert!(matches!(
            transition(DropStatus::Active, DropAction::Expire, Actor::Admin),
            Err(AppError::State(_))
        ));
        // Consumers drive nothing
        assert!(transition(DropStatus::Active, DropAction::Close, Actor::Consumer).is_err());
        assert!(transition(DropStatus::PendingApproval, DropAction::Approve, Actor::Consumer).is_err());
    }

    #[test]
    fn illegal_pairs_report_invalid_transition() {
        let err = transition(DropStatus::Approved, DropAction::Close, Actor::Admin).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        let err =
            transition(DropStatus::PendingApproval, DropAction::Activate, Actor::Admin).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }
}
