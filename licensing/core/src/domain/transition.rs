// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Status Transition Rules
//!
//! Pure, stateless encoding of the application state graph and the
//! ownership rule. Every status write in the crate is preceded by a call
//! into [`StatusTransitionValidator`].
//!
//! | From | Action | To | Initiator |
//! |------|--------|----|-----------|
//! | `Pending` | Approve | `Active` | user |
//! | `Pending` | Reject | `Rejected` | user |
//! | `Pending` | Cancel | `Cancelled` | user |
//! | `Active` | Revoke | `Revoked` | user |
//! | `Pending`, `Active` | AwaitNotification | `AwaitingNotification` | system (side effect of Approve) |
//! | `AwaitingNotification` | ConfirmNotification | `Active` | system (worker, after a successful send) |
//! | `AwaitingNotification` | FailNotification | `FailedNotification` | system (dead-letter handler) |
//!
//! Anything else is rejected.

use std::fmt;
use thiserror::Error;

use crate::domain::actor::{Actor, ActorRole};
use crate::domain::application::{ApplicationStatus, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationAction {
    Approve,
    Reject,
    Cancel,
    Revoke,
    AwaitNotification,
    ConfirmNotification,
    FailNotification,
}

impl ApplicationAction {
    /// Actions only the notification pipeline may perform
    pub fn is_system_only(&self) -> bool {
        matches!(
            self,
            Self::AwaitNotification | Self::ConfirmNotification | Self::FailNotification
        )
    }

    /// Past-tense verb used in generated reasons
    pub fn past_tense(&self) -> &'static str {
        match self {
            Self::Approve => "approved",
            Self::Reject => "rejected",
            Self::Cancel => "cancelled",
            Self::Revoke => "revoked",
            Self::AwaitNotification => "queued for notification",
            Self::ConfirmNotification => "notified",
            Self::FailNotification => "marked as notification failure",
        }
    }
}

impl fmt::Display for ApplicationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Cancel => "cancel",
            Self::Revoke => "revoke",
            Self::AwaitNotification => "await notification for",
            Self::ConfirmNotification => "confirm notification for",
            Self::FailNotification => "fail notification for",
        };
        f.write_str(verb)
    }
}

/// Who is requesting the transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    User(ActorRole),
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Cannot {action} application: Application is in {current} status")]
    InvalidTransition {
        current: ApplicationStatus,
        action: ApplicationAction,
    },

    #[error("Cannot {action} application: only the system may perform this transition")]
    SystemOnly { action: ApplicationAction },

    #[error("Access denied: user {actor} does not own this application")]
    AccessDenied { actor: UserId, owner: UserId },
}

impl TransitionError {
    /// Human-readable reason, as returned alongside `allowed = false`
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

pub struct StatusTransitionValidator;

impl StatusTransitionValidator {
    /// Return the target status if `action` is allowed from `current`.
    pub fn validate(
        current: ApplicationStatus,
        action: ApplicationAction,
        initiator: Initiator,
    ) -> Result<ApplicationStatus, TransitionError> {
        use ApplicationAction as A;
        use ApplicationStatus as S;

        if action.is_system_only() && initiator != Initiator::System {
            return Err(TransitionError::SystemOnly { action });
        }

        let target = match (current, action) {
            (S::Pending, A::Approve) => S::Active,
            (S::Pending, A::Reject) => S::Rejected,
            (S::Pending, A::Cancel) => S::Cancelled,
            (S::Active, A::Revoke) => S::Revoked,
            (S::Pending | S::Active, A::AwaitNotification) => S::AwaitingNotification,
            (S::AwaitingNotification, A::ConfirmNotification) => S::Active,
            (S::AwaitingNotification, A::FailNotification) => S::FailedNotification,
            _ => return Err(TransitionError::InvalidTransition { current, action }),
        };

        Ok(target)
    }

    /// `(allowed, reason)` form of [`Self::validate`]
    pub fn check(
        current: ApplicationStatus,
        action: ApplicationAction,
        initiator: Initiator,
    ) -> (bool, Option<String>) {
        match Self::validate(current, action, initiator) {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.reason())),
        }
    }

    /// Owners may act on their own applications; admins on any.
    pub fn check_ownership(actor: &Actor, owner: &UserId) -> Result<(), TransitionError> {
        if actor.role.is_admin() || &actor.id == owner {
            Ok(())
        } else {
            Err(TransitionError::AccessDenied {
                actor: actor.id.clone(),
                owner: owner.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ApplicationAction as A;
    use ApplicationStatus as S;

    const USER: Initiator = Initiator::User(ActorRole::Owner);
    const ADMIN: Initiator = Initiator::User(ActorRole::Admin);

    #[test]
    fn test_pending_user_transitions() {
        assert_eq!(StatusTransitionValidator::validate(S::Pending, A::Approve, USER), Ok(S::Active));
        assert_eq!(StatusTransitionValidator::validate(S::Pending, A::Reject, ADMIN), Ok(S::Rejected));
        assert_eq!(StatusTransitionValidator::validate(S::Pending, A::Cancel, USER), Ok(S::Cancelled));
    }

    #[test]
    fn test_only_pending_can_be_decided() {
        for status in S::ALL.into_iter().filter(|s| *s != S::Pending) {
            for action in [A::Approve, A::Reject, A::Cancel] {
                let err = StatusTransitionValidator::validate(status, action, ADMIN).unwrap_err();
                assert_eq!(err, TransitionError::InvalidTransition { current: status, action });
                assert!(err.reason().contains(&format!("Application is in {} status", status)));
            }
        }
    }

    #[test]
    fn test_revoke_requires_active() {
        assert_eq!(StatusTransitionValidator::validate(S::Active, A::Revoke, USER), Ok(S::Revoked));
        for status in S::ALL.into_iter().filter(|s| *s != S::Active) {
            assert!(StatusTransitionValidator::validate(status, A::Revoke, ADMIN).is_err());
        }
    }

    #[test]
    fn test_system_only_actions_reject_users() {
        for action in [A::AwaitNotification, A::ConfirmNotification, A::FailNotification] {
            assert_eq!(
                StatusTransitionValidator::validate(S::AwaitingNotification, action, ADMIN),
                Err(TransitionError::SystemOnly { action })
            );
        }
    }

    #[test]
    fn test_notification_edges() {
        let sys = Initiator::System;
        assert_eq!(StatusTransitionValidator::validate(S::Pending, A::AwaitNotification, sys), Ok(S::AwaitingNotification));
        assert_eq!(StatusTransitionValidator::validate(S::Active, A::AwaitNotification, sys), Ok(S::AwaitingNotification));
        assert_eq!(StatusTransitionValidator::validate(S::AwaitingNotification, A::ConfirmNotification, sys), Ok(S::Active));
        assert_eq!(StatusTransitionValidator::validate(S::AwaitingNotification, A::FailNotification, sys), Ok(S::FailedNotification));
        assert!(StatusTransitionValidator::validate(S::FailedNotification, A::FailNotification, sys).is_err());
        assert!(StatusTransitionValidator::validate(S::Active, A::FailNotification, sys).is_err());
    }

    #[test]
    fn test_check_reports_reason() {
        let (allowed, reason) = StatusTransitionValidator::check(S::Active, A::Approve, USER);
        assert!(!allowed);
        assert_eq!(reason.unwrap(), "Cannot approve application: Application is in Active status");

        assert_eq!(StatusTransitionValidator::check(S::Pending, A::Approve, USER), (true, None));
    }

    #[test]
    fn test_ownership_rules() {
        let owner = UserId::from("u1");
        assert!(StatusTransitionValidator::check_ownership(&Actor::owner("u1"), &owner).is_ok());
        assert!(StatusTransitionValidator::check_ownership(&Actor::admin("ops"), &owner).is_ok());
        assert!(matches!(
            StatusTransitionValidator::check_ownership(&Actor::owner("u2"), &owner),
            Err(TransitionError::AccessDenied { .. })
        ));
    }
}
