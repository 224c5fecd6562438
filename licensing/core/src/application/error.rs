// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Caller-facing error taxonomy for synchronous use cases.
//!
//! Validation, NotFound, AccessDenied and InvalidTransition are user-facing
//! outcomes. Conflict means the optimistic write lost a race and the caller
//! may retry. Dependency wraps store, queue and email failures; its detail
//! is for logs only.

use thiserror::Error;

use crate::domain::application::{ApplicationError, ApplicationStatus};
use crate::domain::queue::QueueError;
use crate::domain::repository::RepositoryError;
use crate::domain::transition::TransitionError;

#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Missing actor identity")]
    Unauthenticated,

    #[error("Application not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("{message}")]
    InvalidTransition {
        current: ApplicationStatus,
        message: String,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Dependency failure: {0}")]
    Dependency(String),
}

impl CommandError {
    /// Stable machine-readable code used in API responses and metrics labels
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Unauthenticated => "Unauthenticated",
            Self::NotFound(_) => "NotFoundError",
            Self::AccessDenied(_) => "AccessDeniedError",
            Self::InvalidTransition { .. } => "InvalidTransitionError",
            Self::Conflict(_) => "ConflictError",
            Self::Dependency(_) => "DependencyError",
        }
    }

    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::Dependency(_))
    }
}

impl From<TransitionError> for CommandError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::InvalidTransition { current, .. } => CommandError::InvalidTransition {
                current,
                message: err.reason(),
            },
            TransitionError::SystemOnly { .. } => CommandError::Validation(err.reason()),
            TransitionError::AccessDenied { .. } => CommandError::AccessDenied(err.reason()),
        }
    }
}

impl From<RepositoryError> for CommandError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::ConditionFailed(detail) => CommandError::Conflict(format!(
                "Application was modified concurrently, please retry ({})",
                detail
            )),
            RepositoryError::NotFound(what) => CommandError::NotFound(what),
            RepositoryError::InvalidCursor(cursor) => {
                CommandError::Validation(format!("Invalid pagination cursor: {}", cursor))
            }
            other => CommandError::Dependency(other.to_string()),
        }
    }
}

impl From<QueueError> for CommandError {
    fn from(err: QueueError) -> Self {
        CommandError::Dependency(err.to_string())
    }
}

impl From<ApplicationError> for CommandError {
    fn from(err: ApplicationError) -> Self {
        CommandError::Validation(err.to_string())
    }
}
