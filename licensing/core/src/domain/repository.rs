// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contract for the `Application` aggregate and its history,
//! following the DDD Repository pattern: the interface lives in the domain
//! layer, implementations live in `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `ApplicationStore` | `Application` + `HistoryEntry` | `InMemoryApplicationStore`, `PostgresApplicationStore` |
//!
//! ## Concurrency
//!
//! The store is the only point of mutual exclusion in the system. Every
//! status write is a conditional update: it succeeds only if the stored
//! status still equals the status the caller read. A failed precondition
//! is reported as [`RepositoryError::ConditionFailed`] and must never be
//! retried by the store itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::application::{Application, ApplicationKey, ApplicationStatus, UserId};
use crate::domain::history::{HistoryEntry, HistoryPage, PageRequest};

/// Failure bookkeeping applied together with a status write
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// A conditional status write
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub key: ApplicationKey,
    /// Precondition: the stored status must still be this value
    pub expected: ApplicationStatus,
    pub new_status: ApplicationStatus,
    pub updated_at: DateTime<Utc>,
    /// When set, `failure_count` is incremented atomically with the write
    pub failure: Option<FailureRecord>,
}

impl StatusUpdate {
    pub fn new(
        key: ApplicationKey,
        expected: ApplicationStatus,
        new_status: ApplicationStatus,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            expected,
            new_status,
            updated_at,
            failure: None,
        }
    }

    pub fn with_failure(mut self, failure: FailureRecord) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Listing filter; maps onto the partition scan or the user+status lookup path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationFilter {
    pub user_id: Option<UserId>,
    pub status: Option<ApplicationStatus>,
}

impl ApplicationFilter {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            status: None,
        }
    }

    pub fn with_status(mut self, status: Option<ApplicationStatus>) -> Self {
        self.status = status;
        self
    }

    pub fn matches(&self, application: &Application) -> bool {
        self.user_id.as_ref().map_or(true, |u| application.owner() == u)
            && self.status.map_or(true, |s| application.status == s)
    }
}

/// Repository interface for Application aggregates and their history
#[async_trait]
pub trait ApplicationStore: Send + Sync {
    /// Find an application by its composite key
    async fn get(&self, key: &ApplicationKey) -> Result<Option<Application>, RepositoryError>;

    /// Insert a new application; fails with `ConditionFailed` if the key exists
    async fn create(&self, application: &Application) -> Result<(), RepositoryError>;

    /// Conditionally write a new status; returns the application as stored after the write
    async fn update_status(&self, update: &StatusUpdate) -> Result<Application, RepositoryError>;

    /// Append an immutable history entry
    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), RepositoryError>;

    /// History of one application, oldest first
    async fn list_history(
        &self,
        key: &ApplicationKey,
        page: &PageRequest,
    ) -> Result<HistoryPage, RepositoryError>;

    /// Applications matching a filter, newest submission first
    async fn list_applications(
        &self,
        filter: &ApplicationFilter,
    ) -> Result<Vec<Application>, RepositoryError>;

    /// Secondary lookup path by broker + account number
    async fn find_by_broker_account(
        &self,
        broker: &str,
        account_number: &str,
    ) -> Result<Vec<Application>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Conditional check failed: {0}")]
    ConditionFailed(String),

    #[error("Invalid pagination cursor: {0}")]
    InvalidCursor(String),

    #[error("Store operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RepositoryError {
    /// Network-level failures that may succeed on a retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                RepositoryError::Unavailable(err.to_string())
            }
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RepositoryError::ConditionFailed(db.message().to_string())
            }
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::application::ContactDetails;

    #[test]
    fn test_filter_matching() {
        let app = Application::submit(
            UserId::from("u1"),
            ContactDetails {
                email: "a@b.c".to_string(),
                x_account: String::new(),
                broker: "b".to_string(),
                account_number: "1".to_string(),
                ea_name: "ea".to_string(),
            },
            Utc::now(),
        )
        .unwrap();

        assert!(ApplicationFilter::default().matches(&app));
        assert!(ApplicationFilter::for_user(UserId::from("u1")).matches(&app));
        assert!(!ApplicationFilter::for_user(UserId::from("u2")).matches(&app));
        assert!(!ApplicationFilter::default()
            .with_status(Some(ApplicationStatus::Active))
            .matches(&app));
    }

    #[test]
    fn test_transient_classification() {
        assert!(RepositoryError::Timeout(500).is_transient());
        assert!(RepositoryError::Unavailable("reset".into()).is_transient());
        assert!(!RepositoryError::ConditionFailed("status".into()).is_transient());
        assert!(!RepositoryError::Database("syntax".into()).is_transient());
    }
}
