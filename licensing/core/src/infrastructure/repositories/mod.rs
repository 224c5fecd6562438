// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of [`ApplicationStore`].
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve applications and their history
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **PostgresApplicationStore** - production store; conditional writes via
//!   `UPDATE ... WHERE status = $expected`
//! - **InMemoryApplicationStore** - `RwLock<HashMap>` store for tests and
//!   single-process development
//! - **ResilientApplicationStore** - decorator adding a per-call timeout and
//!   bounded retries for transient errors

pub mod postgres_application;
pub mod resilient;

pub use postgres_application::PostgresApplicationStore;
pub use resilient::{ResilientApplicationStore, RetryPolicy};

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::application::{Application, ApplicationKey};
use crate::domain::history::{HistoryEntry, HistoryPage, PageRequest};
use crate::domain::repository::{ApplicationFilter, ApplicationStore, RepositoryError, StatusUpdate};

#[derive(Default)]
struct StoreState {
    applications: HashMap<ApplicationKey, Application>,
    histories: HashMap<ApplicationKey, Vec<HistoryEntry>>,
}

#[derive(Clone, Default)]
pub struct InMemoryApplicationStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryApplicationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Mirrors the partial unique index on `(broker, account_number, ea_name)`
fn same_license(a: &Application, b: &Application) -> bool {
    a.contact.broker == b.contact.broker
        && a.contact.account_number == b.contact.account_number
        && a.contact.ea_name == b.contact.ea_name
}

/// Decode an offset cursor
pub(crate) fn parse_offset_cursor(cursor: Option<&str>) -> Result<usize, RepositoryError> {
    match cursor {
        None => Ok(0),
        Some(c) => c
            .parse::<usize>()
            .map_err(|_| RepositoryError::InvalidCursor(c.to_string())),
    }
}

#[async_trait]
impl ApplicationStore for InMemoryApplicationStore {
    async fn get(&self, key: &ApplicationKey) -> Result<Option<Application>, RepositoryError> {
        Ok(self.state.read().applications.get(key).cloned())
    }

    async fn create(&self, application: &Application) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        if state.applications.contains_key(&application.key) {
            return Err(RepositoryError::ConditionFailed(format!(
                "application {} already exists",
                application.key
            )));
        }
        if application.status.is_open()
            && state
                .applications
                .values()
                .any(|existing| existing.status.is_open() && same_license(existing, application))
        {
            return Err(RepositoryError::ConditionFailed(format!(
                "an open application for {} on {}/{} already exists",
                application.contact.ea_name, application.contact.broker, application.contact.account_number
            )));
        }
        state
            .applications
            .insert(application.key.clone(), application.clone());
        Ok(())
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<Application, RepositoryError> {
        let mut state = self.state.write();
        let application = state
            .applications
            .get_mut(&update.key)
            .ok_or_else(|| RepositoryError::NotFound(update.key.to_string()))?;

        if application.status != update.expected {
            return Err(RepositoryError::ConditionFailed(format!(
                "expected status {} but found {}",
                update.expected, application.status
            )));
        }

        application.status = update.new_status;
        application.updated_at = update.updated_at;
        if let Some(failure) = &update.failure {
            application.failure_count += 1;
            application.last_failure_reason = Some(failure.reason.clone());
            application.last_failed_at = Some(failure.failed_at);
        }
        Ok(application.clone())
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        let entries = state.histories.entry(entry.key.clone()).or_default();
        if !entries.iter().any(|e| e.entry_id == entry.entry_id) {
            entries.push(entry.clone());
        }
        Ok(())
    }

    async fn list_history(
        &self,
        key: &ApplicationKey,
        page: &PageRequest,
    ) -> Result<HistoryPage, RepositoryError> {
        let offset = parse_offset_cursor(page.cursor.as_deref())?;
        let state = self.state.read();
        let all = state.histories.get(key).map(Vec::as_slice).unwrap_or_default();

        let entries: Vec<HistoryEntry> = all.iter().skip(offset).take(page.limit).cloned().collect();
        let next = offset + entries.len();
        let next_cursor = (next < all.len()).then(|| next.to_string());

        Ok(HistoryPage { entries, next_cursor })
    }

    async fn list_applications(
        &self,
        filter: &ApplicationFilter,
    ) -> Result<Vec<Application>, RepositoryError> {
        let mut applications: Vec<Application> = self
            .state
            .read()
            .applications
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        applications.sort_by(|a, b| {
            b.applied_at
                .cmp(&a.applied_at)
                .then_with(|| b.key.sort_key.cmp(&a.key.sort_key))
        });
        Ok(applications)
    }

    async fn find_by_broker_account(
        &self,
        broker: &str,
        account_number: &str,
    ) -> Result<Vec<Application>, RepositoryError> {
        Ok(self
            .state
            .read()
            .applications
            .values()
            .filter(|a| a.contact.broker == broker && a.contact.account_number == account_number)
            .cloned()
            .collect())
    }
}
