// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Timeout + bounded retry decorator for any [`ApplicationStore`].
//!
//! Every call is bounded by `timeout`. Transient failures (timeouts, lost
//! connections) are retried up to `max_retries` times with exponential
//! backoff. Everything else, conditional-check failures in particular, is
//! returned on the first attempt.
//!
//! A transient failure does not tell whether the write landed. A retried
//! `update_status` that then fails its own precondition re-reads the row and
//! reports success if the stored status and `updated_at` are the ones it
//! wrote. History appends are idempotent on `entry_id`, so retrying them
//! never duplicates an entry.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::domain::application::{Application, ApplicationKey};
use crate::domain::config::StoreConfig;
use crate::domain::history::{HistoryEntry, HistoryPage, PageRequest};
use crate::domain::repository::{ApplicationFilter, ApplicationStore, RepositoryError, StatusUpdate};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            max_retries: 2,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl From<&StoreConfig> for RetryPolicy {
    fn from(config: &StoreConfig) -> Self {
        Self {
            timeout: config.operation_timeout(),
            max_retries: config.max_transient_retries,
            ..Self::default()
        }
    }
}

pub struct ResilientApplicationStore {
    inner: Arc<dyn ApplicationStore>,
    policy: RetryPolicy,
}

impl ResilientApplicationStore {
    pub fn new(inner: Arc<dyn ApplicationStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<T, RepositoryError>> + Send,
        T: Send,
    {
        self.call_counted(operation, f).await.0
    }

    /// Like `call`, also returning how many attempts ended in a transient failure
    async fn call_counted<T, F, Fut>(&self, operation: &'static str, f: F) -> (Result<T, RepositoryError>, u32)
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<T, RepositoryError>> + Send,
        T: Send,
    {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(self.policy.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(RepositoryError::Timeout(self.policy.timeout.as_millis() as u64)),
            };

            match result {
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_retries = self.policy.max_retries,
                        error = %e,
                        "Transient store failure, retrying"
                    );
                    tokio::time::sleep(self.policy.base_delay * 2_u32.pow(attempt)).await;
                    attempt += 1;
                }
                other => return (other, attempt),
            }
        }
    }

    /// Decide whether a precondition failure after an ambiguous attempt is our own write
    async fn reconcile_update(
        &self,
        update: &StatusUpdate,
        detail: String,
    ) -> Result<Application, RepositoryError> {
        let inner = &self.inner;
        let key = &update.key;
        match self.call("get", move || inner.get(key)).await? {
            Some(current)
                if current.status == update.new_status
                    && current.updated_at.timestamp_micros() == update.updated_at.timestamp_micros() =>
            {
                info!(
                    application = %update.key,
                    status = %current.status,
                    "Status write landed before its timeout, treating retry as success"
                );
                Ok(current)
            }
            _ => Err(RepositoryError::ConditionFailed(detail)),
        }
    }
}

#[async_trait]
impl ApplicationStore for ResilientApplicationStore {
    async fn get(&self, key: &ApplicationKey) -> Result<Option<Application>, RepositoryError> {
        let inner = &self.inner;
        self.call("get", move || inner.get(key)).await
    }

    async fn create(&self, application: &Application) -> Result<(), RepositoryError> {
        let inner = &self.inner;
        self.call("create", move || inner.create(application)).await
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<Application, RepositoryError> {
        let inner = &self.inner;
        match self
            .call_counted("update_status", move || inner.update_status(update))
            .await
        {
            (Err(RepositoryError::ConditionFailed(detail)), ambiguous) if ambiguous > 0 => {
                self.reconcile_update(update, detail).await
            }
            (result, _) => result,
        }
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), RepositoryError> {
        let inner = &self.inner;
        self.call("append_history", move || inner.append_history(entry)).await
    }

    async fn list_history(
        &self,
        key: &ApplicationKey,
        page: &PageRequest,
    ) -> Result<HistoryPage, RepositoryError> {
        let inner = &self.inner;
        self.call("list_history", move || inner.list_history(key, page)).await
    }

    async fn list_applications(
        &self,
        filter: &ApplicationFilter,
    ) -> Result<Vec<Application>, RepositoryError> {
        let inner = &self.inner;
        self.call("list_applications", move || inner.list_applications(filter)).await
    }

    async fn find_by_broker_account(
        &self,
        broker: &str,
        account_number: &str,
    ) -> Result<Vec<Application>, RepositoryError> {
        let inner = &self.inner;
        self.call("find_by_broker_account", move || {
            inner.find_by_broker_account(broker, account_number)
        })
        .await
    }
}
