// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Dead Letter Handler Application Service
//!
//! Consumes notification jobs the broker gave up on and records the failure
//! on the application: `AwaitingNotification → FailedNotification`, with
//! `failureCount` incremented and an `EmailFailed` history entry.
//!
//! Every message is handled independently. Parse failures, missing
//! applications, applications in another status and store failures are
//! logged and the message is skipped; nothing propagates out of a batch.
//! Redelivery of a message that was already handled is a no-op because the
//! application is no longer `AwaitingNotification`.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Single writer of the notification failure status

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::application::{Application, ApplicationStatus};
use crate::domain::clock::Clock;
use crate::domain::history::{HistoryAction, HistoryEntry};
use crate::domain::notification::{JobParseError, NotificationJob};
use crate::domain::queue::{QueueConsumer, QueueError, ReceivedMessage};
use crate::domain::repository::{ApplicationStore, FailureRecord, RepositoryError, StatusUpdate};
use crate::domain::transition::{ApplicationAction, Initiator, StatusTransitionValidator, TransitionError};

#[derive(Debug, Clone)]
pub struct DeadLetterHandlerConfig {
    /// `failureCount` at which an operational alert is raised
    pub max_failure_count: u32,

    /// Attempt count assumed when the broker reports none
    pub max_receive_count: u32,

    pub batch_size: usize,

    pub wait_time: Duration,

    pub error_backoff: Duration,
}

impl Default for DeadLetterHandlerConfig {
    fn default() -> Self {
        Self {
            max_failure_count: 3,
            max_receive_count: 3,
            batch_size: 10,
            wait_time: Duration::from_secs(20),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Why a dead-lettered message did not produce a status change
#[derive(Debug, Clone, Error)]
pub enum DeadLetterError {
    #[error("{0}")]
    Malformed(#[from] JobParseError),

    #[error("Application not found: {0}")]
    NotFound(String),

    #[error("Application is in {0} status, nothing to do")]
    NotAwaiting(ApplicationStatus),

    #[error("Transition rejected: {0}")]
    Transition(#[from] TransitionError),

    #[error("Store error: {0}")]
    Store(#[from] RepositoryError),
}

impl DeadLetterError {
    fn outcome_label(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::NotFound(_) => "not_found",
            Self::NotAwaiting(_) | Self::Transition(_) => "already_handled",
            Self::Store(RepositoryError::ConditionFailed(_)) => "already_handled",
            Self::Store(_) => "store_error",
        }
    }

    /// Store failures other than a lost race
    pub fn is_error(&self) -> bool {
        self.outcome_label() == "store_error"
    }
}

/// Per-batch tally
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub transitioned: usize,
    pub skipped: usize,
    pub errors: usize,
    pub alerts: usize,
}

pub struct DeadLetterHandler {
    store: Arc<dyn ApplicationStore>,
    consumer: Arc<dyn QueueConsumer>,
    clock: Arc<dyn Clock>,
    config: DeadLetterHandlerConfig,
    shutdown_token: CancellationToken,
}

impl DeadLetterHandler {
    pub fn new(
        store: Arc<dyn ApplicationStore>,
        consumer: Arc<dyn QueueConsumer>,
        clock: Arc<dyn Clock>,
        config: DeadLetterHandlerConfig,
    ) -> Self {
        Self {
            store,
            consumer,
            clock,
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            queue = self.consumer.queue_name(),
            max_failure_count = self.config.max_failure_count,
            "Starting dead-letter handler"
        );

        loop {
            tokio::select! {
                result = self.poll_once() => {
                    match result {
                        Ok(report) if report.received > 0 => {
                            info!(
                                received = report.received,
                                transitioned = report.transitioned,
                                skipped = report.skipped,
                                errors = report.errors,
                                "Dead-letter batch processed"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "Dead-letter queue receive failed");
                            tokio::select! {
                                _ = tokio::time::sleep(self.config.error_backoff) => {}
                                _ = self.shutdown_token.cancelled() => break,
                            }
                        }
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping dead-letter handler");
                    break;
                }
            }
        }

        info!("Dead-letter handler stopped");
    }

    pub async fn poll_once(&self) -> Result<BatchReport, QueueError> {
        let messages = self
            .consumer
            .receive(self.config.batch_size, self.config.wait_time)
            .await?;
        Ok(self.handle_batch(&messages).await)
    }

    /// Process a batch; never fails as a whole. Each message is acknowledged
    /// after it has been handled, whatever the outcome.
    pub async fn handle_batch(&self, messages: &[ReceivedMessage]) -> BatchReport {
        let mut report = BatchReport {
            received: messages.len(),
            ..Default::default()
        };

        for message in messages {
            match self.handle_message(message).await {
                Ok(application) => {
                    report.transitioned += 1;
                    metrics::counter!("licensing_dead_letters_total", "outcome" => "transitioned")
                        .increment(1);
                    if self.raise_alert_if_exhausted(&application) {
                        report.alerts += 1;
                    }
                }
                Err(e) => {
                    metrics::counter!("licensing_dead_letters_total", "outcome" => e.outcome_label())
                        .increment(1);
                    if e.is_error() {
                        report.errors += 1;
                        error!(
                            message_id = %message.message_id,
                            error = %e,
                            "Failed to record notification failure, skipping message"
                        );
                    } else {
                        report.skipped += 1;
                        info!(
                            message_id = %message.message_id,
                            reason = %e,
                            "Skipping dead-lettered notification job"
                        );
                    }
                }
            }

            if let Err(e) = self.consumer.acknowledge(&message.receipt).await {
                warn!(
                    message_id = %message.message_id,
                    error = %e,
                    "Failed to acknowledge dead-lettered message"
                );
            }
        }

        report
    }

    /// Record the failure for one message; returns the application as stored afterwards
    pub async fn handle_message(&self, message: &ReceivedMessage) -> Result<Application, DeadLetterError> {
        let job = NotificationJob::parse_body(&message.body)?;
        let key = job.application_key();

        let application = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| DeadLetterError::NotFound(key.to_string()))?;

        let current = application.status;
        if current != ApplicationStatus::AwaitingNotification {
            return Err(DeadLetterError::NotAwaiting(current));
        }
        let target = StatusTransitionValidator::validate(
            current,
            ApplicationAction::FailNotification,
            Initiator::System,
        )?;

        let attempts = message
            .delivery_attempts()
            .unwrap_or(self.config.max_receive_count);
        let reason = format!("Message processing failed after {} attempts", attempts);

        let failed_at = application.next_updated_at(self.clock.now());
        let update = StatusUpdate::new(key.clone(), current, target, failed_at).with_failure(FailureRecord {
            reason: reason.clone(),
            failed_at,
        });
        let updated = self.store.update_status(&update).await?;

        let entry = HistoryEntry::system_transition(
            key.clone(),
            HistoryAction::EmailFailed,
            current,
            target,
            reason,
            failed_at,
        )
        .with_error_details(message.error_message().map(str::to_string))
        .with_retry_count(attempts);

        if let Err(e) = self.store.append_history(&entry).await {
            error!(application = %key, error = %e, "Failed to append EmailFailed history entry");
        }

        debug!(
            application = %key,
            attempts,
            failure_count = updated.failure_count,
            "Application marked as FailedNotification"
        );
        Ok(updated)
    }

    fn raise_alert_if_exhausted(&self, application: &Application) -> bool {
        if application.failure_count < self.config.max_failure_count {
            return false;
        }

        metrics::counter!("licensing_notification_failure_alerts_total").increment(1);
        error!(
            alert = true,
            application = %application.key,
            email = %application.contact.email,
            failure_count = application.failure_count,
            max_failure_count = self.config.max_failure_count,
            "Notification failures reached the configured maximum"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::application::{ContactDetails, UserId};
    use crate::domain::clock::SystemClock;
    use crate::domain::queue::{MessageId, ReceiptHandle, ATTR_ERROR_MESSAGE, ATTR_RECEIVE_COUNT};
    use crate::infrastructure::queue::InMemoryQueue;
    use crate::infrastructure::repositories::InMemoryApplicationStore;
    use chrono::Utc;
    use std::collections::HashMap;

    fn message(body: String, attributes: &[(&str, &str)]) -> ReceivedMessage {
        ReceivedMessage {
            message_id: MessageId("m1".to_string()),
            receipt: ReceiptHandle("r1".to_string()),
            body,
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            receive_count: 1,
        }
    }

    async fn awaiting(store: &InMemoryApplicationStore) -> Application {
        let mut app = Application::submit(
            UserId::from("u1"),
            ContactDetails {
                email: "dev@example.com".to_string(),
                x_account: String::new(),
                broker: "XM".to_string(),
                account_number: "1".to_string(),
                ea_name: "GridPro".to_string(),
            },
            Utc::now(),
        )
        .unwrap();
        app.status = ApplicationStatus::AwaitingNotification;
        store.create(&app).await.unwrap();
        app
    }

    fn handler(store: Arc<InMemoryApplicationStore>) -> DeadLetterHandler {
        DeadLetterHandler::new(
            store,
            Arc::new(InMemoryQueue::new("dlq")),
            Arc::new(SystemClock),
            DeadLetterHandlerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_reason_uses_broker_attempts() {
        let store = Arc::new(InMemoryApplicationStore::new());
        let app = awaiting(&store).await;
        let body = NotificationJob::for_application(&app.key).to_body().unwrap();

        let updated = handler(store.clone())
            .handle_message(&message(body, &[(ATTR_RECEIVE_COUNT, "5"), (ATTR_ERROR_MESSAGE, "550 mailbox full")]))
            .await
            .unwrap();

        assert_eq!(updated.status, ApplicationStatus::FailedNotification);
        assert_eq!(updated.failure_count, 1);
        assert_eq!(
            updated.last_failure_reason.as_deref(),
            Some("Message processing failed after 5 attempts")
        );
        assert!(updated.last_failed_at.is_some());
    }

    #[tokio::test]
    async fn test_reason_falls_back_to_configured_attempts() {
        let store = Arc::new(InMemoryApplicationStore::new());
        let app = awaiting(&store).await;
        let body = NotificationJob::for_application(&app.key).to_body().unwrap();

        let updated = handler(store).handle_message(&message(body, &[])).await.unwrap();
        assert_eq!(
            updated.last_failure_reason.as_deref(),
            Some("Message processing failed after 3 attempts")
        );
    }

    #[tokio::test]
    async fn test_skips_are_reported_not_raised() {
        let store = Arc::new(InMemoryApplicationStore::new());
        let handler = handler(store);

        let report = handler
            .handle_batch(&[
                message("{{{".to_string(), &[]),
                message(r#"{"applicationSK":"APPLICATION#x","userId":"ghost"}"#.to_string(), &[]),
            ])
            .await;

        assert_eq!(
            report,
            BatchReport {
                received: 2,
                skipped: 2,
                ..Default::default()
            }
        );
    }
}
