// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Notification Worker - background consumer of the notification queue
//!
//! Sends the approval email for each job and acknowledges it on success.
//! On failure the job is left unacknowledged so the broker redelivers it
//! after the visibility timeout and eventually dead-letters it. The worker
//! never writes a failure status; that is the dead-letter handler's job.
//!
//! A job can arrive while its application is still `Active` or `Pending`,
//! because Approve publishes before it records the hand-over. Such jobs are
//! left for redelivery. Only settled applications have their jobs dropped.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Drive `AwaitingNotification → Active` after a successful send

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::application::ApplicationStatus;
use crate::domain::clock::Clock;
use crate::domain::history::{HistoryAction, HistoryEntry};
use crate::domain::notification::{EmailSender, NotificationJob};
use crate::domain::queue::{QueueConsumer, QueueError, ReceivedMessage};
use crate::domain::repository::{ApplicationStore, RepositoryError, StatusUpdate};
use crate::domain::transition::{ApplicationAction, Initiator, StatusTransitionValidator};

/// Configuration for the notification worker
#[derive(Debug, Clone)]
pub struct NotificationWorkerConfig {
    /// Messages per receive; kept low so one bad send affects few jobs
    pub batch_size: usize,

    /// Long-poll wait per receive
    pub wait_time: Duration,

    /// Pause after a failed receive
    pub error_backoff: Duration,
}

impl Default for NotificationWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            wait_time: Duration::from_secs(20),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// What happened to one delivered job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Email sent and job acknowledged
    Sent,
    /// Nothing to do; job acknowledged
    Skipped(String),
    /// Left unacknowledged for redelivery
    Failed(String),
}

pub struct NotificationWorker {
    store: Arc<dyn ApplicationStore>,
    consumer: Arc<dyn QueueConsumer>,
    email: Arc<dyn EmailSender>,
    clock: Arc<dyn Clock>,
    config: NotificationWorkerConfig,
    shutdown_token: CancellationToken,
}

impl NotificationWorker {
    pub fn new(
        store: Arc<dyn ApplicationStore>,
        consumer: Arc<dyn QueueConsumer>,
        email: Arc<dyn EmailSender>,
        clock: Arc<dyn Clock>,
        config: NotificationWorkerConfig,
    ) -> Self {
        Self {
            store,
            consumer,
            email,
            clock,
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Get a handle to trigger shutdown
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
            batch_size = self.config.batch_size,
            "Starting notification worker"
        );

        let mut processed = 0u64;
        loop {
            tokio::select! {
                result = self.poll_once() => {
                    match result {
                        Ok(count) => {
                            processed += count as u64;
                            if count > 0 {
                                debug!(count, processed, "Notification worker cycle completed");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Notification queue receive failed");
                            tokio::select! {
                                _ = tokio::time::sleep(self.config.error_backoff) => {}
                                _ = self.shutdown_token.cancelled() => break,
                            }
                        }
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping notification worker");
                    break;
                }
            }
        }

        info!(processed, "Notification worker stopped");
    }

    /// Receive one batch and process it; returns the number of messages handled
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        let messages = self
            .consumer
            .receive(self.config.batch_size, self.config.wait_time)
            .await?;

        for message in &messages {
            self.process(message).await;
        }
        Ok(messages.len())
    }

    pub async fn process(&self, message: &ReceivedMessage) -> JobOutcome {
        let outcome = self.handle(message).await;

        match &outcome {
            JobOutcome::Sent | JobOutcome::Skipped(_) => {
                if let Err(e) = self.consumer.acknowledge(&message.receipt).await {
                    error!(
                        message_id = %message.message_id,
                        error = %e,
                        "Failed to acknowledge notification job"
                    );
                }
            }
            JobOutcome::Failed(reason) => {
                metrics::counter!("licensing_notifications_failed_total").increment(1);
                if let Err(e) = self.consumer.report_failure(&message.receipt, reason).await {
                    debug!(message_id = %message.message_id, error = %e, "Could not annotate failed job");
                }
                warn!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    reason = %reason,
                    "Notification job failed, leaving it for redelivery"
                );
            }
        }

        outcome
    }

    async fn handle(&self, message: &ReceivedMessage) -> JobOutcome {
        let job = match NotificationJob::parse_body(&message.body) {
            Ok(job) => job,
            Err(e) => return JobOutcome::Failed(e.to_string()),
        };
        let key = job.application_key();

        let application = match self.store.get(&key).await {
            Ok(Some(app)) => app,
            Ok(None) => {
                info!(application = %key, "Application no longer exists, dropping notification job");
                return JobOutcome::Skipped("application not found".to_string());
            }
            Err(e) => return JobOutcome::Failed(format!("Failed to load application: {}", e)),
        };

        match application.status {
            ApplicationStatus::AwaitingNotification => {}
            // Approve publishes before it records the hand-over; redeliver until it lands
            ApplicationStatus::Pending | ApplicationStatus::Active => {
                debug!(
                    application = %key,
                    status = %application.status,
                    "Notification hand-over not recorded yet"
                );
                return JobOutcome::Failed(format!(
                    "Application is {}, not yet awaiting notification",
                    application.status
                ));
            }
            settled => {
                info!(
                    application = %key,
                    status = %settled,
                    "Application is not awaiting notification, dropping job"
                );
                return JobOutcome::Skipped(format!("status is {}", settled));
            }
        }

        if let Err(e) = self.email.send_approval(&application).await {
            return JobOutcome::Failed(e.to_string());
        }
        metrics::counter!("licensing_notifications_sent_total").increment(1);

        // The email is out; from here on the job is acknowledged whatever happens
        let current = application.status;
        let target = match StatusTransitionValidator::validate(
            current,
            ApplicationAction::ConfirmNotification,
            Initiator::System,
        ) {
            Ok(target) => target,
            Err(e) => {
                warn!(application = %key, error = %e, "Cannot confirm notification");
                return JobOutcome::Sent;
            }
        };

        let updated_at = application.next_updated_at(self.clock.now());
        match self
            .store
            .update_status(&StatusUpdate::new(key.clone(), current, target, updated_at))
            .await
        {
            Ok(_) => {
                let entry = HistoryEntry::system_transition(
                    key.clone(),
                    HistoryAction::EmailSent,
                    current,
                    target,
                    format!("License email sent to {}", application.contact.email),
                    updated_at,
                )
                .with_retry_count(message.receive_count.saturating_sub(1));

                if let Err(e) = self.store.append_history(&entry).await {
                    error!(application = %key, error = %e, "Failed to append EmailSent history entry");
                }
                info!(application = %key, "Approval email sent");
            }
            Err(RepositoryError::ConditionFailed(_)) => {
                info!(application = %key, "Application changed while sending, status left as is");
            }
            Err(e) => {
                error!(application = %key, error = %e, "Failed to confirm notification");
            }
        }

        JobOutcome::Sent
    }
}
