// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Service composition
//!
//! Builds every port implementation from the configuration manifest once at
//! start-up and hands them to the use cases by constructor injection.
//!
//! | Port | `in-memory` | `postgres` |
//! |------|-------------|------------|
//! | `ApplicationStore` | `InMemoryApplicationStore` | `PostgresApplicationStore` |
//! | `NotificationQueue` / `QueueConsumer` | `InMemoryQueue` | `PostgresQueue` |
//!
//! The store is always wrapped in `ResilientApplicationStore`.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use ea_licensing_core::application::commands::StandardApplicationCommandUseCase;
use ea_licensing_core::application::dead_letter_handler::{DeadLetterHandler, DeadLetterHandlerConfig};
use ea_licensing_core::application::intake::{StandardSubmitApplicationUseCase, WebhookVerifier};
use ea_licensing_core::application::notification_worker::{NotificationWorker, NotificationWorkerConfig};
use ea_licensing_core::application::queries::StandardApplicationQueryService;
use ea_licensing_core::domain::clock::{Clock, SystemClock};
use ea_licensing_core::domain::config::{BackendKind, LicensingConfigManifest};
use ea_licensing_core::domain::notification::EmailSender;
use ea_licensing_core::domain::queue::{NotificationQueue, QueueConsumer};
use ea_licensing_core::domain::repository::ApplicationStore;
use ea_licensing_core::infrastructure::db::Database;
use ea_licensing_core::infrastructure::email::{EmailTemplates, HttpEmailSender, LoggingEmailSender};
use ea_licensing_core::infrastructure::queue::{InMemoryQueue, PostgresQueue};
use ea_licensing_core::infrastructure::repositories::{
    InMemoryApplicationStore, PostgresApplicationStore, ResilientApplicationStore, RetryPolicy,
};
use ea_licensing_core::presentation::api::AppState;

pub struct Services {
    pub config: LicensingConfigManifest,
    pub store: Arc<dyn ApplicationStore>,
    pub publisher: Arc<dyn NotificationQueue>,
    pub notifications: Arc<dyn QueueConsumer>,
    pub dead_letters: Arc<dyn QueueConsumer>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    pub async fn build(config: LicensingConfigManifest) -> Result<Self> {
        let spec = &config.spec;

        let needs_database =
            spec.store.backend == BackendKind::Postgres || spec.queue.backend == BackendKind::Postgres;
        let database = if needs_database {
            let url = spec
                .store
                .database_url
                .as_deref()
                .context("spec.store.database_url is required for the postgres backend")?;
            info!("Connecting to PostgreSQL");
            Some(Database::new(url, spec.store.max_connections).await?)
        } else {
            None
        };

        let raw_store: Arc<dyn ApplicationStore> = match (&spec.store.backend, &database) {
            (BackendKind::Postgres, Some(db)) => Arc::new(PostgresApplicationStore::new(
                db.get_pool().clone(),
                spec.store.table_name.clone(),
            )),
            _ => Arc::new(InMemoryApplicationStore::new()),
        };
        let store: Arc<dyn ApplicationStore> = Arc::new(ResilientApplicationStore::new(
            raw_store,
            RetryPolicy::from(&spec.store),
        ));

        let queue = &spec.queue;
        let (publisher, notifications, dead_letters): (
            Arc<dyn NotificationQueue>,
            Arc<dyn QueueConsumer>,
            Arc<dyn QueueConsumer>,
        ) = match (&queue.backend, &database) {
            (BackendKind::Postgres, Some(db)) => {
                let pool = db.get_pool().clone();
                let main = Arc::new(
                    PostgresQueue::new(pool.clone(), queue.notification_queue.clone(), queue.visibility_timeout())
                        .with_dead_letter_queue(queue.dead_letter_queue.clone(), queue.max_receive_count),
                );
                let dlq: Arc<dyn QueueConsumer> = Arc::new(PostgresQueue::new(
                    pool,
                    queue.dead_letter_queue.clone(),
                    queue.visibility_timeout(),
                ));
                let publisher: Arc<dyn NotificationQueue> = main.clone();
                let consumer: Arc<dyn QueueConsumer> = main;
                (publisher, consumer, dlq)
            }
            _ => {
                let dlq = Arc::new(
                    InMemoryQueue::new(queue.dead_letter_queue.clone())
                        .with_visibility_timeout(queue.visibility_timeout()),
                );
                let main = Arc::new(
                    InMemoryQueue::new(queue.notification_queue.clone())
                        .with_visibility_timeout(queue.visibility_timeout())
                        .with_dead_letter_queue(dlq.clone(), queue.max_receive_count),
                );
                let publisher: Arc<dyn NotificationQueue> = main.clone();
                let consumer: Arc<dyn QueueConsumer> = main;
                let dead_letters: Arc<dyn QueueConsumer> = dlq;
                (publisher, consumer, dead_letters)
            }
        };

        info!(
            store = ?spec.store.backend,
            queue = ?queue.backend,
            notification_queue = %queue.notification_queue,
            dead_letter_queue = %queue.dead_letter_queue,
            "Services composed"
        );

        Ok(Self {
            config,
            store,
            publisher,
            notifications,
            dead_letters,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            Arc::new(StandardSubmitApplicationUseCase::new(
                self.store.clone(),
                self.clock.clone(),
                WebhookVerifier::new(self.config.spec.api.webhook_secret.clone()),
            )),
            Arc::new(StandardApplicationCommandUseCase::new(
                self.store.clone(),
                self.publisher.clone(),
                self.clock.clone(),
            )),
            Arc::new(StandardApplicationQueryService::new(self.store.clone())),
        )
    }

    pub fn email_sender(&self) -> Result<Arc<dyn EmailSender>> {
        let notification = &self.config.spec.notification;
        match notification.email_endpoint.as_deref() {
            Some(endpoint) => Ok(Arc::new(
                HttpEmailSender::from_config(notification, endpoint)
                    .context("Failed to build HTTP email sender")?,
            )),
            None => {
                warn!("spec.notification.email_endpoint not set, approval emails will only be logged");
                let templates = EmailTemplates::new(notification.from_address.clone())
                    .context("Failed to compile email templates")?;
                Ok(Arc::new(LoggingEmailSender::new(templates)))
            }
        }
    }

    pub fn notification_worker(&self) -> Result<NotificationWorker> {
        let queue = &self.config.spec.queue;
        Ok(NotificationWorker::new(
            self.store.clone(),
            self.notifications.clone(),
            self.email_sender()?,
            self.clock.clone(),
            NotificationWorkerConfig {
                batch_size: queue.batch_size,
                wait_time: queue.wait_time(),
                ..NotificationWorkerConfig::default()
            },
        ))
    }

    pub fn dead_letter_handler(&self) -> DeadLetterHandler {
        let spec = &self.config.spec;
        DeadLetterHandler::new(
            self.store.clone(),
            self.dead_letters.clone(),
            self.clock.clone(),
            DeadLetterHandlerConfig {
                max_failure_count: spec.notification.max_failure_count,
                max_receive_count: spec.queue.max_receive_count,
                batch_size: spec.queue.dead_letter_batch_size,
                wait_time: spec.queue.wait_time(),
                ..DeadLetterHandlerConfig::default()
            },
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.spec.api.request_timeout_secs)
    }
}
