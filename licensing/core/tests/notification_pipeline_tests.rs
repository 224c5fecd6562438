// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use chrono::Utc;
use ea_licensing_core::application::commands::{
    ApplicationCommandUseCase, CommandRequest, StandardApplicationCommandUseCase,
};
use ea_licensing_core::application::dead_letter_handler::{
    DeadLetterError, DeadLetterHandler, DeadLetterHandlerConfig,
};
use ea_licensing_core::application::notification_worker::{
    JobOutcome, NotificationWorker, NotificationWorkerConfig,
};
use ea_licensing_core::domain::actor::Actor;
use ea_licensing_core::domain::application::{
    Application, ApplicationKey, ApplicationStatus, ContactDetails, UserId,
};
use ea_licensing_core::domain::clock::SystemClock;
use ea_licensing_core::domain::history::{HistoryAction, HistoryEntry, HistoryPage, PageRequest};
use ea_licensing_core::domain::notification::{EmailSender, NotificationError, NotificationJob};
use ea_licensing_core::domain::queue::QueueConsumer;
use ea_licensing_core::domain::repository::{
    ApplicationFilter, ApplicationStore, RepositoryError, StatusUpdate,
};
use ea_licensing_core::infrastructure::queue::InMemoryQueue;
use ea_licensing_core::infrastructure::repositories::InMemoryApplicationStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Fails `update_status` for one poisoned key
struct PoisonedStore {
    inner: InMemoryApplicationStore,
    poisoned: ApplicationKey,
}

#[async_trait]
impl ApplicationStore for PoisonedStore {
    async fn get(&self, key: &ApplicationKey) -> Result<Option<Application>, RepositoryError> {
        self.inner.get(key).await
    }
    async fn create(&self, application: &Application) -> Result<(), RepositoryError> {
        self.inner.create(application).await
    }
    async fn update_status(&self, update: &StatusUpdate) -> Result<Application, RepositoryError> {
        if update.key == self.poisoned {
            return Err(RepositoryError::Unavailable("connection reset".to_string()));
        }
        self.inner.update_status(update).await
    }
    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), RepositoryError> {
        self.inner.append_history(entry).await
    }
    async fn list_history(&self, key: &ApplicationKey, page: &PageRequest) -> Result<HistoryPage, RepositoryError> {
        self.inner.list_history(key, page).await
    }
    async fn list_applications(&self, filter: &ApplicationFilter) -> Result<Vec<Application>, RepositoryError> {
        self.inner.list_applications(filter).await
    }
    async fn find_by_broker_account(&self, broker: &str, account: &str) -> Result<Vec<Application>, RepositoryError> {
        self.inner.find_by_broker_account(broker, account).await
    }
}

/// Records sends; optionally fails every one of them
struct ScriptedSender {
    fail: bool,
    sent: Mutex<Vec<String>>,
}

impl ScriptedSender {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fail,
            sent: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl EmailSender for ScriptedSender {
    async fn send_approval(&self, application: &Application) -> Result<(), NotificationError> {
        if self.fail {
            return Err(NotificationError::Rejected {
                status: 503,
                body: "service unavailable".to_string(),
            });
        }
        self.sent.lock().push(application.contact.email.clone());
        Ok(())
    }
}

fn contact(ea_name: &str) -> ContactDetails {
    ContactDetails {
        email: "trader@example.com".to_string(),
        x_account: "@trader".to_string(),
        broker: "OANDA".to_string(),
        account_number: "9001".to_string(),
        ea_name: ea_name.to_string(),
    }
}

async fn seed(store: &dyn ApplicationStore, ea_name: &str, status: ApplicationStatus, failures: u32) -> Application {
    let mut application = Application::submit(UserId::from("u1"), contact(ea_name), Utc::now()).unwrap();
    application.status = status;
    application.failure_count = failures;
    store.create(&application).await.unwrap();
    application
}

fn dlq_config() -> DeadLetterHandlerConfig {
    DeadLetterHandlerConfig {
        wait_time: Duration::ZERO,
        ..DeadLetterHandlerConfig::default()
    }
}

fn job_body(application: &Application) -> String {
    NotificationJob::for_application(&application.key).to_body().unwrap()
}

async fn email_failed_entries(store: &dyn ApplicationStore, key: &ApplicationKey) -> Vec<HistoryEntry> {
    store
        .list_history(key, &PageRequest::new(Some(100), None))
        .await
        .unwrap()
        .entries
        .into_iter()
        .filter(|e| e.action == HistoryAction::EmailFailed)
        .collect()
}

#[tokio::test]
async fn test_exhausted_job_marks_failed_notification() {
    let store = Arc::new(InMemoryApplicationStore::new());
    let dlq = Arc::new(InMemoryQueue::new("dlq"));
    let b = seed(store.as_ref(), "B", ApplicationStatus::AwaitingNotification, 2).await;
    dlq.send_raw(job_body(&b));

    let handler = DeadLetterHandler::new(store.clone(), dlq.clone(), Arc::new(SystemClock), dlq_config());
    let report = handler.poll_once().await.unwrap();

    assert_eq!(report.transitioned, 1);
    assert_eq!(report.alerts, 1);
    assert_eq!(dlq.depth(), 0);

    let stored = store.get(&b.key).await.unwrap().unwrap();
    assert_eq!(stored.status, ApplicationStatus::FailedNotification);
    assert_eq!(stored.failure_count, 3);
    assert!(stored.last_failed_at.is_some());

    let entries = email_failed_entries(store.as_ref(), &b.key).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].previous_status, Some(ApplicationStatus::AwaitingNotification));
    assert_eq!(entries[0].new_status, ApplicationStatus::FailedNotification);
    assert_eq!(entries[0].changed_by, "system");
}

#[tokio::test]
async fn test_redelivered_dead_letter_is_handled_once() {
    let store = Arc::new(InMemoryApplicationStore::new());
    let dlq = Arc::new(InMemoryQueue::new("dlq").with_visibility_timeout(Duration::ZERO));
    let app = seed(store.as_ref(), "Redelivered", ApplicationStatus::AwaitingNotification, 0).await;
    dlq.send_raw(job_body(&app));

    let handler = DeadLetterHandler::new(store.clone(), dlq.clone(), Arc::new(SystemClock), dlq_config());
    let delivery = dlq.receive(1, Duration::ZERO).await.unwrap();

    assert!(handler.handle_message(&delivery[0]).await.is_ok());
    let second = handler.handle_message(&delivery[0]).await;
    assert!(matches!(
        second,
        Err(DeadLetterError::NotAwaiting(ApplicationStatus::FailedNotification))
    ));

    let stored = store.get(&app.key).await.unwrap().unwrap();
    assert_eq!(stored.failure_count, 1);
    assert_eq!(email_failed_entries(store.as_ref(), &app.key).await.len(), 1);
}

#[tokio::test]
async fn test_store_failure_does_not_abort_batch() {
    let inner = InMemoryApplicationStore::new();
    let first = seed(&inner, "First", ApplicationStatus::AwaitingNotification, 0).await;
    let second = seed(&inner, "Second", ApplicationStatus::AwaitingNotification, 0).await;
    let store = Arc::new(PoisonedStore {
        inner,
        poisoned: first.key.clone(),
    });

    let dlq = Arc::new(InMemoryQueue::new("dlq"));
    dlq.send_raw(job_body(&first));
    dlq.send_raw(job_body(&second));

    let handler = DeadLetterHandler::new(store.clone(), dlq.clone(), Arc::new(SystemClock), dlq_config());
    let report = handler.poll_once().await.unwrap();

    assert_eq!(report.received, 2);
    assert_eq!(report.errors, 1);
    assert_eq!(report.transitioned, 1);
    assert_eq!(dlq.depth(), 0);

    assert_eq!(
        store.get(&first.key).await.unwrap().unwrap().status,
        ApplicationStatus::AwaitingNotification
    );
    assert_eq!(
        store.get(&second.key).await.unwrap().unwrap().status,
        ApplicationStatus::FailedNotification
    );
    assert_eq!(email_failed_entries(store.as_ref(), &second.key).await.len(), 1);
}

#[tokio::test]
async fn test_envelope_wrapped_job_is_equivalent() {
    let store = Arc::new(InMemoryApplicationStore::new());
    let dlq = Arc::new(InMemoryQueue::new("dlq"));
    let plain = seed(store.as_ref(), "Plain", ApplicationStatus::AwaitingNotification, 0).await;
    let wrapped = seed(store.as_ref(), "Wrapped", ApplicationStatus::AwaitingNotification, 0).await;

    dlq.send_raw(job_body(&plain));
    dlq.send_raw(serde_json::json!({ "Message": job_body(&wrapped) }).to_string());

    let handler = DeadLetterHandler::new(store.clone(), dlq.clone(), Arc::new(SystemClock), dlq_config());
    let report = handler.poll_once().await.unwrap();
    assert_eq!(report.transitioned, 2);

    let plain_entry = &email_failed_entries(store.as_ref(), &plain.key).await[0];
    let wrapped_entry = &email_failed_entries(store.as_ref(), &wrapped.key).await[0];
    assert_eq!(plain_entry.reason, wrapped_entry.reason);
    assert_eq!(plain_entry.retry_count, wrapped_entry.retry_count);
}

#[tokio::test]
async fn test_approval_email_activates_license() {
    let store = Arc::new(InMemoryApplicationStore::new());
    let queue = Arc::new(InMemoryQueue::new("notifications"));
    let app = seed(store.as_ref(), "Happy", ApplicationStatus::Pending, 0).await;

    let commands = StandardApplicationCommandUseCase::new(store.clone(), queue.clone(), Arc::new(SystemClock));
    commands
        .approve(CommandRequest::new(&app.key.sort_key, &Actor::owner("u1")))
        .await
        .unwrap();

    let sender = ScriptedSender::new(false);
    let worker = NotificationWorker::new(
        store.clone(),
        queue.clone(),
        sender.clone(),
        Arc::new(SystemClock),
        NotificationWorkerConfig {
            wait_time: Duration::ZERO,
            ..NotificationWorkerConfig::default()
        },
    );
    assert_eq!(worker.poll_once().await.unwrap(), 1);

    assert_eq!(sender.sent.lock().as_slice(), ["trader@example.com".to_string()]);
    assert_eq!(queue.depth(), 0);
    assert_eq!(store.get(&app.key).await.unwrap().unwrap().status, ApplicationStatus::Active);

    let history = store.list_history(&app.key, &PageRequest::new(None, None)).await.unwrap().entries;
    let actions: Vec<_> = history.iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![HistoryAction::Approved, HistoryAction::EmailSent]);
    assert_eq!(history[1].retry_count, Some(0));
}

#[tokio::test]
async fn test_failing_email_ends_in_dead_letter_path() {
    let store = Arc::new(InMemoryApplicationStore::new());
    let dlq = Arc::new(InMemoryQueue::new("dlq"));
    let queue = Arc::new(
        InMemoryQueue::new("notifications")
            .with_visibility_timeout(Duration::ZERO)
            .with_dead_letter_queue(dlq.clone(), 3),
    );
    let app = seed(store.as_ref(), "Unlucky", ApplicationStatus::Pending, 0).await;

    let commands = StandardApplicationCommandUseCase::new(store.clone(), queue.clone(), Arc::new(SystemClock));
    commands
        .approve(CommandRequest::new(&app.key.sort_key, &Actor::admin("ops")).for_owner(&app.key.user_id))
        .await
        .unwrap();

    let worker = NotificationWorker::new(
        store.clone(),
        queue.clone(),
        ScriptedSender::new(true),
        Arc::new(SystemClock),
        NotificationWorkerConfig {
            wait_time: Duration::ZERO,
            ..NotificationWorkerConfig::default()
        },
    );

    for _ in 0..3 {
        let delivered = queue.receive(1, Duration::ZERO).await.unwrap();
        assert!(matches!(worker.process(&delivered[0]).await, JobOutcome::Failed(_)));
    }
    // The next receive redrives the exhausted job
    assert_eq!(worker.poll_once().await.unwrap(), 0);
    assert_eq!(queue.depth(), 0);
    assert_eq!(dlq.depth(), 1);

    let handler = DeadLetterHandler::new(store.clone(), dlq.clone(), Arc::new(SystemClock), dlq_config());
    let report = handler.poll_once().await.unwrap();
    assert_eq!(report.transitioned, 1);
    assert_eq!(report.alerts, 0);

    let stored = store.get(&app.key).await.unwrap().unwrap();
    assert_eq!(stored.status, ApplicationStatus::FailedNotification);
    assert_eq!(stored.failure_count, 1);
    assert_eq!(
        stored.last_failure_reason.as_deref(),
        Some("Message processing failed after 3 attempts")
    );

    let entry = &email_failed_entries(store.as_ref(), &app.key).await[0];
    assert_eq!(entry.retry_count, Some(3));
    assert!(entry
        .error_details
        .as_deref()
        .is_some_and(|details| details.contains("service unavailable")));
}
