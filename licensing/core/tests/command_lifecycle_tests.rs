// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use ea_licensing_core::application::commands::{
    ApplicationCommandUseCase, CommandRequest, StandardApplicationCommandUseCase,
};
use ea_licensing_core::application::error::CommandError;
use ea_licensing_core::application::notification_worker::{NotificationWorker, NotificationWorkerConfig};
use ea_licensing_core::domain::actor::Actor;
use ea_licensing_core::domain::application::{
    Application, ApplicationKey, ApplicationStatus, ContactDetails, UserId,
};
use ea_licensing_core::domain::clock::{ManualClock, SystemClock};
use ea_licensing_core::domain::history::{HistoryAction, HistoryEntry, HistoryPage, PageRequest};
use ea_licensing_core::domain::notification::{EmailSender, NotificationError, NotificationJob};
use ea_licensing_core::domain::queue::{MessageId, NotificationQueue, QueueError};
use ea_licensing_core::domain::repository::{
    ApplicationFilter, ApplicationStore, RepositoryError, StatusUpdate,
};
use ea_licensing_core::infrastructure::queue::InMemoryQueue;
use ea_licensing_core::infrastructure::repositories::{
    InMemoryApplicationStore, ResilientApplicationStore, RetryPolicy,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    store: Arc<InMemoryApplicationStore>,
    queue: Arc<InMemoryQueue>,
    commands: StandardApplicationCommandUseCase,
}

fn fixture() -> Fixture {
    let store = Arc::new(InMemoryApplicationStore::new());
    let queue = Arc::new(InMemoryQueue::new("notifications"));
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()));
    let commands = StandardApplicationCommandUseCase::new(store.clone(), queue.clone(), clock);
    Fixture { store, queue, commands }
}

async fn seed(store: &InMemoryApplicationStore, owner: &str, ea_name: &str, status: ApplicationStatus) -> Application {
    let mut application = Application::submit(
        UserId::from(owner),
        ContactDetails {
            email: format!("{}@example.com", owner),
            x_account: String::new(),
            broker: "XMTrading".to_string(),
            account_number: "5005".to_string(),
            ea_name: ea_name.to_string(),
        },
        Utc.with_ymd_and_hms(2026, 2, 1, 8, 30, 0).unwrap(),
    )
    .unwrap();
    application.status = status;
    store.create(&application).await.unwrap();
    application
}

async fn history_len(store: &InMemoryApplicationStore, application: &Application) -> usize {
    store
        .list_history(&application.key, &PageRequest::new(Some(100), None))
        .await
        .unwrap()
        .entries
        .len()
}

#[tokio::test]
async fn test_owner_approval_awaits_notification() {
    let f = fixture();
    let app = seed(&f.store, "u1", "Scalper", ApplicationStatus::Pending).await;

    let outcome = f
        .commands
        .approve(CommandRequest::new(&app.key.sort_key, &Actor::owner("u1")))
        .await
        .unwrap();

    assert_eq!(outcome.application.status, ApplicationStatus::AwaitingNotification);
    assert!(outcome.message_id.is_some());
    assert_eq!(f.queue.depth(), 1);

    let history = f
        .store
        .list_history(&app.key, &PageRequest::new(None, None))
        .await
        .unwrap()
        .entries;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, HistoryAction::Approved);
    assert_eq!(history[0].previous_status, Some(ApplicationStatus::Pending));
    assert_eq!(history[0].new_status, ApplicationStatus::AwaitingNotification);
    assert_eq!(history[0].changed_by, "u1");
}

#[tokio::test]
async fn test_decisions_on_settled_applications_name_current_status() {
    let f = fixture();

    for status in [
        ApplicationStatus::Active,
        ApplicationStatus::Rejected,
        ApplicationStatus::AwaitingNotification,
        ApplicationStatus::FailedNotification,
    ] {
        let app = seed(&f.store, "u1", status.as_str(), status).await;
        let actor = Actor::owner("u1");

        let attempts = [
            f.commands.approve(CommandRequest::new(&app.key.sort_key, &actor)).await,
            f.commands.reject(CommandRequest::new(&app.key.sort_key, &actor)).await,
            f.commands.cancel(CommandRequest::new(&app.key.sort_key, &actor)).await,
        ];
        for attempt in attempts {
            match attempt {
                Err(CommandError::InvalidTransition { current, message }) => {
                    assert_eq!(current, status);
                    assert!(message.contains(status.as_str()), "{}", message);
                }
                other => panic!("expected InvalidTransition for {}, got {:?}", status, other),
            }
        }

        assert_eq!(f.store.get(&app.key).await.unwrap(), Some(app.clone()));
        assert_eq!(history_len(&f.store, &app).await, 0);
    }
    assert_eq!(f.queue.depth(), 0);
}

#[tokio::test]
async fn test_foreign_actor_denied_admin_allowed() {
    let f = fixture();
    let app = seed(&f.store, "u1", "Scalper", ApplicationStatus::Pending).await;
    let owner = UserId::from("u1");

    let denied = f
        .commands
        .reject(CommandRequest::new(&app.key.sort_key, &Actor::owner("u2")).for_owner(&owner))
        .await;
    assert!(matches!(denied, Err(CommandError::AccessDenied(_))));
    assert_eq!(f.store.get(&app.key).await.unwrap().unwrap().status, ApplicationStatus::Pending);

    let outcome = f
        .commands
        .reject(CommandRequest::new(&app.key.sort_key, &Actor::admin("ops")).for_owner(&owner))
        .await
        .unwrap();
    assert_eq!(outcome.application.status, ApplicationStatus::Rejected);
    assert_eq!(outcome.history.changed_by, "ops");
    assert_eq!(outcome.history.reason, "rejected by admin");
}

#[tokio::test]
async fn test_reject_with_custom_reason() {
    let f = fixture();
    let app = seed(&f.store, "u1", "A", ApplicationStatus::Pending).await;

    let outcome = f
        .commands
        .reject(
            CommandRequest::new(&app.key.sort_key, &Actor::owner("u1"))
                .with_reason("Does not meet requirements"),
        )
        .await
        .unwrap();

    assert_eq!(outcome.application.status, ApplicationStatus::Rejected);
    let entry = outcome.history;
    assert_eq!(entry.action, HistoryAction::Rejected);
    assert_eq!(entry.previous_status, Some(ApplicationStatus::Pending));
    assert_eq!(entry.new_status, ApplicationStatus::Rejected);
    assert_eq!(entry.reason, "Does not meet requirements");
}

#[tokio::test]
async fn test_revoke_active_license() {
    let f = fixture();
    let app = seed(&f.store, "u1", "Grid", ApplicationStatus::Active).await;

    let outcome = f
        .commands
        .revoke(CommandRequest::new(&app.key.sort_key, &Actor::owner("u1")).with_body("{not json"))
        .await
        .unwrap();

    assert_eq!(outcome.application.status, ApplicationStatus::Revoked);
    assert_eq!(outcome.history.reason, "revoked by developer");
    assert!(outcome.application.updated_at > app.updated_at);
}

#[tokio::test]
async fn test_missing_application_is_not_found() {
    let f = fixture();
    let result = f
        .commands
        .cancel(CommandRequest::new("APPLICATION#2026-01-01T00:00:00.000Z#XM#1#Nope", &Actor::owner("u1")))
        .await;
    assert!(matches!(result, Err(CommandError::NotFound(_))));
}

/// Serves a snapshot taken before another writer moved the application on
struct StaleRead {
    inner: Arc<InMemoryApplicationStore>,
    snapshot: Mutex<Option<Application>>,
}

#[async_trait]
impl ApplicationStore for StaleRead {
    async fn get(&self, key: &ApplicationKey) -> Result<Option<Application>, RepositoryError> {
        let taken = self.snapshot.lock().take();
        match taken {
            Some(snapshot) => Ok(Some(snapshot)),
            None => self.inner.get(key).await,
        }
    }
    async fn create(&self, application: &Application) -> Result<(), RepositoryError> {
        self.inner.create(application).await
    }
    async fn update_status(&self, update: &StatusUpdate) -> Result<Application, RepositoryError> {
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

#[tokio::test]
async fn test_second_concurrent_writer_gets_conflict() {
    let f = fixture();
    let app = seed(&f.store, "u1", "Scalper", ApplicationStatus::Pending).await;

    // The approver read Pending; the rejection commits before its write
    let stale = Arc::new(StaleRead {
        inner: f.store.clone(),
        snapshot: Mutex::new(Some(app.clone())),
    });
    let approver = StandardApplicationCommandUseCase::new(
        stale,
        f.queue.clone(),
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap())),
    );

    f.commands
        .reject(CommandRequest::new(&app.key.sort_key, &Actor::owner("u1")))
        .await
        .unwrap();

    let result = approver
        .approve(CommandRequest::new(&app.key.sort_key, &Actor::admin("ops")).for_owner(&UserId::from("u1")))
        .await;
    assert!(matches!(result, Err(CommandError::Conflict(_))), "{:?}", result);

    assert_eq!(f.store.get(&app.key).await.unwrap().unwrap().status, ApplicationStatus::Rejected);
    assert_eq!(f.queue.depth(), 0);
    let history = f.store.list_history(&app.key, &PageRequest::default()).await.unwrap().entries;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, HistoryAction::Rejected);
}

struct BrokerDown;

#[async_trait]
impl NotificationQueue for BrokerDown {
    async fn publish(&self, _job: &NotificationJob) -> Result<MessageId, QueueError> {
        Err(QueueError::Broker("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_publish_failure_leaves_application_active() {
    let store = Arc::new(InMemoryApplicationStore::new());
    let app = seed(&store, "u1", "Scalper", ApplicationStatus::Pending).await;
    let commands = StandardApplicationCommandUseCase::new(
        store.clone(),
        Arc::new(BrokerDown),
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap())),
    );

    let result = commands
        .approve(CommandRequest::new(&app.key.sort_key, &Actor::owner("u1")))
        .await;
    assert!(matches!(result, Err(CommandError::Dependency(_))), "{:?}", result);

    assert_eq!(store.get(&app.key).await.unwrap().unwrap().status, ApplicationStatus::Active);
    let history = store.list_history(&app.key, &PageRequest::default()).await.unwrap().entries;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, HistoryAction::Approved);
    assert_eq!(history[0].previous_status, Some(ApplicationStatus::Pending));
    assert_eq!(history[0].new_status, ApplicationStatus::Active);
    let details = history[0].error_details.as_deref().unwrap();
    assert!(details.contains("connection refused"), "{}", details);
}

struct CountingSender {
    sent: AtomicUsize,
}

#[async_trait]
impl EmailSender for CountingSender {
    async fn send_approval(&self, _application: &Application) -> Result<(), NotificationError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Lets the worker poll between the publish and the approver's next write
struct EagerWorkerQueue {
    inner: Arc<InMemoryQueue>,
    worker: Arc<NotificationWorker>,
    polled: AtomicBool,
}

#[async_trait]
impl NotificationQueue for EagerWorkerQueue {
    async fn publish(&self, job: &NotificationJob) -> Result<MessageId, QueueError> {
        let id = self.inner.publish(job).await?;
        let received = self.worker.poll_once().await?;
        self.polled.store(received > 0, Ordering::SeqCst);
        Ok(id)
    }
}

#[tokio::test]
async fn test_job_consumed_before_hand_over_is_still_delivered() {
    let store = Arc::new(InMemoryApplicationStore::new());
    let queue = Arc::new(InMemoryQueue::new("notifications").with_visibility_timeout(Duration::ZERO));
    let sender = Arc::new(CountingSender {
        sent: AtomicUsize::new(0),
    });
    let worker = Arc::new(NotificationWorker::new(
        store.clone(),
        queue.clone(),
        sender.clone(),
        Arc::new(SystemClock),
        NotificationWorkerConfig {
            wait_time: Duration::ZERO,
            ..Default::default()
        },
    ));
    let eager = Arc::new(EagerWorkerQueue {
        inner: queue.clone(),
        worker: worker.clone(),
        polled: AtomicBool::new(false),
    });
    let app = seed(&store, "u1", "Scalper", ApplicationStatus::Pending).await;
    let commands = StandardApplicationCommandUseCase::new(store.clone(), eager.clone(), Arc::new(SystemClock));

    let outcome = commands
        .approve(CommandRequest::new(&app.key.sort_key, &Actor::owner("u1")))
        .await
        .unwrap();
    assert!(eager.polled.load(Ordering::SeqCst));
    assert_eq!(outcome.application.status, ApplicationStatus::AwaitingNotification);
    assert_eq!(sender.sent.load(Ordering::SeqCst), 0);
    assert_eq!(queue.depth(), 1);

    assert_eq!(worker.poll_once().await.unwrap(), 1);
    assert_eq!(sender.sent.load(Ordering::SeqCst), 1);
    assert_eq!(queue.depth(), 0);
    assert_eq!(store.get(&app.key).await.unwrap().unwrap().status, ApplicationStatus::Active);
}

/// Applies each write, then answers the first status write after the caller's timeout
struct SlowFirstAck {
    inner: Arc<InMemoryApplicationStore>,
    stalled: AtomicBool,
}

#[async_trait]
impl ApplicationStore for SlowFirstAck {
    async fn get(&self, key: &ApplicationKey) -> Result<Option<Application>, RepositoryError> {
        self.inner.get(key).await
    }
    async fn create(&self, application: &Application) -> Result<(), RepositoryError> {
        self.inner.create(application).await
    }
    async fn update_status(&self, update: &StatusUpdate) -> Result<Application, RepositoryError> {
        let result = self.inner.update_status(update).await;
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        result
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

#[tokio::test]
async fn test_approve_survives_status_write_acknowledged_late() {
    let f = fixture();
    let app = seed(&f.store, "u1", "Scalper", ApplicationStatus::Pending).await;
    let store = Arc::new(ResilientApplicationStore::new(
        Arc::new(SlowFirstAck {
            inner: f.store.clone(),
            stalled: AtomicBool::new(false),
        }),
        RetryPolicy {
            timeout: Duration::from_millis(50),
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        },
    ));
    let commands = StandardApplicationCommandUseCase::new(
        store,
        f.queue.clone(),
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap())),
    );

    let outcome = commands
        .approve(CommandRequest::new(&app.key.sort_key, &Actor::owner("u1")))
        .await
        .unwrap();

    assert_eq!(outcome.application.status, ApplicationStatus::AwaitingNotification);
    assert_eq!(f.queue.depth(), 1);
    let history = f.store.list_history(&app.key, &PageRequest::default()).await.unwrap().entries;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].new_status, ApplicationStatus::AwaitingNotification);
}
