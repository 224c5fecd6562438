// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application Command Use Cases
//!
//! Approve, Reject, Cancel and Revoke for a single application.
//!
//! # DDD Pattern: Application Service
//!
//! - **Layer:** Application
//! - **Responsibility:** Enforce ownership and the state graph, write the new
//!   status conditionally, record history, kick off the notification pipeline
//! - **Collaborators:**
//!   - Domain: `StatusTransitionValidator`, `Application`, `HistoryEntry`
//!   - Ports: `ApplicationStore`, `NotificationQueue`, `Clock`
//!
//! # Flow
//!
//! 1. Resolve actor and key (401 / 400 before any store access)
//! 2. Load the application (NotFound)
//! 3. Ownership check (AccessDenied)
//! 4. Transition check (InvalidTransition, naming the current status)
//! 5. Conditional status write against the status read in step 2 (Conflict)
//! 6. Append a history entry
//! 7. Approve only: publish a `NotificationJob`, then move to `AwaitingNotification`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::application::error::CommandError;
use crate::domain::actor::{Actor, ActorRole};
use crate::domain::application::{Application, ApplicationKey, ApplicationStatus, UserId};
use crate::domain::clock::Clock;
use crate::domain::history::{HistoryAction, HistoryEntry};
use crate::domain::notification::NotificationJob;
use crate::domain::queue::{MessageId, NotificationQueue};
use crate::domain::repository::{ApplicationStore, StatusUpdate};
use crate::domain::transition::{ApplicationAction, Initiator, StatusTransitionValidator};

/// Raw command input as it arrives from the API boundary
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    /// Application sort key (`{id}` path segment)
    pub sort_key: String,
    /// Owning user; defaults to the actor when absent
    pub owner_id: Option<String>,
    pub actor_id: Option<String>,
    pub actor_role: ActorRole,
    /// Unparsed JSON request body carrying an optional `reason`
    pub body: Option<String>,
}

impl CommandRequest {
    pub fn new(sort_key: impl Into<String>, actor: &Actor) -> Self {
        Self {
            sort_key: sort_key.into(),
            owner_id: None,
            actor_id: Some(actor.id.to_string()),
            actor_role: actor.role,
            body: None,
        }
    }

    pub fn for_owner(mut self, owner: &UserId) -> Self {
        self.owner_id = Some(owner.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_reason(self, reason: &str) -> Self {
        let body = serde_json::json!({ "reason": reason }).to_string();
        self.with_body(body)
    }

    fn resolve(&self) -> Result<(Actor, ApplicationKey), CommandError> {
        let actor_id = self
            .actor_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(CommandError::Unauthenticated)?;
        let actor = Actor::new(actor_id, self.actor_role);

        let sort_key = self.sort_key.trim();
        if sort_key.is_empty() {
            return Err(CommandError::Validation("Missing application id".to_string()));
        }

        let owner = self
            .owner_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(UserId::from)
            .unwrap_or_else(|| actor.id.clone());

        Ok((actor, ApplicationKey::new(owner, sort_key)))
    }
}

/// Extract a custom reason from a JSON body.
///
/// Unparsable bodies and blank reasons yield `None`; callers substitute the
/// generated default instead of failing.
pub fn parse_reason(body: Option<&str>) -> Option<String> {
    let body = body?.trim();
    if body.is_empty() {
        return None;
    }

    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => value
            .get("reason")
            .and_then(|r| r.as_str())
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed command body, using default reason");
            None
        }
    }
}

/// `"rejected by developer"`, `"revoked by admin"`, ...
pub fn default_reason(action: ApplicationAction, role: ActorRole) -> String {
    format!("{} by {}", action.past_tense(), role.label())
}

/// Result of a successful command
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub application: Application,
    pub history: HistoryEntry,
    /// Set for Approve: the published notification job
    pub message_id: Option<MessageId>,
}

/// Application Command Use Case
#[async_trait]
pub trait ApplicationCommandUseCase: Send + Sync {
    /// `Pending → AwaitingNotification` via `Active`, publishing a notification job
    async fn approve(&self, request: CommandRequest) -> Result<CommandOutcome, CommandError>;

    /// `Pending → Rejected`
    async fn reject(&self, request: CommandRequest) -> Result<CommandOutcome, CommandError>;

    /// `Pending → Cancelled`
    async fn cancel(&self, request: CommandRequest) -> Result<CommandOutcome, CommandError>;

    /// `Active → Revoked`
    async fn revoke(&self, request: CommandRequest) -> Result<CommandOutcome, CommandError>;
}

/// Standard implementation of ApplicationCommandUseCase
pub struct StandardApplicationCommandUseCase {
    store: Arc<dyn ApplicationStore>,
    queue: Arc<dyn NotificationQueue>,
    clock: Arc<dyn Clock>,
}

impl StandardApplicationCommandUseCase {
    pub fn new(
        store: Arc<dyn ApplicationStore>,
        queue: Arc<dyn NotificationQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, queue, clock }
    }

    async fn execute(
        &self,
        action: ApplicationAction,
        request: CommandRequest,
    ) -> Result<CommandOutcome, CommandError> {
        let result = self.try_execute(action, &request).await;

        match &result {
            Ok(outcome) => {
                metrics::counter!("licensing_transitions_total", "action" => action.past_tense())
                    .increment(1);
                info!(
                    application = %outcome.application.key,
                    action = %action,
                    status = %outcome.application.status,
                    "Application command completed"
                );
            }
            Err(CommandError::Dependency(detail)) => {
                error!(
                    sort_key = %request.sort_key,
                    actor = ?request.actor_id,
                    action = %action,
                    error = %detail,
                    "Application command failed on a dependency"
                );
            }
            Err(e) => {
                info!(
                    sort_key = %request.sort_key,
                    action = %action,
                    code = e.code(),
                    "Application command refused: {}",
                    e
                );
            }
        }

        result
    }

    async fn try_execute(
        &self,
        action: ApplicationAction,
        request: &CommandRequest,
    ) -> Result<CommandOutcome, CommandError> {
        // Step 1: Identity and key, before any store access
        let (actor, key) = request.resolve()?;

        // Step 2: Load
        let application = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| CommandError::NotFound(key.sort_key.clone()))?;

        // Step 3-4: Ownership, then the state graph
        StatusTransitionValidator::check_ownership(&actor, application.owner())?;
        let current = application.status;
        let target = StatusTransitionValidator::validate(current, action, Initiator::User(actor.role))?;

        let reason = parse_reason(request.body.as_deref())
            .unwrap_or_else(|| default_reason(action, actor.role));

        // Step 5: Conditional write against the status we read
        let updated_at = application.next_updated_at(self.clock.now());
        let updated = self
            .store
            .update_status(&StatusUpdate::new(key.clone(), current, target, updated_at))
            .await?;

        if action == ApplicationAction::Approve {
            return self.start_notification(&actor, updated, current, reason).await;
        }

        // Step 6: History
        let entry = HistoryEntry::transition(
            key,
            history_action(action),
            &actor.id,
            current,
            target,
            reason,
            updated_at,
        );
        self.record_history(&entry).await;

        Ok(CommandOutcome {
            application: updated,
            history: entry,
            message_id: None,
        })
    }

    /// Step 7: publish the job, then hand the application to the notification pipeline
    async fn start_notification(
        &self,
        actor: &Actor,
        approved: Application,
        previous: ApplicationStatus,
        reason: String,
    ) -> Result<CommandOutcome, CommandError> {
        let key = approved.key.clone();
        let job = NotificationJob::for_application(&key);

        let message_id = match self.queue.publish(&job).await {
            Ok(id) => id,
            Err(e) => {
                let entry = self
                    .approval_entry(actor, &key, previous, approved.status, reason, approved.updated_at)
                    .with_error_details(Some(format!("Failed to publish notification job: {}", e)));
                self.record_history(&entry).await;
                return Err(e.into());
            }
        };

        let target = StatusTransitionValidator::validate(
            approved.status,
            ApplicationAction::AwaitNotification,
            Initiator::System,
        )?;
        let updated_at = approved.next_updated_at(self.clock.now());
        let update = StatusUpdate::new(key.clone(), approved.status, target, updated_at);

        match self.store.update_status(&update).await {
            Ok(awaiting) => {
                let entry = self.approval_entry(actor, &key, previous, target, reason, updated_at);
                self.record_history(&entry).await;
                Ok(CommandOutcome {
                    application: awaiting,
                    history: entry,
                    message_id: Some(message_id),
                })
            }
            Err(e) => {
                warn!(
                    application = %key,
                    message_id = %message_id,
                    error = %e,
                    "Approved application could not be moved to AwaitingNotification"
                );
                let entry = self
                    .approval_entry(actor, &key, previous, approved.status, reason, approved.updated_at)
                    .with_error_details(Some(e.to_string()));
                self.record_history(&entry).await;
                Err(e.into())
            }
        }
    }

    fn approval_entry(
        &self,
        actor: &Actor,
        key: &ApplicationKey,
        previous: ApplicationStatus,
        new_status: ApplicationStatus,
        reason: String,
        at: DateTime<Utc>,
    ) -> HistoryEntry {
        HistoryEntry::transition(
            key.clone(),
            HistoryAction::Approved,
            &actor.id,
            previous,
            new_status,
            reason,
            at,
        )
    }

    /// History is best-effort once the status write has committed
    async fn record_history(&self, entry: &HistoryEntry) {
        if let Err(e) = self.store.append_history(entry).await {
            error!(
                application = %entry.key,
                action = %entry.action,
                error = %e,
                "Failed to append history entry after status change"
            );
        }
    }
}

fn history_action(action: ApplicationAction) -> HistoryAction {
    match action {
        ApplicationAction::Approve | ApplicationAction::AwaitNotification => HistoryAction::Approved,
        ApplicationAction::Reject => HistoryAction::Rejected,
        ApplicationAction::Cancel => HistoryAction::Cancelled,
        ApplicationAction::Revoke => HistoryAction::Revoked,
        ApplicationAction::ConfirmNotification => HistoryAction::EmailSent,
        ApplicationAction::FailNotification => HistoryAction::EmailFailed,
    }
}

#[async_trait]
impl ApplicationCommandUseCase for StandardApplicationCommandUseCase {
    async fn approve(&self, request: CommandRequest) -> Result<CommandOutcome, CommandError> {
        self.execute(ApplicationAction::Approve, request).await
    }

    async fn reject(&self, request: CommandRequest) -> Result<CommandOutcome, CommandError> {
        self.execute(ApplicationAction::Reject, request).await
    }

    async fn cancel(&self, request: CommandRequest) -> Result<CommandOutcome, CommandError> {
        self.execute(ApplicationAction::Cancel, request).await
    }

    async fn revoke(&self, request: CommandRequest) -> Result<CommandOutcome, CommandError> {
        self.execute(ApplicationAction::Revoke, request).await
    }
}
