// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Submit Application Use Case
//!
//! Webhook intake: turns a submission from the order/registration front end
//! into a `Pending` application plus its `Created` history entry.
//!
//! # Flow
//!
//! 1. Verify the `X-Signature` HMAC when a webhook secret is configured
//! 2. Parse and validate the submission
//! 3. Reject a second open application for the same broker/account/EA
//! 4. Conditional create (fails if the key already exists)
//! 5. Append the `Created` history entry

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::application::error::CommandError;
use crate::domain::application::{Application, ContactDetails, UserId};
use crate::domain::clock::Clock;
use crate::domain::history::HistoryEntry;
use crate::domain::repository::{ApplicationStore, RepositoryError};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Webhook payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRequest {
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub x_account: String,
    pub broker: String,
    pub account_number: String,
    pub ea_name: String,
}

impl SubmissionRequest {
    fn into_parts(self) -> (UserId, ContactDetails) {
        (
            UserId::new(self.user_id.trim()),
            ContactDetails {
                email: self.email.trim().to_string(),
                x_account: self.x_account.trim().to_string(),
                broker: self.broker.trim().to_string(),
                account_number: self.account_number.trim().to_string(),
                ea_name: self.ea_name.trim().to_string(),
            },
        )
    }
}

/// Shared-secret HMAC-SHA256 check for webhook bodies
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Option<String>,
}

impl WebhookVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// `sha256=<hex>` signature for `body`, if a secret is configured
    pub fn sign(&self, body: &[u8]) -> Option<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_ref()?.as_bytes()).ok()?;
        mac.update(body);
        Some(format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes())))
    }

    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<(), CommandError> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };

        let provided = signature
            .map(str::trim)
            .and_then(|s| s.strip_prefix(SIGNATURE_PREFIX))
            .and_then(|hex_sig| hex::decode(hex_sig).ok())
            .ok_or(CommandError::Unauthenticated)?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| CommandError::Dependency(format!("Invalid webhook secret: {}", e)))?;
        mac.update(body);
        mac.verify_slice(&provided).map_err(|_| {
            warn!("Webhook signature mismatch");
            CommandError::Unauthenticated
        })
    }
}

/// Submit Application Use Case
#[async_trait]
pub trait SubmitApplicationUseCase: Send + Sync {
    /// Create a `Pending` application from a raw webhook body
    async fn submit(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<Application, CommandError>;
}

pub struct StandardSubmitApplicationUseCase {
    store: Arc<dyn ApplicationStore>,
    clock: Arc<dyn Clock>,
    verifier: WebhookVerifier,
}

impl StandardSubmitApplicationUseCase {
    pub fn new(
        store: Arc<dyn ApplicationStore>,
        clock: Arc<dyn Clock>,
        verifier: WebhookVerifier,
    ) -> Self {
        Self {
            store,
            clock,
            verifier,
        }
    }

    async fn ensure_no_open_application(&self, contact: &ContactDetails) -> Result<(), CommandError> {
        let existing = self
            .store
            .find_by_broker_account(&contact.broker, &contact.account_number)
            .await?;

        if let Some(open) = existing
            .iter()
            .find(|a| a.contact.ea_name == contact.ea_name && a.status.is_open())
        {
            return Err(CommandError::Conflict(format!(
                "An application for {} on {}/{} is already {}",
                contact.ea_name, contact.broker, contact.account_number, open.status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SubmitApplicationUseCase for StandardSubmitApplicationUseCase {
    async fn submit(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<Application, CommandError> {
        self.verifier.verify(body, signature)?;

        let request: SubmissionRequest = serde_json::from_slice(body)
            .map_err(|e| CommandError::Validation(format!("Invalid submission: {}", e)))?;
        let (user_id, contact) = request.into_parts();

        let application = Application::submit(user_id, contact, self.clock.now())?;

        self.ensure_no_open_application(&application.contact).await?;

        // The lookup above is advisory; the store enforces one open application per license
        self.store.create(&application).await.map_err(|e| match e {
            RepositoryError::ConditionFailed(detail) => CommandError::Conflict(format!(
                "Application {} was not created: {}",
                application.key.sort_key, detail
            )),
            other => CommandError::from(other),
        })?;

        let entry = HistoryEntry::created(application.key.clone(), application.applied_at);
        if let Err(e) = self.store.append_history(&entry).await {
            error!(
                application = %application.key,
                error = %e,
                "Failed to append Created history entry"
            );
        }

        metrics::counter!("licensing_transitions_total", "action" => "submitted").increment(1);
        info!(
            application = %application.key,
            broker = %application.contact.broker,
            ea_name = %application.contact.ea_name,
            "Application submitted"
        );

        Ok(application)
    }
}
