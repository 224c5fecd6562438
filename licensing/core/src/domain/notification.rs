// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Notification jobs and the email service port.
//!
//! A `NotificationJob` is transient and queue-resident; its authoritative
//! state is always the `Application` it references.
//!
//! Wire format:
//!
//! ```json
//! { "applicationSK": "APPLICATION#...", "userId": "u1", "retryCount": 0 }
//! ```
//!
//! optionally wrapped once in a pub/sub envelope `{ "Message": "<json-encoded job>" }`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::application::{Application, ApplicationKey, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationJob {
    #[serde(rename = "applicationSK")]
    pub application_sk: String,

    #[serde(rename = "userId")]
    pub user_id: String,

    /// Informational only; the authoritative attempt count is the broker's
    #[serde(rename = "retryCount", default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl NotificationJob {
    pub fn for_application(key: &ApplicationKey) -> Self {
        Self {
            application_sk: key.sort_key.clone(),
            user_id: key.user_id.to_string(),
            retry_count: Some(0),
        }
    }

    pub fn application_key(&self) -> ApplicationKey {
        ApplicationKey::new(UserId::new(self.user_id.clone()), self.application_sk.clone())
    }

    pub fn to_body(&self) -> Result<String, JobParseError> {
        serde_json::to_string(self).map_err(|e| JobParseError::Malformed(e.to_string()))
    }

    /// Parse a message body, unwrapping at most one `{ "Message": ... }` envelope.
    pub fn parse_body(body: &str) -> Result<Self, JobParseError> {
        let value: serde_json::Value =
            serde_json::from_str(body).map_err(|e| JobParseError::Malformed(e.to_string()))?;

        let job_value = match value.get("Message") {
            Some(serde_json::Value::String(inner)) => serde_json::from_str(inner)
                .map_err(|e| JobParseError::MalformedEnvelope(e.to_string()))?,
            Some(other) => other.clone(),
            None => value,
        };

        let job: NotificationJob = serde_json::from_value(job_value)
            .map_err(|e| JobParseError::Malformed(e.to_string()))?;

        if job.application_sk.trim().is_empty() || job.user_id.trim().is_empty() {
            return Err(JobParseError::MissingIdentity);
        }
        Ok(job)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobParseError {
    #[error("Malformed notification job: {0}")]
    Malformed(String),

    #[error("Malformed notification envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Notification job is missing applicationSK or userId")]
    MissingIdentity,
}

/// External email service
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Send the decision email for an approved application
    async fn send_approval(&self, application: &Application) -> Result<(), NotificationError>;
}

#[derive(Debug, Clone, Error)]
pub enum NotificationError {
    #[error("Email service rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Email service unreachable: {0}")]
    Transport(String),

    #[error("Failed to render email template: {0}")]
    Template(String),
}
