// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application history (append-only audit trail)
//!
//! One entry is written per status transition. Entries are never updated or
//! deleted; listing order is write order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::application::{ApplicationKey, ApplicationStatus, UserId};

/// `changedBy` value for transitions made by the notification pipeline
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryAction {
    Created,
    Approved,
    Rejected,
    Cancelled,
    Revoked,
    EmailSent,
    EmailFailed,
}

impl HistoryAction {
    pub const ALL: [HistoryAction; 7] = [
        Self::Created,
        Self::Approved,
        Self::Rejected,
        Self::Cancelled,
        Self::Revoked,
        Self::EmailSent,
        Self::EmailFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::Cancelled => "Cancelled",
            Self::Revoked => "Revoked",
            Self::EmailSent => "EmailSent",
            Self::EmailFailed => "EmailFailed",
        }
    }
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| format!("Unknown history action: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Assigned by the writer; appending the same entry twice stores it once
    pub entry_id: Uuid,

    #[serde(flatten)]
    pub key: ApplicationKey,

    pub action: HistoryAction,

    /// User id of the actor, or [`SYSTEM_ACTOR`]
    pub changed_by: String,

    /// `None` only for the `Created` entry
    pub previous_status: Option<ApplicationStatus>,

    pub new_status: ApplicationStatus,

    pub reason: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn transition(
        key: ApplicationKey,
        action: HistoryAction,
        changed_by: &UserId,
        previous_status: ApplicationStatus,
        new_status: ApplicationStatus,
        reason: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            key,
            action,
            changed_by: changed_by.to_string(),
            previous_status: Some(previous_status),
            new_status,
            reason: reason.into(),
            error_details: None,
            retry_count: None,
            recorded_at,
        }
    }

    pub fn system_transition(
        key: ApplicationKey,
        action: HistoryAction,
        previous_status: ApplicationStatus,
        new_status: ApplicationStatus,
        reason: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            changed_by: SYSTEM_ACTOR.to_string(),
            ..Self::transition(
                key,
                action,
                &UserId::from(SYSTEM_ACTOR),
                previous_status,
                new_status,
                reason,
                recorded_at,
            )
        }
    }

    pub fn created(key: ApplicationKey, recorded_at: DateTime<Utc>) -> Self {
        let changed_by = key.user_id.to_string();
        Self {
            entry_id: Uuid::new_v4(),
            key,
            action: HistoryAction::Created,
            changed_by,
            previous_status: None,
            new_status: ApplicationStatus::Pending,
            reason: "application submitted".to_string(),
            error_details: None,
            retry_count: None,
            recorded_at,
        }
    }

    pub fn with_error_details(mut self, details: Option<String>) -> Self {
        self.error_details = details;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }
}

/// Pagination request for history listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: usize,
    /// Opaque cursor returned by a previous page
    pub cursor: Option<String>,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: usize = 20;
    pub const MAX_LIMIT: usize = 100;

    pub fn new(limit: Option<usize>, cursor: Option<String>) -> Self {
        let limit = limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT);
        Self { limit, cursor }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub entries: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}
