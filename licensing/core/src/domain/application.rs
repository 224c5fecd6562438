// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Application Aggregate
//!
//! One `Application` exists per submitted EA license request. It is keyed by
//! the owning user (partition) and a composite sort key
//! `APPLICATION#<timestamp>#<broker>#<account>#<eaName>`.
//!
//! Status changes are never applied to this struct directly by callers; they
//! go through [`crate::domain::transition::StatusTransitionValidator`] and the
//! store's conditional write (see [`crate::domain::repository::ApplicationStore`]).

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Value Objects
// ============================================================================

/// Identifier of the user who owns an application (or acts on one)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Composite identity of an application: owning user + sort key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationKey {
    pub user_id: UserId,
    #[serde(rename = "sk")]
    pub sort_key: String,
}

impl ApplicationKey {
    pub const SORT_KEY_PREFIX: &'static str = "APPLICATION";

    pub fn new(user_id: UserId, sort_key: impl Into<String>) -> Self {
        Self {
            user_id,
            sort_key: sort_key.into(),
        }
    }

    /// Build the sort key for a fresh submission.
    ///
    /// The timestamp is rendered as RFC 3339 with millisecond precision so
    /// keys for the same user sort by submission time.
    pub fn compose(
        user_id: UserId,
        submitted_at: DateTime<Utc>,
        broker: &str,
        account_number: &str,
        ea_name: &str,
    ) -> Self {
        let sort_key = format!(
            "{}#{}#{}#{}#{}",
            Self::SORT_KEY_PREFIX,
            submitted_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            broker,
            account_number,
            ea_name
        );
        Self { user_id, sort_key }
    }

    /// Split the sort key back into its components.
    pub fn parts(&self) -> Result<SortKeyParts, ApplicationError> {
        SortKeyParts::parse(&self.sort_key)
    }
}

impl fmt::Display for ApplicationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.sort_key)
    }
}

/// Decoded components of an application sort key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKeyParts {
    pub submitted_at: String,
    pub broker: String,
    pub account_number: String,
    pub ea_name: String,
}

impl SortKeyParts {
    pub fn parse(sort_key: &str) -> Result<Self, ApplicationError> {
        // EA names may themselves contain '#', so only split off the first four fields
        let mut fields = sort_key.splitn(5, '#');
        let prefix = fields.next().unwrap_or_default();
        if prefix != ApplicationKey::SORT_KEY_PREFIX {
            return Err(ApplicationError::InvalidSortKey(sort_key.to_string()));
        }

        let mut next = || {
            fields
                .next()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| ApplicationError::InvalidSortKey(sort_key.to_string()))
        };

        Ok(Self {
            submitted_at: next()?,
            broker: next()?,
            account_number: next()?,
            ea_name: next()?,
        })
    }
}

/// Application status lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationStatus {
    Pending,
    Active,
    Rejected,
    Cancelled,
    Revoked,
    Expired,
    AwaitingNotification,
    FailedNotification,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 8] = [
        Self::Pending,
        Self::Active,
        Self::Rejected,
        Self::Cancelled,
        Self::Revoked,
        Self::Expired,
        Self::AwaitingNotification,
        Self::FailedNotification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Active => "Active",
            Self::Rejected => "Rejected",
            Self::Cancelled => "Cancelled",
            Self::Revoked => "Revoked",
            Self::Expired => "Expired",
            Self::AwaitingNotification => "AwaitingNotification",
            Self::FailedNotification => "FailedNotification",
        }
    }

    /// Statuses that block a second submission for the same broker/account/EA
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Active | Self::AwaitingNotification
        )
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationStatus {
    type Err = ApplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ApplicationError::UnknownStatus(s.to_string()))
    }
}

/// Contact and trading-account details supplied with the submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactDetails {
    pub email: String,
    /// External handle (e.g. X/Twitter account) of the applicant
    pub x_account: String,
    pub broker: String,
    pub account_number: String,
    pub ea_name: String,
}

impl ContactDetails {
    pub fn validate(&self) -> Result<(), ApplicationError> {
        let required = [
            ("email", &self.email),
            ("broker", &self.broker),
            ("accountNumber", &self.account_number),
            ("eaName", &self.ea_name),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ApplicationError::MissingField(field));
            }
        }
        if !self.email.contains('@') {
            return Err(ApplicationError::InvalidEmail(self.email.clone()));
        }
        Ok(())
    }
}

// ============================================================================
// Aggregate Root: Application
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    #[serde(flatten)]
    pub key: ApplicationKey,

    pub status: ApplicationStatus,

    #[serde(flatten)]
    pub contact: ContactDetails,

    pub applied_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<DateTime<Utc>>,

    /// Number of notification pipelines that ended in the dead-letter path
    pub failure_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
}

impl Application {
    /// Create a freshly submitted application in `Pending` status
    pub fn submit(
        user_id: UserId,
        contact: ContactDetails,
        applied_at: DateTime<Utc>,
    ) -> Result<Self, ApplicationError> {
        if user_id.as_str().trim().is_empty() {
            return Err(ApplicationError::MissingField("userId"));
        }
        contact.validate()?;

        let key = ApplicationKey::compose(
            user_id,
            applied_at,
            &contact.broker,
            &contact.account_number,
            &contact.ea_name,
        );

        Ok(Self {
            key,
            status: ApplicationStatus::Pending,
            contact,
            applied_at,
            updated_at: applied_at,
            last_failed_at: None,
            failure_count: 0,
            last_failure_reason: None,
        })
    }

    pub fn owner(&self) -> &UserId {
        &self.key.user_id
    }

    /// Timestamp for the next write: never equal to or earlier than the current one
    pub fn next_updated_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        next_write_timestamp(self.updated_at, now)
    }
}

/// `max(now, previous + 1ms)`
pub fn next_write_timestamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = previous + Duration::milliseconds(1);
    if now > previous {
        now
    } else {
        floor
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error("Invalid application sort key: {0}")]
    InvalidSortKey(String),

    #[error("Unknown application status: {0}")]
    UnknownStatus(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid email address: {0}")]
    InvalidEmail(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn contact() -> ContactDetails {
        ContactDetails {
            email: "trader@example.com".to_string(),
            x_account: "@trader".to_string(),
            broker: "XMTrading".to_string(),
            account_number: "7788123".to_string(),
            ea_name: "Sankey#Scalper".to_string(),
        }
    }

    #[test]
    fn test_sort_key_composition_and_parsing() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap();
        let key = ApplicationKey::compose(UserId::from("u1"), at, "XMTrading", "7788123", "Sankey#Scalper");

        assert_eq!(
            key.sort_key,
            "APPLICATION#2025-03-01T12:30:00.000Z#XMTrading#7788123#Sankey#Scalper"
        );

        let parts = key.parts().unwrap();
        assert_eq!(parts.broker, "XMTrading");
        assert_eq!(parts.account_number, "7788123");
        assert_eq!(parts.ea_name, "Sankey#Scalper");
    }

    #[test]
    fn test_sort_key_rejects_foreign_prefix() {
        assert!(SortKeyParts::parse("LICENSE#2025#a#b#c").is_err());
        assert!(SortKeyParts::parse("APPLICATION#2025#a").is_err());
        assert!(SortKeyParts::parse("APPLICATION#2025##b#c").is_err());
    }

    #[test]
    fn test_submit_starts_pending() {
        let at = Utc::now();
        let app = Application::submit(UserId::from("u1"), contact(), at).unwrap();
        assert_eq!(app.status, ApplicationStatus::Pending);
        assert_eq!(app.failure_count, 0);
        assert_eq!(app.applied_at, app.updated_at);
        assert_eq!(app.owner().as_str(), "u1");
    }

    #[test]
    fn test_submit_validates_contact() {
        let mut bad = contact();
        bad.email = "not-an-email".to_string();
        assert_eq!(
            Application::submit(UserId::from("u1"), bad, Utc::now()),
            Err(ApplicationError::InvalidEmail("not-an-email".to_string()))
        );

        let mut missing = contact();
        missing.broker = "  ".to_string();
        assert_eq!(
            Application::submit(UserId::from("u1"), missing, Utc::now()),
            Err(ApplicationError::MissingField("broker"))
        );
    }

    #[test]
    fn test_updated_at_strictly_increases() {
        let previous = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(next_write_timestamp(previous, previous), previous + Duration::milliseconds(1));

        let earlier = previous - Duration::seconds(5);
        assert!(next_write_timestamp(previous, earlier) > previous);

        let later = previous + Duration::seconds(5);
        assert_eq!(next_write_timestamp(previous, later), later);
    }

    #[test]
    fn test_status_parsing_and_display() {
        for status in ApplicationStatus::ALL {
            assert_eq!(status.as_str().parse::<ApplicationStatus>().unwrap(), status);
        }
        assert_eq!("pending".parse::<ApplicationStatus>().unwrap(), ApplicationStatus::Pending);
        assert!("Archived".parse::<ApplicationStatus>().is_err());
    }

    #[test]
    fn test_application_json_shape() {
        let app = Application::submit(UserId::from("u1"), contact(), Utc::now()).unwrap();
        let json = serde_json::to_value(&app).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["status"], "Pending");
        assert_eq!(json["xAccount"], "@trader");
        assert!(json["sk"].as_str().unwrap().starts_with("APPLICATION#"));
        assert!(json.get("lastFailureReason").is_none());
    }
}
