// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Notification Queue Ports
//!
//! Abstraction over a durable message broker with at-least-once delivery:
//!
//! - [`NotificationQueue`] is the producer side used by command handlers.
//! - [`QueueConsumer`] is the consumer side used by the notification worker
//!   and the dead-letter handler.
//!
//! A received message stays invisible for the queue's visibility timeout.
//! If it is not acknowledged in that window it becomes visible again. After
//! the broker's maximum receive count it is moved to the dead-letter queue.
//! That bound is broker policy: consumers only ever read it back from
//! delivery metadata (`ApproximateReceiveCount`).

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::domain::notification::NotificationJob;

/// Delivery-count attribute, as stamped by the broker
pub const ATTR_RECEIVE_COUNT: &str = "ApproximateReceiveCount";
/// Error text attached to a message by a failed consumer
pub const ATTR_ERROR_MESSAGE: &str = "ErrorMessage";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle for one particular delivery of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub receipt: ReceiptHandle,
    /// Raw body; may be a bare job or an envelope-wrapped job
    pub body: String,
    pub attributes: HashMap<String, String>,
    /// Number of times this message has been received from the current queue
    pub receive_count: u32,
}

impl ReceivedMessage {
    /// Delivery attempts recorded by the broker, if it reported any
    pub fn delivery_attempts(&self) -> Option<u32> {
        self.attributes
            .get(ATTR_RECEIVE_COUNT)
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.attributes
            .get(ATTR_ERROR_MESSAGE)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Producer side
#[async_trait]
pub trait NotificationQueue: Send + Sync {
    async fn publish(&self, job: &NotificationJob) -> Result<MessageId, QueueError>;
}

/// Consumer side
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Long-poll for up to `max_messages`, waiting at most `wait`
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Permanently remove a delivered message
    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Attach error text to an unacknowledged message without changing its
    /// visibility. Brokers that cannot annotate messages ignore this.
    async fn report_failure(
        &self,
        _receipt: &ReceiptHandle,
        _error: &str,
    ) -> Result<(), QueueError> {
        Ok(())
    }

    fn queue_name(&self) -> &str;
}

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("Unknown or expired receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Queue is closed")]
    Closed,

    #[error("Failed to encode message: {0}")]
    Encoding(String),

    #[error("Broker error: {0}")]
    Broker(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Broker(err.to_string())
    }
}
