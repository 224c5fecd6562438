// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Queue Implementations
//!
//! - **InMemoryQueue** - single-process broker with visibility timeout,
//!   receive counting and an optional redrive to a dead-letter queue
//! - **PostgresQueue** - durable broker over the `notification_messages` table
//!
//! Both implement the producer ([`NotificationQueue`]) and consumer
//! ([`QueueConsumer`]) ports.

pub mod postgres;

pub use postgres::PostgresQueue;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::notification::NotificationJob;
use crate::domain::queue::{
    MessageId, NotificationQueue, QueueConsumer, QueueError, ReceiptHandle, ReceivedMessage,
    ATTR_ERROR_MESSAGE, ATTR_RECEIVE_COUNT,
};

/// Upper bound on a single sleep inside a long poll, so visibility expiries are noticed
const POLL_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct StoredMessage {
    id: MessageId,
    body: String,
    /// Persistent attributes; survive redelivery and redrive
    attributes: HashMap<String, String>,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<ReceiptHandle>,
}

struct RedrivePolicy {
    dead_letter: Arc<InMemoryQueue>,
    max_receive_count: u32,
}

pub struct InMemoryQueue {
    name: String,
    visibility_timeout: Duration,
    redrive: Option<RedrivePolicy>,
    messages: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility_timeout: Duration::from_secs(30),
            redrive: None,
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Move messages to `dead_letter` once they have been received `max_receive_count` times
    pub fn with_dead_letter_queue(mut self, dead_letter: Arc<InMemoryQueue>, max_receive_count: u32) -> Self {
        self.redrive = Some(RedrivePolicy {
            dead_letter,
            max_receive_count: max_receive_count.max(1),
        });
        self
    }

    /// Messages not yet acknowledged, visible or in flight
    pub fn depth(&self) -> usize {
        self.messages.lock().len()
    }

    /// Enqueue a raw body, as an upstream publisher would
    pub fn send_raw(&self, body: impl Into<String>) -> MessageId {
        self.enqueue(body.into(), HashMap::new())
    }

    fn enqueue(&self, body: String, attributes: HashMap<String, String>) -> MessageId {
        let id = MessageId(Uuid::new_v4().to_string());
        self.messages.lock().push_back(StoredMessage {
            id: id.clone(),
            body,
            attributes,
            receive_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        });
        self.notify.notify_waiters();
        id
    }

    /// One non-blocking pass: redrive exhausted messages, then lease visible ones
    fn take_visible(&self, max_messages: usize) -> Vec<ReceivedMessage> {
        let now = Instant::now();
        let mut dead_lettered = Vec::new();
        let mut received = Vec::new();

        {
            let mut messages = self.messages.lock();
            let mut index = 0;
            while index < messages.len() && received.len() < max_messages {
                if messages[index].visible_at > now {
                    index += 1;
                    continue;
                }

                let exhausted = self
                    .redrive
                    .as_ref()
                    .map_or(false, |r| messages[index].receive_count >= r.max_receive_count);
                if exhausted {
                    if let Some(message) = messages.remove(index) {
                        dead_lettered.push(message);
                    }
                    continue;
                }

                let message = &mut messages[index];
                message.receive_count += 1;
                message.visible_at = now + self.visibility_timeout;
                let receipt = ReceiptHandle(Uuid::new_v4().to_string());
                message.receipt = Some(receipt.clone());

                let mut attributes = message.attributes.clone();
                attributes
                    .entry(ATTR_RECEIVE_COUNT.to_string())
                    .or_insert_with(|| message.receive_count.to_string());

                received.push(ReceivedMessage {
                    message_id: message.id.clone(),
                    receipt,
                    body: message.body.clone(),
                    attributes,
                    receive_count: message.receive_count,
                });
                index += 1;
            }
        }

        if let Some(redrive) = &self.redrive {
            for message in dead_lettered {
                info!(
                    queue = %self.name,
                    dead_letter_queue = %redrive.dead_letter.name,
                    message_id = %message.id,
                    receive_count = message.receive_count,
                    "Moving message to dead-letter queue"
                );
                let mut attributes = message.attributes;
                attributes.insert(ATTR_RECEIVE_COUNT.to_string(), message.receive_count.to_string());
                redrive.dead_letter.enqueue(message.body, attributes);
            }
        }

        received
    }
}

#[async_trait]
impl NotificationQueue for InMemoryQueue {
    async fn publish(&self, job: &NotificationJob) -> Result<MessageId, QueueError> {
        let body = job.to_body().map_err(|e| QueueError::Encoding(e.to_string()))?;
        let id = self.enqueue(body, HashMap::new());
        debug!(queue = %self.name, message_id = %id, "Published notification job");
        Ok(id)
    }
}

#[async_trait]
impl QueueConsumer for InMemoryQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let received = self.take_visible(max_messages.max(1));
            if !received.is_empty() {
                return Ok(received);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let slice = (deadline - now).min(POLL_SLICE);
            let _ = tokio::time::timeout(slice, notified).await;
        }
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut messages = self.messages.lock();
        let position = messages
            .iter()
            .position(|m| m.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| QueueError::InvalidReceipt(receipt.0.clone()))?;
        messages.remove(position);
        Ok(())
    }

    async fn report_failure(&self, receipt: &ReceiptHandle, error: &str) -> Result<(), QueueError> {
        let mut messages = self.messages.lock();
        let message = messages
            .iter_mut()
            .find(|m| m.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| QueueError::InvalidReceipt(receipt.0.clone()))?;
        message
            .attributes
            .insert(ATTR_ERROR_MESSAGE.to_string(), error.to_string());
        Ok(())
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::application::{ApplicationKey, UserId};

    fn job() -> NotificationJob {
        NotificationJob::for_application(&ApplicationKey::new(UserId::from("u1"), "APPLICATION#t#b#a#e"))
    }

    #[tokio::test]
    async fn test_unacknowledged_message_reappears_after_visibility_timeout() {
        let queue = InMemoryQueue::new("q").with_visibility_timeout(Duration::from_millis(30));
        queue.publish(&job()).await.unwrap();

        let first = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.receive(1, Duration::ZERO).await.unwrap().is_empty());

        let again = queue.receive(1, Duration::from_millis(500)).await.unwrap();
        assert_eq!(again[0].receive_count, 2);
        assert_eq!(again[0].delivery_attempts(), Some(2));

        // The first receipt is stale now
        assert!(queue.acknowledge(&first[0].receipt).await.is_err());
        queue.acknowledge(&again[0].receipt).await.unwrap();
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_redrive_after_max_receive_count() {
        let dlq = Arc::new(InMemoryQueue::new("dlq"));
        let queue = InMemoryQueue::new("q")
            .with_visibility_timeout(Duration::ZERO)
            .with_dead_letter_queue(dlq.clone(), 3);
        queue.publish(&job()).await.unwrap();

        for attempt in 1..=3 {
            let received = queue.receive(1, Duration::ZERO).await.unwrap();
            assert_eq!(received[0].receive_count, attempt);
            queue.report_failure(&received[0].receipt, "smtp timeout").await.unwrap();
        }

        assert!(queue.receive(1, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(queue.depth(), 0);

        let dead = dlq.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].delivery_attempts(), Some(3));
        assert_eq!(dead[0].error_message(), Some("smtp timeout"));
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_publish() {
        let queue = Arc::new(InMemoryQueue::new("q"));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.publish(&job()).await.unwrap();
        });

        let received = queue.receive(1, Duration::from_secs(2)).await.unwrap();
        assert_eq!(received.len(), 1);
    }
}
