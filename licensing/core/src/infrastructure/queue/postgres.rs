// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Notification Queue
//!
//! Durable broker over the `notification_messages` table. Several logical
//! queues share the table, distinguished by `queue_name`.
//!
//! - **Receive:** `FOR UPDATE SKIP LOCKED` leases visible rows, bumps
//!   `receive_count`, pushes `visible_at` out by the visibility timeout and
//!   issues a fresh receipt handle.
//! - **Acknowledge:** deletes the row by receipt handle.
//! - **Redrive:** before leasing, rows that already reached
//!   `max_receive_count` are moved to the dead-letter queue with their
//!   delivery count recorded as `ApproximateReceiveCount`.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::notification::NotificationJob;
use crate::domain::queue::{
    MessageId, NotificationQueue, QueueConsumer, QueueError, ReceiptHandle, ReceivedMessage,
    ATTR_ERROR_MESSAGE, ATTR_RECEIVE_COUNT,
};

#[derive(Debug, Clone)]
struct Redrive {
    dead_letter_queue: String,
    max_receive_count: u32,
}

pub struct PostgresQueue {
    pool: PgPool,
    name: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
    redrive: Option<Redrive>,
}

impl PostgresQueue {
    pub fn new(pool: PgPool, name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            name: name.into(),
            visibility_timeout,
            poll_interval: Duration::from_millis(500),
            redrive: None,
        }
    }

    pub fn with_dead_letter_queue(mut self, dead_letter_queue: impl Into<String>, max_receive_count: u32) -> Self {
        self.redrive = Some(Redrive {
            dead_letter_queue: dead_letter_queue.into(),
            max_receive_count: max_receive_count.max(1),
        });
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn redrive_exhausted(&self, tx: &mut sqlx::PgConnection) -> Result<u64, QueueError> {
        let Some(redrive) = &self.redrive else {
            return Ok(0);
        };

        let moved = sqlx::query(
            r#"
            UPDATE notification_messages
            SET queue_name = $2,
                attributes = attributes || jsonb_build_object($4::TEXT, receive_count::TEXT),
                receive_count = 0,
                receipt_handle = NULL,
                visible_at = NOW()
            WHERE id IN (
                SELECT id FROM notification_messages
                WHERE queue_name = $1 AND visible_at <= NOW() AND receive_count >= $3
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(&self.name)
        .bind(&redrive.dead_letter_queue)
        .bind(redrive.max_receive_count as i32)
        .bind(ATTR_RECEIVE_COUNT)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if moved > 0 {
            info!(
                queue = %self.name,
                dead_letter_queue = %redrive.dead_letter_queue,
                moved,
                "Moved exhausted messages to dead-letter queue"
            );
        }
        Ok(moved)
    }

    async fn lease(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut tx = self.pool.begin().await?;
        self.redrive_exhausted(&mut tx).await?;

        let rows = sqlx::query(
            r#"
            WITH picked AS (
                SELECT id FROM notification_messages
                WHERE queue_name = $1 AND visible_at <= NOW()
                ORDER BY enqueued_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE notification_messages m
            SET receive_count = m.receive_count + 1,
                visible_at = NOW() + make_interval(secs => $3),
                receipt_handle = gen_random_uuid()
            FROM picked
            WHERE m.id = picked.id
            RETURNING m.id, m.body, m.attributes, m.receive_count, m.receipt_handle
            "#,
        )
        .bind(&self.name)
        .bind(max_messages as i64)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        rows.iter()
            .map(|row| -> Result<ReceivedMessage, QueueError> {
                let id: Uuid = row.try_get("id")?;
                let receipt: Uuid = row.try_get("receipt_handle")?;
                let receive_count: i32 = row.try_get("receive_count")?;
                let raw: serde_json::Value = row.try_get("attributes")?;

                let mut attributes = json_attributes(raw);
                attributes
                    .entry(ATTR_RECEIVE_COUNT.to_string())
                    .or_insert_with(|| receive_count.to_string());

                Ok(ReceivedMessage {
                    message_id: MessageId(id.to_string()),
                    receipt: ReceiptHandle(receipt.to_string()),
                    body: row.try_get("body")?,
                    attributes,
                    receive_count: receive_count.max(0) as u32,
                })
            })
            .collect()
    }

    fn parse_receipt(receipt: &ReceiptHandle) -> Result<Uuid, QueueError> {
        Uuid::parse_str(&receipt.0).map_err(|_| QueueError::InvalidReceipt(receipt.0.clone()))
    }
}

fn json_attributes(value: serde_json::Value) -> HashMap<String, String> {
    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect(),
        _ => HashMap::new(),
    }
}

#[async_trait]
impl NotificationQueue for PostgresQueue {
    async fn publish(&self, job: &NotificationJob) -> Result<MessageId, QueueError> {
        let body = job.to_body().map_err(|e| QueueError::Encoding(e.to_string()))?;
        let id = Uuid::new_v4();

        sqlx::query("INSERT INTO notification_messages (id, queue_name, body) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(&self.name)
            .bind(body)
            .execute(&self.pool)
            .await?;

        debug!(queue = %self.name, message_id = %id, "Published notification job");
        Ok(MessageId(id.to_string()))
    }
}

#[async_trait]
impl QueueConsumer for PostgresQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let received = self.lease(max_messages.max(1)).await?;
            if !received.is_empty() {
                return Ok(received);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(received);
            }
            tokio::time::sleep((deadline - now).min(self.poll_interval)).await;
        }
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let handle = Self::parse_receipt(receipt)?;
        let deleted = sqlx::query("DELETE FROM notification_messages WHERE receipt_handle = $1 AND queue_name = $2")
            .bind(handle)
            .bind(&self.name)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if deleted == 0 {
            return Err(QueueError::InvalidReceipt(receipt.0.clone()));
        }
        Ok(())
    }

    async fn report_failure(&self, receipt: &ReceiptHandle, error: &str) -> Result<(), QueueError> {
        let handle = Self::parse_receipt(receipt)?;
        let updated = sqlx::query(
            r#"
            UPDATE notification_messages
            SET attributes = attributes || jsonb_build_object($3::TEXT, $2::TEXT)
            WHERE receipt_handle = $1
            "#,
        )
        .bind(handle)
        .bind(error)
        .bind(ATTR_ERROR_MESSAGE)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(QueueError::InvalidReceipt(receipt.0.clone()));
        }
        Ok(())
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}
