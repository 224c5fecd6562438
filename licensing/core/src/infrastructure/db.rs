// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Connection Pool
//!
//! Wraps `sqlx::postgres::PgPool` in a thin `Database` newtype that is
//! injected into the PostgreSQL store and queue implementations.
//!
//! Only needed when `spec.store.backend` or `spec.queue.backend` is
//! `postgres`; the in-memory backends never open a connection.

use anyhow::{Context, Result};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Schema migrations shipped with this crate
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await
            .context("Failed to connect to database")?;

        Ok(Self { pool })
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations; returns how many were pending
    pub async fn migrate(&self) -> Result<usize> {
        let pending = self.pending_migrations().await?;
        MIGRATOR
            .run(&self.pool)
            .await
            .context("Failed to apply migrations")?;
        Ok(pending)
    }

    pub async fn pending_migrations(&self) -> Result<usize> {
        // The bookkeeping table does not exist before the first run
        let applied = sqlx::query("SELECT version FROM _sqlx_migrations WHERE success")
            .fetch_all(&self.pool)
            .await
            .map(|rows| rows.len())
            .unwrap_or(0);

        Ok(MIGRATOR.iter().count().saturating_sub(applied))
    }
}
