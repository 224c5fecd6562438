// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! PostgreSQL Application Store
//!
//! # Schema
//!
//! - `<table>`: one row per application, primary key `(user_id, sk)`,
//!   secondary indexes on `(broker, account_number)` and `(user_id, status)`
//! - `<table>_history`: append-only, `BIGSERIAL` id gives write order and
//!   serves as the pagination cursor; a unique `entry_id` makes a repeated
//!   append a no-op
//! - `<table>` must be the name the migrations create (`ea_applications`)
//!
//! # Conditional Writes
//!
//! Status writes are a single `UPDATE ... WHERE status = $expected RETURNING`.
//! Zero affected rows means the precondition failed (or the row is gone);
//! a follow-up read tells the two apart.
//!
//! # Usage
//!
//! ```no_run
//! # use ea_licensing_core::domain::application::ApplicationKey;
//! # async fn example(database_url: &str, key: ApplicationKey) -> Result<(), Box<dyn std::error::Error>> {
//! use ea_licensing_core::domain::repository::ApplicationStore;
//! use ea_licensing_core::infrastructure::repositories::PostgresApplicationStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect(database_url).await?;
//! let store = PostgresApplicationStore::new(pool, "ea_applications");
//!
//! let application = store.get(&key).await?;
//! # let _ = application;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::application::{Application, ApplicationKey, ApplicationStatus, ContactDetails, UserId};
use crate::domain::history::{HistoryAction, HistoryEntry, HistoryPage, PageRequest};
use crate::domain::repository::{ApplicationFilter, ApplicationStore, RepositoryError, StatusUpdate};

const APPLICATION_COLUMNS: &str = "user_id, sk, status, email, x_account, broker, account_number, ea_name, \
     applied_at, updated_at, last_failed_at, failure_count, last_failure_reason";

pub struct PostgresApplicationStore {
    pool: PgPool,
    table: String,
    history_table: String,
}

impl PostgresApplicationStore {
    /// `table` must be a plain SQL identifier (checked by config validation)
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        let table = table.into();
        let history_table = format!("{}_history", table);
        Self {
            pool,
            table,
            history_table,
        }
    }

    fn parse_status(value: &str) -> Result<ApplicationStatus, RepositoryError> {
        value
            .parse()
            .map_err(|e: crate::domain::application::ApplicationError| {
                RepositoryError::Serialization(e.to_string())
            })
    }

    fn row_to_application(row: &PgRow) -> Result<Application, RepositoryError> {
        let status: String = row.try_get("status")?;
        let failure_count: i32 = row.try_get("failure_count")?;

        Ok(Application {
            key: ApplicationKey::new(UserId::new(row.try_get::<String, _>("user_id")?), row.try_get::<String, _>("sk")?),
            status: Self::parse_status(&status)?,
            contact: ContactDetails {
                email: row.try_get("email")?,
                x_account: row.try_get("x_account")?,
                broker: row.try_get("broker")?,
                account_number: row.try_get("account_number")?,
                ea_name: row.try_get("ea_name")?,
            },
            applied_at: row.try_get("applied_at")?,
            updated_at: row.try_get("updated_at")?,
            last_failed_at: row.try_get("last_failed_at")?,
            failure_count: failure_count.max(0) as u32,
            last_failure_reason: row.try_get("last_failure_reason")?,
        })
    }

    fn row_to_history(row: &PgRow) -> Result<HistoryEntry, RepositoryError> {
        let action: String = row.try_get("action")?;
        let previous: Option<String> = row.try_get("previous_status")?;
        let new_status: String = row.try_get("new_status")?;
        let retry_count: Option<i32> = row.try_get("retry_count")?;

        Ok(HistoryEntry {
            entry_id: row.try_get("entry_id")?,
            key: ApplicationKey::new(UserId::new(row.try_get::<String, _>("user_id")?), row.try_get::<String, _>("sk")?),
            action: action
                .parse::<HistoryAction>()
                .map_err(RepositoryError::Serialization)?,
            changed_by: row.try_get("changed_by")?,
            previous_status: previous.as_deref().map(Self::parse_status).transpose()?,
            new_status: Self::parse_status(&new_status)?,
            reason: row.try_get("reason")?,
            error_details: row.try_get("error_details")?,
            retry_count: retry_count.map(|c| c.max(0) as u32),
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

#[async_trait]
impl ApplicationStore for PostgresApplicationStore {
    async fn get(&self, key: &ApplicationKey) -> Result<Option<Application>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE user_id = $1 AND sk = $2",
            APPLICATION_COLUMNS, self.table
        );
        let row = sqlx::query(&sql)
            .bind(key.user_id.as_str())
            .bind(&key.sort_key)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_application).transpose()
    }

    async fn create(&self, application: &Application) -> Result<(), RepositoryError> {
        let sql = format!(
            r#"
            INSERT INTO {} ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (user_id, sk) DO NOTHING
            "#,
            self.table, APPLICATION_COLUMNS
        );

        let result = sqlx::query(&sql)
            .bind(application.key.user_id.as_str())
            .bind(&application.key.sort_key)
            .bind(application.status.as_str())
            .bind(&application.contact.email)
            .bind(&application.contact.x_account)
            .bind(&application.contact.broker)
            .bind(&application.contact.account_number)
            .bind(&application.contact.ea_name)
            .bind(application.applied_at)
            .bind(application.updated_at)
            .bind(application.last_failed_at)
            .bind(application.failure_count as i32)
            .bind(&application.last_failure_reason)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::ConditionFailed(format!(
                "application {} already exists",
                application.key
            )));
        }
        Ok(())
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<Application, RepositoryError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = $3,
                updated_at = $4,
                failure_count = failure_count + CASE WHEN $5 THEN 1 ELSE 0 END,
                last_failure_reason = COALESCE($6, last_failure_reason),
                last_failed_at = COALESCE($7, last_failed_at)
            WHERE user_id = $1 AND sk = $2 AND status = $8
            RETURNING {}
            "#,
            self.table, APPLICATION_COLUMNS
        );

        let failure = update.failure.as_ref();
        let row = sqlx::query(&sql)
            .bind(update.key.user_id.as_str())
            .bind(&update.key.sort_key)
            .bind(update.new_status.as_str())
            .bind(update.updated_at)
            .bind(failure.is_some())
            .bind(failure.map(|f| f.reason.clone()))
            .bind(failure.map(|f| f.failed_at))
            .bind(update.expected.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::row_to_application(&row),
            None => match self.get(&update.key).await? {
                Some(current) => Err(RepositoryError::ConditionFailed(format!(
                    "expected status {} but found {}",
                    update.expected, current.status
                ))),
                None => Err(RepositoryError::NotFound(update.key.to_string())),
            },
        }
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), RepositoryError> {
        let sql = format!(
            r#"
            INSERT INTO {} (
                entry_id, user_id, sk, action, changed_by, previous_status, new_status,
                reason, error_details, retry_count, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (entry_id) DO NOTHING
            "#,
            self.history_table
        );

        sqlx::query(&sql)
            .bind(entry.entry_id)
            .bind(entry.key.user_id.as_str())
            .bind(&entry.key.sort_key)
            .bind(entry.action.as_str())
            .bind(&entry.changed_by)
            .bind(entry.previous_status.map(|s| s.as_str()))
            .bind(entry.new_status.as_str())
            .bind(&entry.reason)
            .bind(&entry.error_details)
            .bind(entry.retry_count.map(|c| c as i32))
            .bind(entry.recorded_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_history(
        &self,
        key: &ApplicationKey,
        page: &PageRequest,
    ) -> Result<HistoryPage, RepositoryError> {
        let after_id = match page.cursor.as_deref() {
            None => 0,
            Some(c) => c
                .parse::<i64>()
                .map_err(|_| RepositoryError::InvalidCursor(c.to_string()))?,
        };

        let sql = format!(
            r#"
            SELECT id, entry_id, user_id, sk, action, changed_by, previous_status, new_status,
                   reason, error_details, retry_count, recorded_at
            FROM {}
            WHERE user_id = $1 AND sk = $2 AND id > $3
            ORDER BY id ASC
            LIMIT $4
            "#,
            self.history_table
        );

        // One extra row tells us whether another page exists
        let rows = sqlx::query(&sql)
            .bind(key.user_id.as_str())
            .bind(&key.sort_key)
            .bind(after_id)
            .bind(page.limit as i64 + 1)
            .fetch_all(&self.pool)
            .await?;

        let has_more = rows.len() > page.limit;
        let mut entries = Vec::with_capacity(page.limit);
        let mut last_id = None;
        for row in rows.iter().take(page.limit) {
            last_id = Some(row.try_get::<i64, _>("id")?);
            entries.push(Self::row_to_history(row)?);
        }

        Ok(HistoryPage {
            entries,
            next_cursor: if has_more { last_id.map(|id| id.to_string()) } else { None },
        })
    }

    async fn list_applications(
        &self,
        filter: &ApplicationFilter,
    ) -> Result<Vec<Application>, RepositoryError> {
        let sql = format!(
            r#"
            SELECT {} FROM {}
            WHERE ($1::TEXT IS NULL OR user_id = $1)
              AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY applied_at DESC, sk DESC
            "#,
            APPLICATION_COLUMNS, self.table
        );

        let rows = sqlx::query(&sql)
            .bind(filter.user_id.as_ref().map(|u| u.as_str()))
            .bind(filter.status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_application).collect()
    }

    async fn find_by_broker_account(
        &self,
        broker: &str,
        account_number: &str,
    ) -> Result<Vec<Application>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE broker = $1 AND account_number = $2",
            APPLICATION_COLUMNS, self.table
        );

        let rows = sqlx::query(&sql)
            .bind(broker)
            .bind(account_number)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_application).collect()
    }
}
