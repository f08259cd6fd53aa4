//! Durable drain lease.
//!
//! Two contexts (foreground app and background worker) open separate pools on
//! the same database file and share no memory. The lease row in `sync_lease`
//! is how they agree that only one of them drains the queue at a time.

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::Database;
use crate::error::StoreError;

const DRAIN_LEASE: &str = "drain";

/// One context's handle on the drain lease.
#[derive(Debug, Clone)]
pub struct DrainLease {
    pool: SqlitePool,
    holder: String,
    ttl: Duration,
}

impl DrainLease {
    pub fn new(db: &Database, holder: impl Into<String>, ttl: Duration) -> Self {
        Self {
            pool: db.pool().clone(),
            holder: holder.into(),
            ttl,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Take the lease if it is free, expired, or already ours.
    pub async fn acquire(&self) -> Result<bool, StoreError> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO sync_lease (name, holder, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE
            SET holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE sync_lease.expires_at <= ?4
               OR sync_lease.holder = excluded.holder
            "#,
        )
        .bind(DRAIN_LEASE)
        .bind(&self.holder)
        .bind(now + self.ttl_millis())
        .bind(now)
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        tracing::debug!(holder = %self.holder, acquired, "drain lease acquire");
        Ok(acquired)
    }

    /// Push the expiry forward. `false` means the lease was lost.
    pub async fn renew(&self) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sync_lease SET expires_at = ?3 WHERE name = ?1 AND holder = ?2",
        )
        .bind(DRAIN_LEASE)
        .bind(&self.holder)
        .bind(now_millis() + self.ttl_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_lease WHERE name = ?1 AND holder = ?2")
            .bind(DRAIN_LEASE)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Whether no live lease is held by anyone.
    pub async fn is_free(&self) -> Result<bool, StoreError> {
        let expires_at: Option<i64> =
            sqlx::query_scalar("SELECT expires_at FROM sync_lease WHERE name = ?1")
                .bind(DRAIN_LEASE)
                .fetch_optional(&self.pool)
                .await?;
        Ok(expires_at.is_none_or(|at| at <= now_millis()))
    }

    fn ttl_millis(&self) -> i64 {
        i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX / 2)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
