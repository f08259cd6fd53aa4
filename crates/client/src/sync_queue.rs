//! Durable FIFO of pending mutations, persisted in the `sync_queue` table.
//!
//! Order is the auto-increment id: independent of wall clocks and of storage
//! iteration order. Operations on the same record are therefore replayed in
//! the order they were made.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use serde_json::Value;
use visitsync_core::{EntityKind, OperationId, RecordId};

use crate::db::Database;
use crate::error::StoreError;

pub use crate::types::{NewOperation, OperationKind, OperationStatus, QueueSummary, SyncOperation};

const TABLE: &str = "sync_queue";

const SELECT_COLUMNS: &str = r#"
    SELECT id, entity, kind, payload, correlation_id, timestamp, status, retries, last_error
    FROM sync_queue
"#;

/// SQLite-backed sync queue.
///
/// This struct is cheap to clone and is safe to share across tasks.
#[derive(Debug, Clone)]
pub struct SyncQueue {
    pool: SqlitePool,
}

impl SyncQueue {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Append an operation. Durable once this returns.
    pub async fn enqueue(&self, op: NewOperation) -> Result<OperationId, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let id = insert_operation(&mut conn, &op).await?;
        tracing::debug!(
            op_id = %id,
            entity = %op.entity,
            kind = op.kind.as_str(),
            correlation_id = %op.correlation_id,
            "operation enqueued"
        );
        Ok(id)
    }

    /// Operations waiting to be replayed, in enqueue order.
    pub async fn list_pending(&self) -> Result<Vec<SyncOperation>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} WHERE status = ?1 ORDER BY id ASC"))
            .bind(OperationStatus::Pending)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_operation).collect()
    }

    /// Every queued operation regardless of status, in enqueue order.
    pub async fn list_all(&self) -> Result<Vec<SyncOperation>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_operation).collect()
    }

    /// Operations referencing one record, in enqueue order.
    pub async fn list_for(&self, correlation: &RecordId) -> Result<Vec<SyncOperation>, StoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE correlation_id = ?1 ORDER BY id ASC"
        ))
        .bind(correlation.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_operation).collect()
    }

    pub async fn get(&self, id: OperationId) -> Result<Option<SyncOperation>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_operation).transpose()
    }

    /// Move an operation to `status`. Entering `failed` counts as one more retry.
    pub async fn mark_status(&self, id: OperationId, status: OperationStatus) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = ?2,
                retries = retries + CASE WHEN ?2 = 'failed' THEN 1 ELSE 0 END
            WHERE id = ?1
            "#,
        )
        .bind(id.get())
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt together with its error message.
    pub async fn mark_failed(&self, id: OperationId, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'failed',
                retries = retries + 1,
                last_error = ?2
            WHERE id = ?1
            "#,
        )
        .bind(id.get())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete an operation. Returns whether it existed.
    pub async fn remove(&self, id: OperationId) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(delete_operation(&mut conn, id).await? > 0)
    }

    /// Move every failed operation back to pending (explicit user retry).
    pub async fn retry_failed(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE sync_queue SET status = 'pending', last_error = NULL WHERE status = 'failed'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Reset operations left in `syncing` by a drain that never finished.
    ///
    /// Only safe while no drain holds the lease.
    pub async fn recover_interrupted(&self) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE sync_queue SET status = 'pending' WHERE status = 'syncing'")
                .execute(&self.pool)
                .await?;
        if result.rows_affected() > 0 {
            tracing::warn!(count = result.rows_affected(), "recovered interrupted operations");
        }
        Ok(result.rows_affected())
    }

    /// Drop every operation of one record except one currently in flight.
    pub async fn purge_correlation(&self, correlation: &RecordId) -> Result<u64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        purge_idle(&mut conn, correlation).await
    }

    /// Whether any operation still references the record.
    pub async fn has_queued(&self, correlation: &RecordId) -> Result<bool, StoreError> {
        Ok(self.latest_for(correlation).await?.is_some())
    }

    pub async fn latest_for(&self, correlation: &RecordId) -> Result<Option<OperationId>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        latest_for(&mut conn, correlation).await
    }

    /// Counts by entity, kind and status.
    pub async fn summary(&self) -> Result<QueueSummary, StoreError> {
        let ops = self.list_all().await?;
        Ok(QueueSummary::from_operations(&ops))
    }

    pub async fn pending_count(&self) -> Result<u64, StoreError> {
        self.count_with(OperationStatus::Pending).await
    }

    pub async fn failed_count(&self) -> Result<u64, StoreError> {
        self.count_with(OperationStatus::Failed).await
    }

    async fn count_with(&self, status: OperationStatus) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE status = ?1")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

pub(crate) async fn insert_operation(
    conn: &mut SqliteConnection,
    op: &NewOperation,
) -> Result<OperationId, StoreError> {
    let payload = op.payload.as_ref().map(|p| p.to_string());
    let result = sqlx::query(
        r#"
        INSERT INTO sync_queue (entity, kind, payload, correlation_id, timestamp, status, retries, last_error)
        VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, NULL)
        "#,
    )
    .bind(op.entity.as_str())
    .bind(op.kind)
    .bind(payload)
    .bind(op.correlation_id.to_string())
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(OperationId::new(result.last_insert_rowid()))
}

pub(crate) async fn delete_operation(
    conn: &mut SqliteConnection,
    id: OperationId,
) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
        .bind(id.get())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn delete_all_for(
    conn: &mut SqliteConnection,
    correlation: &RecordId,
) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM sync_queue WHERE correlation_id = ?1")
        .bind(correlation.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn purge_idle(
    conn: &mut SqliteConnection,
    correlation: &RecordId,
) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM sync_queue WHERE correlation_id = ?1 AND status != 'syncing'")
        .bind(correlation.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Point every queued operation of `from` at `to`.
///
/// Updates held back because their record was still local are released
/// back to `pending`. Other failures wait for an explicit retry.
pub(crate) async fn rewrite_correlation(
    conn: &mut SqliteConnection,
    from: &RecordId,
    to: &RecordId,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE sync_queue
        SET correlation_id = ?2,
            status = CASE WHEN status = 'failed' AND kind = 'update' THEN 'pending' ELSE status END,
            last_error = CASE WHEN status = 'failed' AND kind = 'update' THEN NULL ELSE last_error END
        WHERE correlation_id = ?1
        "#,
    )
    .bind(from.to_string())
    .bind(to.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn latest_for(
    conn: &mut SqliteConnection,
    correlation: &RecordId,
) -> Result<Option<OperationId>, StoreError> {
    let id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM sync_queue WHERE correlation_id = ?1")
        .bind(correlation.to_string())
        .fetch_one(&mut *conn)
        .await?;
    Ok(id.map(OperationId::new))
}

fn row_to_operation(row: &SqliteRow) -> Result<SyncOperation, StoreError> {
    let id: i64 = row.try_get("id")?;
    let entity: String = row.try_get("entity")?;
    let kind: OperationKind = row.try_get("kind")?;
    let payload: Option<String> = row.try_get("payload")?;
    let correlation_id: String = row.try_get("correlation_id")?;
    let timestamp: String = row.try_get("timestamp")?;
    let status: OperationStatus = row.try_get("status")?;
    let retries: i64 = row.try_get("retries")?;
    let last_error: Option<String> = row.try_get("last_error")?;

    let entity: EntityKind = entity
        .parse()
        .map_err(|e| StoreError::corrupt(TABLE, format!("operation {id}: {e}")))?;
    let payload: Option<Value> = payload
        .map(|p| serde_json::from_str(&p))
        .transpose()
        .map_err(|e| StoreError::corrupt(TABLE, format!("operation {id} payload: {e}")))?;
    let correlation_id: RecordId = correlation_id
        .parse()
        .map_err(|e| StoreError::corrupt(TABLE, format!("operation {id}: {e}")))?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| StoreError::corrupt(TABLE, format!("operation {id} timestamp: {e}")))?
        .with_timezone(&Utc);

    Ok(SyncOperation {
        id: OperationId::new(id),
        entity,
        kind,
        payload,
        correlation_id,
        timestamp,
        status,
        retries: retries.max(0) as u32,
        last_error,
    })
}
