//! Local persistent store: one SQLite table per entity collection.
//!
//! The store is the read model the UI renders from. Every row carries a
//! nullable `pending_op` naming the queued operation that will confirm it, so
//! reads can tell optimistic values apart from server-confirmed ones.

use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use visitsync_core::{EntityKind, OperationId, Record, RecordId, Tracked};

use crate::db::Database;
use crate::error::StoreError;
use crate::sync_queue::{NewOperation, insert_operation, latest_for, purge_idle};

/// What [`LocalStore::discard_local`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// Neither a row nor an operation existed under the id.
    Missing,
    /// Row and idle operations removed; the server never hears of it.
    Dropped,
    /// The create is in flight; this delete follows it.
    Deferred(OperationId),
}

/// SQLite-backed entity store.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Every record of a collection, in insertion order.
    pub async fn get_all(&self, kind: EntityKind) -> Result<Vec<Tracked<Record>>, StoreError> {
        let table = kind.collection();
        let rows = sqlx::query(&format!(
            "SELECT uuid, data, pending_op FROM {table} ORDER BY rowid ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| row_to_tracked(table, row)).collect()
    }

    pub async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Option<Tracked<Record>>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_row(&mut conn, kind, id).await
    }

    /// Idempotent upsert of a server-confirmed record.
    pub async fn put(&self, kind: EntityKind, record: &Record) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_row(&mut conn, kind, record, None).await
    }

    /// Upsert an optimistic record that `op` will confirm.
    pub async fn put_pending(&self, kind: EntityKind, record: &Record, op: OperationId) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_row(&mut conn, kind, record, Some(op)).await
    }

    /// Remove a record. Returns whether it existed.
    pub async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(delete_row(&mut conn, kind, id).await? > 0)
    }

    /// Upsert many confirmed records, all or nothing.
    pub async fn put_bulk(&self, kind: EntityKind, records: &[Record]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            upsert_row(&mut tx, kind, record, None).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Replace the confirmed contents of a collection with the server list.
    ///
    /// Rows with unsynced local writes survive, and records with a queued
    /// delete are not brought back.
    pub async fn refresh(&self, kind: EntityKind, records: &[Record]) -> Result<(), StoreError> {
        let table = kind.collection();
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DELETE FROM {table} WHERE pending_op IS NULL"))
            .execute(&mut *tx)
            .await?;

        for record in records {
            let (data, created_at, updated_at) = encode(record)?;
            sqlx::query(&format!(
                r#"
                INSERT INTO {table} (uuid, data, pending_op, created_at, updated_at, stored_at)
                SELECT ?1, ?2, NULL, ?3, ?4, ?5
                WHERE NOT EXISTS (
                    SELECT 1 FROM sync_queue
                    WHERE correlation_id = ?1 AND entity = ?6 AND kind = 'delete'
                )
                ON CONFLICT(uuid) DO UPDATE
                SET data = excluded.data,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at,
                    stored_at = excluded.stored_at
                WHERE {table}.pending_op IS NULL
                "#
            ))
            .bind(record.uuid.to_string())
            .bind(data)
            .bind(created_at)
            .bind(updated_at)
            .bind(Utc::now().to_rfc3339())
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(entity = %kind, count = records.len(), "collection refreshed");
        Ok(())
    }

    /// Records with a write that has not reached the server yet.
    pub async fn list_pending_records(&self, kind: EntityKind) -> Result<Vec<Tracked<Record>>, StoreError> {
        let table = kind.collection();
        let rows = sqlx::query(&format!(
            "SELECT uuid, data, pending_op FROM {table} WHERE pending_op IS NOT NULL ORDER BY rowid ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| row_to_tracked(table, row)).collect()
    }

    pub async fn clear(&self, kind: EntityKind) -> Result<(), StoreError> {
        sqlx::query(&format!("DELETE FROM {}", kind.collection()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self, kind: EntityKind) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", kind.collection()))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Write an optimistic record and queue the operation that confirms it,
    /// atomically.
    pub async fn stage_write(
        &self,
        kind: EntityKind,
        record: &Record,
        op: NewOperation,
    ) -> Result<OperationId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let op_id = insert_operation(&mut tx, &op).await?;
        upsert_row(&mut tx, kind, record, Some(op_id)).await?;
        tx.commit().await?;
        Ok(op_id)
    }

    /// Like [`stage_write`](Self::stage_write), but only while the record is
    /// still stored under its id. Returns `None` and queues nothing once the
    /// row is gone, e.g. after reconciliation moved it to its server id.
    pub async fn stage_update(
        &self,
        kind: EntityKind,
        record: &Record,
        op: NewOperation,
    ) -> Result<Option<OperationId>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let op_id = insert_operation(&mut tx, &op).await?;
        if update_row(&mut tx, kind, record, Some(op_id)).await? == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;
        Ok(Some(op_id))
    }

    /// Remove a record locally and queue its remote delete, atomically.
    pub async fn stage_delete(&self, kind: EntityKind, id: &RecordId) -> Result<OperationId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let op_id = insert_operation(&mut tx, &NewOperation::delete(kind, id.clone())).await?;
        delete_row(&mut tx, kind, id).await?;
        tx.commit().await?;
        Ok(op_id)
    }

    /// Forget a record the server has never seen.
    ///
    /// Idle operations of the record are dropped. If its create is in flight
    /// right now, a delete is queued behind it so reconciliation can point it
    /// at the server id.
    pub async fn discard_local(&self, kind: EntityKind, id: &RecordId) -> Result<Discard, StoreError> {
        let mut tx = self.pool.begin().await?;
        let purged = purge_idle(&mut tx, id).await?;
        let removed = delete_row(&mut tx, kind, id).await?;

        let discard = if latest_for(&mut tx, id).await?.is_some() {
            Discard::Deferred(insert_operation(&mut tx, &NewOperation::delete(kind, id.clone())).await?)
        } else if purged + removed > 0 {
            Discard::Dropped
        } else {
            Discard::Missing
        };
        tx.commit().await?;

        if discard == Discard::Missing {
            tracing::debug!(entity = %kind, correlation_id = %id, "nothing stored under temporary id");
        } else {
            tracing::info!(
                entity = %kind,
                correlation_id = %id,
                purged,
                in_flight = matches!(discard, Discard::Deferred(_)),
                "discarded local-only record"
            );
        }
        Ok(discard)
    }
}

fn encode(record: &Record) -> Result<(String, Option<String>, Option<String>), StoreError> {
    let data = serde_json::to_string(&record.to_value())
        .map_err(|e| StoreError::corrupt("record", e.to_string()))?;
    Ok((
        data,
        record.created_at.map(|at| at.to_rfc3339()),
        record.updated_at.map(|at| at.to_rfc3339()),
    ))
}

pub(crate) async fn upsert_row(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    record: &Record,
    pending: Option<OperationId>,
) -> Result<(), StoreError> {
    let table = kind.collection();
    let (data, created_at, updated_at) = encode(record)?;
    sqlx::query(&format!(
        r#"
        INSERT INTO {table} (uuid, data, pending_op, created_at, updated_at, stored_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(uuid) DO UPDATE
        SET data = excluded.data,
            pending_op = excluded.pending_op,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            stored_at = excluded.stored_at
        "#
    ))
    .bind(record.uuid.to_string())
    .bind(data)
    .bind(pending.map(OperationId::get))
    .bind(created_at)
    .bind(updated_at)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn update_row(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    record: &Record,
    pending: Option<OperationId>,
) -> Result<u64, StoreError> {
    let (data, created_at, updated_at) = encode(record)?;
    let result = sqlx::query(&format!(
        r#"
        UPDATE {}
        SET data = ?2, pending_op = ?3, created_at = ?4, updated_at = ?5, stored_at = ?6
        WHERE uuid = ?1
        "#,
        kind.collection()
    ))
    .bind(record.uuid.to_string())
    .bind(data)
    .bind(pending.map(OperationId::get))
    .bind(created_at)
    .bind(updated_at)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn delete_row(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: &RecordId,
) -> Result<u64, StoreError> {
    let result = sqlx::query(&format!("DELETE FROM {} WHERE uuid = ?1", kind.collection()))
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn fetch_row(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: &RecordId,
) -> Result<Option<Tracked<Record>>, StoreError> {
    let table = kind.collection();
    let row = sqlx::query(&format!(
        "SELECT uuid, data, pending_op FROM {table} WHERE uuid = ?1"
    ))
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    row.map(|row| row_to_tracked(table, &row)).transpose()
}

fn row_to_tracked(table: &'static str, row: &SqliteRow) -> Result<Tracked<Record>, StoreError> {
    let uuid: String = row.try_get("uuid")?;
    let data: String = row.try_get("data")?;
    let pending_op: Option<i64> = row.try_get("pending_op")?;

    let value: Value = serde_json::from_str(&data)
        .map_err(|e| StoreError::corrupt(table, format!("{uuid}: {e}")))?;
    let record =
        Record::from_value(value).map_err(|e| StoreError::corrupt(table, format!("{uuid}: {e}")))?;

    Ok(match pending_op {
        Some(op) => Tracked::Pending(record, OperationId::new(op)),
        None => Tracked::Confirmed(record),
    })
}
