//! Identifier reconciler.
//!
//! When the server acknowledges a record created offline, the temporary
//! identifier has to disappear everywhere at once: the record row, and the
//! correlation of every queued operation that still refers to it. Each entry
//! point below runs as one SQLite transaction, so a crash leaves either the
//! old state or the new one.

use sqlx::SqlitePool;
use visitsync_core::{EntityKind, OperationId, Record, RecordId, TempId};

use crate::db::Database;
use crate::error::SyncError;
use crate::store::{delete_row, fetch_row, upsert_row};
use crate::sync_queue::{delete_all_for, delete_operation, latest_for, rewrite_correlation};

#[derive(Debug, Clone)]
pub struct Reconciler {
    pool: SqlitePool,
}

impl Reconciler {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Replace the record stored under `temp` with the server's echo and
    /// repoint queued operations at the server id.
    ///
    /// Replaying with the same arguments leaves the same state.
    pub async fn reconcile(
        &self,
        kind: EntityKind,
        temp: &TempId,
        server_record: &Record,
    ) -> Result<Record, SyncError> {
        self.settle(kind, None, &RecordId::Temporary(*temp), server_record)
            .await
    }

    /// Apply a server acknowledgement of `op`: drop the operation, store the
    /// echo, and reconcile `from` if it was still a temporary id.
    pub async fn confirm(
        &self,
        kind: EntityKind,
        op: OperationId,
        from: &RecordId,
        server_record: &Record,
    ) -> Result<Record, SyncError> {
        self.settle(kind, Some(op), from, server_record).await
    }

    /// The server no longer knows the record: drop it and the acknowledged operation.
    pub async fn retire(&self, kind: EntityKind, op: OperationId, id: &RecordId) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await?;
        delete_operation(&mut tx, op).await?;
        delete_row(&mut tx, kind, id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Forget a record that never reached the server, with every operation
    /// still queued for it.
    pub async fn abandon(&self, kind: EntityKind, id: &RecordId) -> Result<u64, SyncError> {
        let mut tx = self.pool.begin().await?;
        let dropped = delete_all_for(&mut tx, id).await?;
        delete_row(&mut tx, kind, id).await?;
        tx.commit().await?;
        tracing::info!(entity = %kind, correlation_id = %id, dropped, "abandoned local-only record");
        Ok(dropped)
    }

    async fn settle(
        &self,
        kind: EntityKind,
        op: Option<OperationId>,
        from: &RecordId,
        server_record: &Record,
    ) -> Result<Record, SyncError> {
        let Some(server_id) = server_record.uuid.as_server() else {
            return Err(SyncError::InvalidResponse(format!(
                "server echo carries temporary id {}",
                server_record.uuid
            )));
        };
        let to = RecordId::Confirmed(server_id.clone());

        let mut tx = self.pool.begin().await?;

        // First statements write, so the transaction holds the write lock
        // before it reads anything.
        if let Some(op) = op {
            delete_operation(&mut tx, op).await?;
        }
        let rewritten = if *from != to {
            rewrite_correlation(&mut tx, from, &to).await?
        } else {
            0
        };

        let local = match fetch_row(&mut tx, kind, from).await? {
            Some(row) => Some(row.into_inner()),
            None if *from != to => fetch_row(&mut tx, kind, &to).await?.map(|t| t.into_inner()),
            None => None,
        };
        if *from != to {
            delete_row(&mut tx, kind, from).await?;
        }

        let stored = match (latest_for(&mut tx, &to).await?, &local) {
            (Some(next), Some(local)) => {
                let merged = server_record.overlaid_with(local);
                upsert_row(&mut tx, kind, &merged, Some(next)).await?;
                merged
            }
            // Deleted locally; the queued delete follows.
            (Some(_), None) => server_record.clone(),
            (None, _) => {
                upsert_row(&mut tx, kind, server_record, None).await?;
                server_record.clone()
            }
        };

        tx.commit().await?;

        tracing::debug!(
            entity = %kind,
            from = %from,
            to = %to,
            rewritten,
            "record reconciled"
        );
        Ok(stored)
    }
}
