//! Sync orchestrator: replays the queue against the remote API.
//!
//! A drain runs only while online and only in one place at a time: an
//! in-process flag guards against re-entry, and the durable lease guards
//! against the other context working on the same database file.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde_json::{Map, Value};
use visitsync_core::{OperationId, Record, RecordId};

use crate::connectivity::ConnectivityMonitor;
use crate::db::Database;
use crate::error::SyncError;
use crate::events::{OperationFailure, SyncEvent, SyncEvents, SyncSummary, emit};
use crate::gateway::{GatewayError, RemoteGateway};
use crate::lease::DrainLease;
use crate::reconciler::Reconciler;
use crate::store::LocalStore;
use crate::sync_queue::{OperationKind, OperationStatus, SyncOperation, SyncQueue};

/// Why a drain request did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    Offline,
    AlreadyDraining,
    LeaseHeld,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum DrainOutcome {
    Completed(SyncSummary),
    Skipped { reason: SkipReason },
    /// Storage failed before any operation could be attempted.
    Errored { message: String },
}

/// Snapshot for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub is_online: bool,
    pub pending: u64,
    pub failed: u64,
}

pub struct SyncOrchestrator {
    queue: SyncQueue,
    store: LocalStore,
    reconciler: Reconciler,
    lease: DrainLease,
    gateway: Arc<dyn RemoteGateway>,
    monitor: Arc<ConnectivityMonitor>,
    events: SyncEvents,
    draining: AtomicBool,
}

impl core::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("holder", &self.lease.holder())
            .field("draining", &self.is_draining())
            .finish_non_exhaustive()
    }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Step {
    Synced,
    Failed(SyncError),
}

impl SyncOrchestrator {
    pub fn new(
        db: &Database,
        gateway: Arc<dyn RemoteGateway>,
        monitor: Arc<ConnectivityMonitor>,
        events: SyncEvents,
        lease: DrainLease,
    ) -> Self {
        Self {
            queue: SyncQueue::new(db),
            store: LocalStore::new(db),
            reconciler: Reconciler::new(db),
            lease,
            gateway,
            monitor,
            events,
            draining: AtomicBool::new(false),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        Ok(SyncStatus {
            is_syncing: self.is_draining(),
            is_online: self.monitor.is_online(),
            pending: self.queue.pending_count().await?,
            failed: self.queue.failed_count().await?,
        })
    }

    /// Explicit user retry: failed operations go back to pending, then drain.
    pub async fn retry_failed(&self) -> DrainOutcome {
        match self.queue.retry_failed().await {
            Ok(count) => tracing::info!(count, "failed operations reset for retry"),
            Err(err) => return self.errored(err.into()),
        }
        self.drain().await
    }

    /// Replay pending operations in enqueue order. Never returns an error:
    /// failures end up in the summary or in an `Errored` outcome.
    pub async fn drain(&self) -> DrainOutcome {
        if !self.monitor.is_online() {
            return DrainOutcome::Skipped { reason: SkipReason::Offline };
        }
        if self.draining.swap(true, Ordering::SeqCst) {
            tracing::debug!("drain already in progress");
            return DrainOutcome::Skipped { reason: SkipReason::AlreadyDraining };
        }
        let _guard = DrainGuard(&self.draining);

        match self.lease.acquire().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(holder = self.lease.holder(), "drain lease held elsewhere");
                return DrainOutcome::Skipped { reason: SkipReason::LeaseHeld };
            }
            Err(err) => return self.errored(err.into()),
        }

        // Holding the lease means nothing else is in flight: anything still
        // `syncing` belongs to a drain that died.
        let outcome = match self.queue.recover_interrupted().await {
            Ok(_) => self.run().await,
            Err(err) => self.errored(err.into()),
        };

        if let Err(err) = self.lease.release().await {
            tracing::warn!(%err, "failed to release drain lease");
        }
        outcome
    }

    async fn run(&self) -> DrainOutcome {
        let mut attempted: HashSet<OperationId> = HashSet::new();
        let mut summary = SyncSummary::default();
        let mut first = true;

        emit(&self.events, SyncEvent::Started);

        'drain: loop {
            let batch: Vec<OperationId> = match self.queue.list_pending().await {
                Ok(ops) => ops
                    .into_iter()
                    .map(|op| op.id)
                    .filter(|id| !attempted.contains(id))
                    .collect(),
                Err(err) if first => return self.errored(err.into()),
                Err(err) => {
                    self.report_storage_failure(&mut summary, err.into());
                    break;
                }
            };
            if first {
                first = false;
                tracing::info!(pending = batch.len(), holder = self.lease.holder(), "drain started");
            }
            if batch.is_empty() {
                break;
            }

            for id in batch {
                attempted.insert(id);

                if !self.monitor.is_online() {
                    tracing::info!("connectivity lost, aborting drain");
                    summary.aborted = true;
                    break 'drain;
                }

                // Re-read: reconciliation may have rewritten or removed it.
                let op = match self.queue.get(id).await {
                    Ok(Some(op)) if op.status == OperationStatus::Pending => op,
                    Ok(_) => continue,
                    Err(err) => {
                        self.report_storage_failure(&mut summary, err.into());
                        break 'drain;
                    }
                };

                match self.lease.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(holder = self.lease.holder(), "drain lease lost");
                        summary.aborted = true;
                        break 'drain;
                    }
                    Err(err) => {
                        self.report_storage_failure(&mut summary, err.into());
                        break 'drain;
                    }
                }

                if let Err(err) = self.queue.mark_status(op.id, OperationStatus::Syncing).await {
                    self.report_storage_failure(&mut summary, err.into());
                    break 'drain;
                }

                summary.total += 1;
                match self.apply(&op).await {
                    Step::Synced => {
                        summary.synced += 1;
                        tracing::debug!(op_id = %op.id, entity = %op.entity, kind = op.kind.as_str(), "operation synced");
                    }
                    Step::Failed(err) => {
                        summary.failed += 1;
                        tracing::warn!(
                            op_id = %op.id,
                            entity = %op.entity,
                            kind = op.kind.as_str(),
                            correlation_id = %op.correlation_id,
                            %err,
                            "operation failed"
                        );
                        if let Err(store_err) = self.queue.mark_failed(op.id, &err.to_string()).await {
                            tracing::error!(%store_err, op_id = %op.id, "could not record failure");
                        }
                        summary.errors.push(failure(&op, &err));
                    }
                }
            }
        }

        tracing::info!(
            total = summary.total,
            synced = summary.synced,
            failed = summary.failed,
            aborted = summary.aborted,
            "drain finished"
        );
        emit(&self.events, SyncEvent::Completed(summary.clone()));
        DrainOutcome::Completed(summary)
    }

    async fn apply(&self, op: &SyncOperation) -> Step {
        let result = match op.kind {
            OperationKind::Create => self.apply_create(op).await,
            OperationKind::Update => self.apply_update(op).await,
            OperationKind::Delete => self.apply_delete(op).await,
        };
        match result {
            Ok(()) => Step::Synced,
            Err(err) => Step::Failed(err),
        }
    }

    async fn apply_create(&self, op: &SyncOperation) -> Result<(), SyncError> {
        let record = self.gateway.create(op.entity, &payload(op)).await?;
        self.reconciler
            .confirm(op.entity, op.id, &op.correlation_id, &record)
            .await?;
        Ok(())
    }

    async fn apply_update(&self, op: &SyncOperation) -> Result<(), SyncError> {
        let Some(server_id) = op.correlation_id.as_server() else {
            return Err(SyncError::Unconfirmed(op.correlation_id.clone()));
        };

        match self.gateway.update(op.entity, server_id, &payload(op)).await {
            Ok(Some(record)) => {
                self.reconciler
                    .confirm(op.entity, op.id, &op.correlation_id, &record)
                    .await?;
            }
            Ok(None) => {
                let record = self.local_echo(op).await?;
                self.reconciler
                    .confirm(op.entity, op.id, &op.correlation_id, &record)
                    .await?;
            }
            Err(GatewayError::NotFound(what)) => {
                tracing::warn!(op_id = %op.id, %what, "updated record is gone on the server, dropping it locally");
                self.reconciler.retire(op.entity, op.id, &op.correlation_id).await?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    async fn apply_delete(&self, op: &SyncOperation) -> Result<(), SyncError> {
        let server_id = match &op.correlation_id {
            RecordId::Temporary(_) => {
                self.reconciler.abandon(op.entity, &op.correlation_id).await?;
                return Ok(());
            }
            RecordId::Confirmed(id) => id,
        };

        match self.gateway.delete(op.entity, server_id).await {
            Ok(()) => {}
            Err(GatewayError::NotFound(_)) => {
                tracing::debug!(op_id = %op.id, "record already deleted on the server");
            }
            Err(err) => return Err(err.into()),
        }
        self.reconciler.retire(op.entity, op.id, &op.correlation_id).await?;
        Ok(())
    }

    /// The record as we hold it, for servers that answer an update without a body.
    async fn local_echo(&self, op: &SyncOperation) -> Result<Record, SyncError> {
        if let Some(tracked) = self.store.get(op.entity, &op.correlation_id).await? {
            return Ok(tracked.into_inner());
        }
        let fields = payload(op).as_object().cloned().unwrap_or_default();
        Ok(Record::local(op.correlation_id.clone(), &fields, op.timestamp))
    }

    fn report_storage_failure(&self, summary: &mut SyncSummary, err: SyncError) {
        tracing::error!(%err, "storage failure during drain");
        summary.aborted = true;
        emit(&self.events, SyncEvent::Error { message: err.to_string() });
    }

    fn errored(&self, err: SyncError) -> DrainOutcome {
        tracing::error!(%err, "drain could not start");
        let message = err.to_string();
        emit(&self.events, SyncEvent::Error { message: message.clone() });
        DrainOutcome::Errored { message }
    }
}

fn payload(op: &SyncOperation) -> Value {
    op.payload.clone().unwrap_or_else(|| Value::Object(Map::new()))
}

fn failure(op: &SyncOperation, err: &SyncError) -> OperationFailure {
    OperationFailure {
        op_id: op.id,
        entity: op.entity,
        kind: op.kind,
        correlation_id: op.correlation_id.to_string(),
        message: err.to_string(),
    }
}
