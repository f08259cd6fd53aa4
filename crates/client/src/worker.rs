//! Background worker: the separate sync context woken by the platform.
//!
//! It shares nothing with the foreground but the database file. It owns its
//! pool, gateway and orchestrator, learns what to do from the queue itself,
//! and reports back over a channel.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::db::Database;
use crate::error::SyncError;
use crate::events::{SyncSummary, new_bus};
use crate::gateway::HttpGateway;
use crate::lease::DrainLease;
use crate::orchestrator::{DrainOutcome, SkipReason, SyncOrchestrator};
use crate::sync_queue::SyncQueue;
use crate::wake::{SYNC_TAG, SyncRequested, WakeReceiver};

/// Report sent from the worker to the foreground.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    Completed(SyncSummary),
    Skipped { reason: SkipReason },
    Failed { message: String },
}

impl From<DrainOutcome> for WorkerMessage {
    fn from(outcome: DrainOutcome) -> Self {
        match outcome {
            DrainOutcome::Completed(summary) => Self::Completed(summary),
            DrainOutcome::Skipped { reason } => Self::Skipped { reason },
            DrainOutcome::Errored { message } => Self::Failed { message },
        }
    }
}

pub struct BackgroundWorker {
    queue: SyncQueue,
    orchestrator: Arc<SyncOrchestrator>,
    notifier: Option<mpsc::UnboundedSender<WorkerMessage>>,
    shutdown: Arc<Notify>,
    poll_interval: Duration,
}

impl core::fmt::Debug for BackgroundWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BackgroundWorker")
            .field("poll_interval", &self.poll_interval)
            .field("notifier", &self.notifier.is_some())
            .finish_non_exhaustive()
    }
}

impl BackgroundWorker {
    /// Build a worker from configuration alone: its own pool, gateway and
    /// orchestrator over the shared database file.
    pub async fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        let db = Database::open(&config.db_path).await?;
        let gateway = HttpGateway::from_config(config)?;
        // The platform only wakes this context once it is online.
        let monitor = ConnectivityMonitor::new(true, config.settle_delay);
        let lease = DrainLease::new(&db, format!("background-{}", Uuid::now_v7()), config.lease_ttl);
        let orchestrator = SyncOrchestrator::new(&db, Arc::new(gateway), monitor, new_bus(), lease);
        Ok(Self::with_parts(SyncQueue::new(&db), Arc::new(orchestrator), config.poll_interval))
    }

    pub fn with_parts(queue: SyncQueue, orchestrator: Arc<SyncOrchestrator>, poll_interval: Duration) -> Self {
        Self {
            queue,
            orchestrator,
            notifier: None,
            shutdown: Arc::new(Notify::new()),
            poll_interval,
        }
    }

    /// Channel the worker reports outcomes on.
    pub fn with_notifier(mut self, notifier: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Notify this handle to stop a started worker.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Handle one wake event. Events for other tags are ignored.
    pub async fn handle(&self, wake: &SyncRequested) -> Option<WorkerMessage> {
        if wake.tag != SYNC_TAG {
            tracing::debug!(tag = %wake.tag, "ignoring wake for unknown tag");
            return None;
        }
        let message = WorkerMessage::from(self.orchestrator.drain().await);
        self.report(message.clone());
        Some(message)
    }

    fn report(&self, message: WorkerMessage) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if notifier.send(message).is_err() {
            tracing::debug!("foreground gone, dropping worker report");
        }
    }

    /// Run until shutdown: handle wakes as they arrive and poll the queue on
    /// a fixed interval as a safety net.
    pub fn start(self, mut wakes: WakeReceiver) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tracing::info!("background worker started");

            let mut poll = tokio::time::interval(self.poll_interval);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        tracing::info!("background worker received shutdown signal");
                        break;
                    }
                    wake = wakes.recv() => {
                        let Some(wake) = wake else {
                            tracing::info!("wake channel closed");
                            break;
                        };
                        self.handle(&wake).await;
                    }
                    _ = poll.tick() => {
                        match self.queue.pending_count().await {
                            Ok(0) => {}
                            Ok(pending) => {
                                tracing::debug!(pending, "pending operations found on poll");
                                self.handle(&SyncRequested::new(SYNC_TAG)).await;
                            }
                            Err(err) => tracing::warn!(%err, "could not read queue on poll"),
                        }
                    }
                }
            }

            tracing::info!("background worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use visitsync_core::{EntityKind, RecordId};

    use crate::gateway::{InMemoryRemote, RemoteMethod};
    use crate::sync_queue::NewOperation;
    use crate::wake::{BackgroundSync, InProcessBackgroundSync};

    fn worker(db: &Database, remote: Arc<InMemoryRemote>, poll: Duration) -> BackgroundWorker {
        let monitor = ConnectivityMonitor::new(true, Duration::from_secs(1));
        let orchestrator = SyncOrchestrator::new(
            db,
            remote,
            monitor,
            new_bus(),
            DrainLease::new(db, "background-test", Duration::from_secs(60)),
        );
        BackgroundWorker::with_parts(SyncQueue::new(db), Arc::new(orchestrator), poll)
    }

    #[tokio::test]
    async fn wake_drains_and_reports_to_foreground() {
        let db = Database::in_memory().await.unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let queue = SyncQueue::new(&db);
        queue
            .enqueue(NewOperation::create(EntityKind::Product, RecordId::temporary(), json!({"name": "Agua"})))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = worker(&db, remote.clone(), Duration::from_secs(30)).with_notifier(tx);

        let message = worker.handle(&SyncRequested::new(SYNC_TAG)).await.unwrap();

        assert!(matches!(message, WorkerMessage::Completed(ref s) if s.synced == 1));
        assert_eq!(rx.recv().await, Some(message));
        assert_eq!(remote.calls_of(RemoteMethod::Create).len(), 1);
    }

    #[tokio::test]
    async fn unknown_tags_are_ignored() {
        let db = Database::in_memory().await.unwrap();
        let worker = worker(&db, Arc::new(InMemoryRemote::new()), Duration::from_secs(30));
        assert_eq!(worker.handle(&SyncRequested::new("photo-upload")).await, None);
    }

    #[tokio::test]
    async fn closed_report_channel_is_ignored() {
        let db = Database::in_memory().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let worker = worker(&db, Arc::new(InMemoryRemote::new()), Duration::from_secs(30)).with_notifier(tx);

        assert!(worker.handle(&SyncRequested::new(SYNC_TAG)).await.is_some());
    }

    #[tokio::test]
    async fn started_worker_serves_wakes_until_shutdown() {
        let db = Database::in_memory().await.unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let queue = SyncQueue::new(&db);
        let (platform, wakes) = InProcessBackgroundSync::channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = worker(&db, remote.clone(), Duration::from_secs(3600)).with_notifier(tx);
        let shutdown = worker.shutdown_handle();
        let handle = worker.start(wakes);

        queue
            .enqueue(NewOperation::create(EntityKind::Store, RecordId::temporary(), json!({"name": "Tienda"})))
            .await
            .unwrap();
        platform.register(SYNC_TAG).await.unwrap();

        let mut synced = 0;
        while synced == 0 {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
                Some(WorkerMessage::Completed(summary)) => synced = summary.synced,
                Some(_) => {}
                None => panic!("worker stopped"),
            }
        }
        assert_eq!(synced, 1);
        assert_eq!(queue.pending_count().await.unwrap(), 0);

        shutdown.notify_one();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn poll_picks_up_work_without_a_wake() {
        let db = Database::in_memory().await.unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let queue = SyncQueue::new(&db);
        queue
            .enqueue(NewOperation::create(EntityKind::Visit, RecordId::temporary(), json!({"photo": "p"})))
            .await
            .unwrap();
        let (_platform, wakes) = InProcessBackgroundSync::channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = worker(&db, remote.clone(), Duration::from_millis(50)).with_notifier(tx);
        let shutdown = worker.shutdown_handle();
        let handle = worker.start(wakes);

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(matches!(message, Some(WorkerMessage::Completed(ref s)) if s.synced == 1));

        shutdown.notify_one();
        handle.await.unwrap();
    }
}
