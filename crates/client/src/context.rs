//! Foreground sync context.
//!
//! Built once at startup and passed around by `Arc`. It wires the database,
//! connectivity monitor, gateway, orchestrator, wake trigger and facade
//! together; nothing in the engine reaches for a global.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::db::Database;
use crate::error::SyncError;
use crate::events::{SyncEvent, SyncEvents, emit, new_bus};
use crate::facade::EntityFacade;
use crate::gateway::{HttpGateway, RemoteGateway};
use crate::lease::DrainLease;
use crate::orchestrator::{SyncOrchestrator, SyncStatus};
use crate::store::LocalStore;
use crate::sync_queue::SyncQueue;
use crate::wake::{BackgroundSync, WakeOutcome, WakeTrigger};
use crate::worker::WorkerMessage;

pub struct SyncContext {
    db: Database,
    gateway: Arc<dyn RemoteGateway>,
    monitor: Arc<ConnectivityMonitor>,
    events: SyncEvents,
    queue: SyncQueue,
    store: LocalStore,
    orchestrator: Arc<SyncOrchestrator>,
    trigger: WakeTrigger,
    facade: EntityFacade,
    shutdown: Arc<Notify>,
}

impl core::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncContext")
            .field("monitor", &self.monitor)
            .field("orchestrator", &self.orchestrator)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

impl SyncContext {
    /// Open the configured database and talk HTTP to the configured API.
    pub async fn open(
        config: &SyncConfig,
        initially_online: bool,
        platform: Option<Arc<dyn BackgroundSync>>,
    ) -> Result<Arc<Self>, SyncError> {
        let db = Database::open(&config.db_path).await?;
        let gateway = Arc::new(HttpGateway::from_config(config)?);
        let monitor = ConnectivityMonitor::new(initially_online, config.settle_delay);
        let context = Self::from_parts(db, gateway, monitor, platform, config.lease_ttl).await?;
        tracing::info!(api_url = %config.api_url, online = initially_online, "sync context ready");
        Ok(Arc::new(context))
    }

    /// Assemble a context from prebuilt parts.
    ///
    /// Operations left `syncing` by a crashed drain go back to `pending`,
    /// unless another context currently holds the drain lease. In that case
    /// the next drain to take the lease requeues them.
    pub async fn from_parts(
        db: Database,
        gateway: Arc<dyn RemoteGateway>,
        monitor: Arc<ConnectivityMonitor>,
        platform: Option<Arc<dyn BackgroundSync>>,
        lease_ttl: Duration,
    ) -> Result<Self, SyncError> {
        let events = new_bus();
        let queue = SyncQueue::new(&db);
        let store = LocalStore::new(&db);
        let lease = DrainLease::new(&db, format!("foreground-{}", Uuid::now_v7()), lease_ttl);

        if lease.is_free().await? {
            let recovered = queue.recover_interrupted().await?;
            if recovered > 0 {
                tracing::warn!(recovered, "requeued operations interrupted mid-sync");
            }
        }

        let orchestrator = Arc::new(SyncOrchestrator::new(
            &db,
            gateway.clone(),
            monitor.clone(),
            events.clone(),
            lease,
        ));
        let trigger = WakeTrigger::new(platform, orchestrator.clone());
        let facade = EntityFacade::new(
            store.clone(),
            queue.clone(),
            gateway.clone(),
            monitor.clone(),
            events.clone(),
        );

        Ok(Self {
            db,
            gateway,
            monitor,
            events,
            queue,
            store,
            orchestrator,
            trigger,
            facade,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn facade(&self) -> &EntityFacade {
        &self.facade
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn events(&self) -> &SyncEvents {
        &self.events
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        self.orchestrator.status().await
    }

    /// Ask for a sync through the wake trigger.
    pub async fn request_sync(&self) -> WakeOutcome {
        self.trigger.request().await
    }

    /// Replace the bearer token, e.g. after re-login.
    pub fn set_token(&self, token: Option<String>) {
        self.gateway.set_token(token);
    }

    /// Start the foreground listener reacting to reconnections and queued
    /// mutations. Stopped by [`SyncContext::shutdown`].
    pub fn start_listener(&self) -> JoinHandle<()> {
        self.trigger
            .clone()
            .spawn_listener(self.monitor.clone(), self.queue.clone(), &self.events, self.shutdown.clone())
    }

    /// Re-publish background worker reports on this context's bus.
    pub fn relay_worker_messages(&self, mut messages: mpsc::UnboundedReceiver<WorkerMessage>) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                match message {
                    WorkerMessage::Completed(summary) => emit(&events, SyncEvent::Completed(summary)),
                    WorkerMessage::Failed { message } => emit(&events, SyncEvent::Error { message }),
                    WorkerMessage::Skipped { reason } => {
                        tracing::debug!(?reason, "background drain skipped");
                    }
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        self.db.close().await;
        tracing::info!("sync context closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use visitsync_core::{EntityKind, RecordId};
    use visitsync_events::EventBus;

    use crate::events::SyncSummary;
    use crate::gateway::InMemoryRemote;
    use crate::orchestrator::DrainOutcome;
    use crate::sync_queue::{NewOperation, OperationStatus};

    async fn context(db: Database, remote: Arc<InMemoryRemote>, online: bool) -> SyncContext {
        let monitor = ConnectivityMonitor::new(online, Duration::from_millis(20));
        SyncContext::from_parts(db, remote, monitor, None, Duration::from_secs(60))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn interrupted_operations_are_requeued_on_startup() {
        let db = Database::in_memory().await.unwrap();
        let queue = SyncQueue::new(&db);
        let op = queue
            .enqueue(NewOperation::create(EntityKind::Store, RecordId::temporary(), json!({})))
            .await
            .unwrap();
        queue.mark_status(op, OperationStatus::Syncing).await.unwrap();

        let ctx = context(db, Arc::new(InMemoryRemote::new()), false).await;

        assert_eq!(ctx.queue().get(op).await.unwrap().unwrap().status, OperationStatus::Pending);
    }

    #[tokio::test]
    async fn live_drain_elsewhere_keeps_its_operations() {
        let db = Database::in_memory().await.unwrap();
        let queue = SyncQueue::new(&db);
        let op = queue
            .enqueue(NewOperation::create(EntityKind::Store, RecordId::temporary(), json!({})))
            .await
            .unwrap();
        queue.mark_status(op, OperationStatus::Syncing).await.unwrap();
        let other = DrainLease::new(&db, "background-other", Duration::from_secs(60));
        assert!(other.acquire().await.unwrap());

        let ctx = context(db, Arc::new(InMemoryRemote::new()), false).await;

        assert_eq!(ctx.queue().get(op).await.unwrap().unwrap().status, OperationStatus::Syncing);
    }

    #[tokio::test]
    async fn restart_under_a_dead_holders_lease_replays_after_expiry() {
        let db = Database::in_memory().await.unwrap();
        let queue = SyncQueue::new(&db);
        let op = queue
            .enqueue(NewOperation::create(EntityKind::Store, RecordId::temporary(), json!({"name": "Tienda"})))
            .await
            .unwrap();
        queue.mark_status(op, OperationStatus::Syncing).await.unwrap();
        let dead = DrainLease::new(&db, "foreground-dead", Duration::from_millis(150));
        assert!(dead.acquire().await.unwrap());

        let remote = Arc::new(InMemoryRemote::new());
        let ctx = context(db, remote.clone(), true).await;
        assert_eq!(ctx.queue().get(op).await.unwrap().unwrap().status, OperationStatus::Syncing);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let DrainOutcome::Completed(summary) = ctx.orchestrator().drain().await else {
            panic!("drain did not run");
        };

        assert_eq!(summary.synced, 1);
        assert_eq!(remote.records(EntityKind::Store).len(), 1);
        assert!(ctx.queue().list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_writes_sync_after_reconnection() {
        let db = Database::in_memory().await.unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let ctx = context(db, remote.clone(), false).await;
        let sub = ctx.events().subscribe();
        let listener = ctx.start_listener();

        ctx.facade()
            .create(EntityKind::Product, json!({"name": "Agua 1L", "basePrice": 12}))
            .await
            .unwrap();
        ctx.monitor().set_online(true);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let summary = loop {
            if let Ok(SyncEvent::Completed(summary)) = sub.try_recv() {
                break summary;
            }
            assert!(tokio::time::Instant::now() < deadline, "no drain after reconnection");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        assert_eq!(summary.synced, 1);
        assert_eq!(remote.records(EntityKind::Product).len(), 1);
        assert_eq!(ctx.status().await.unwrap().pending, 0);

        ctx.shutdown().await;
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn worker_reports_are_republished() {
        let db = Database::in_memory().await.unwrap();
        let ctx = context(db, Arc::new(InMemoryRemote::new()), true).await;
        let sub = ctx.events().subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = ctx.relay_worker_messages(rx);

        tx.send(WorkerMessage::Completed(SyncSummary { total: 1, synced: 1, ..SyncSummary::default() }))
            .unwrap();
        tx.send(WorkerMessage::Failed { message: "disk full".into() }).unwrap();
        drop(tx);
        relay.await.unwrap();

        assert!(matches!(sub.try_recv().unwrap(), SyncEvent::Completed(s) if s.synced == 1));
        assert_eq!(sub.try_recv().unwrap(), SyncEvent::Error { message: "disk full".into() });
    }

    #[tokio::test]
    async fn request_sync_without_platform_drains_here() {
        let db = Database::in_memory().await.unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let ctx = context(db, remote.clone(), false).await;
        ctx.facade().create(EntityKind::Store, json!({"name": "Tienda"})).await.unwrap();

        ctx.monitor().set_online(true);
        assert!(matches!(ctx.request_sync().await, WakeOutcome::Drained(_)));
        assert_eq!(remote.records(EntityKind::Store).len(), 1);
    }
}
