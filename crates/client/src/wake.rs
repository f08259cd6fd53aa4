//! Background wake trigger.
//!
//! The foreground asks for a sync by registering a tag with the platform's
//! background-sync facility. The platform later wakes the background worker
//! with a [`SyncRequested`] event carrying only that tag. Without a platform
//! facility the foreground drains itself.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use visitsync_events::EventBus;

use crate::connectivity::ConnectivityMonitor;
use crate::events::{SyncEvent, SyncEvents};
use crate::orchestrator::{DrainOutcome, SyncOrchestrator};
use crate::sync_queue::SyncQueue;

/// Tag registered for queue replay.
pub const SYNC_TAG: &str = "offline-sync";

const LISTENER_TICK: Duration = Duration::from_millis(250);

/// Wake event delivered to the background context. Carries no payload: the
/// worker discovers pending work from the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequested {
    pub tag: String,
}

impl SyncRequested {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WakeError {
    #[error("background sync unavailable: {0}")]
    Unavailable(String),
}

/// Platform background-sync facility.
#[async_trait]
pub trait BackgroundSync: Send + Sync {
    /// Ask the platform to wake the background context for `tag`. Registering
    /// a tag that is already outstanding is a no-op.
    async fn register(&self, tag: &str) -> Result<(), WakeError>;
}

type Outstanding = Arc<Mutex<HashSet<String>>>;

fn lock(outstanding: &Outstanding) -> MutexGuard<'_, HashSet<String>> {
    outstanding.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process stand-in for the platform facility: wakes travel over a channel
/// to a [`WakeReceiver`] owned by the background worker.
#[derive(Debug)]
pub struct InProcessBackgroundSync {
    sender: mpsc::UnboundedSender<SyncRequested>,
    outstanding: Outstanding,
}

impl InProcessBackgroundSync {
    pub fn channel() -> (Arc<Self>, WakeReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let outstanding = Outstanding::default();
        let platform = Arc::new(Self {
            sender,
            outstanding: outstanding.clone(),
        });
        (platform, WakeReceiver { receiver, outstanding })
    }
}

#[async_trait]
impl BackgroundSync for InProcessBackgroundSync {
    async fn register(&self, tag: &str) -> Result<(), WakeError> {
        if !lock(&self.outstanding).insert(tag.to_string()) {
            tracing::debug!(tag, "background sync already registered");
            return Ok(());
        }
        if self.sender.send(SyncRequested::new(tag)).is_err() {
            lock(&self.outstanding).remove(tag);
            return Err(WakeError::Unavailable("background worker stopped".into()));
        }
        tracing::debug!(tag, "background sync registered");
        Ok(())
    }
}

/// Receiving half of [`InProcessBackgroundSync`].
#[derive(Debug)]
pub struct WakeReceiver {
    receiver: mpsc::UnboundedReceiver<SyncRequested>,
    outstanding: Outstanding,
}

impl WakeReceiver {
    /// Next wake. Once delivered, the tag may be registered again.
    pub async fn recv(&mut self) -> Option<SyncRequested> {
        let wake = self.receiver.recv().await?;
        lock(&self.outstanding).remove(&wake.tag);
        Some(wake)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WakeOutcome {
    /// Handed to the background context.
    Registered,
    /// Drained in the foreground.
    Drained(DrainOutcome),
}

#[derive(Clone)]
pub struct WakeTrigger {
    platform: Option<Arc<dyn BackgroundSync>>,
    orchestrator: Arc<SyncOrchestrator>,
}

impl core::fmt::Debug for WakeTrigger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WakeTrigger")
            .field("platform", &self.platform.is_some())
            .finish_non_exhaustive()
    }
}

impl WakeTrigger {
    pub fn new(platform: Option<Arc<dyn BackgroundSync>>, orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { platform, orchestrator }
    }

    /// Request a sync: register with the platform when there is one,
    /// otherwise (or if registration fails) drain here.
    pub async fn request(&self) -> WakeOutcome {
        if let Some(platform) = &self.platform {
            match platform.register(SYNC_TAG).await {
                Ok(()) => return WakeOutcome::Registered,
                Err(err) => tracing::warn!(%err, "background sync registration failed, draining in foreground"),
            }
        }
        WakeOutcome::Drained(self.orchestrator.drain().await)
    }

    /// Foreground listener: requests a sync after a settled reconnection when
    /// work is queued, and whenever a mutation is queued while online. Runs
    /// until `shutdown` is notified.
    pub fn spawn_listener(
        self,
        monitor: Arc<ConnectivityMonitor>,
        queue: SyncQueue,
        events: &SyncEvents,
        shutdown: Arc<Notify>,
    ) -> JoinHandle<()> {
        let queued = events.subscribe();
        let mut reconnected = monitor.reconnected();

        tokio::spawn(async move {
            tracing::info!("sync listener started");
            let mut tick = tokio::time::interval(LISTENER_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        tracing::info!("sync listener received shutdown signal");
                        break;
                    }
                    changed = reconnected.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        match queue.pending_count().await {
                            Ok(0) => tracing::debug!("reconnected with an empty queue"),
                            Ok(pending) => {
                                tracing::info!(pending, "reconnected, requesting sync");
                                self.request().await;
                            }
                            Err(err) => tracing::warn!(%err, "could not read queue after reconnection"),
                        }
                    }
                    _ = tick.tick() => {
                        let mutations = queued
                            .drain()
                            .into_iter()
                            .filter(|event| matches!(event, SyncEvent::Pending { .. }))
                            .count();
                        if mutations > 0 && monitor.is_online() {
                            tracing::debug!(mutations, "mutations queued while online, requesting sync");
                            self.request().await;
                        }
                    }
                }
            }

            tracing::info!("sync listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use visitsync_core::{EntityKind, RecordId};

    use crate::db::Database;
    use crate::events::new_bus;
    use crate::gateway::{InMemoryRemote, RemoteMethod};
    use crate::lease::DrainLease;
    use crate::sync_queue::NewOperation;

    struct FailingPlatform;

    #[async_trait]
    impl BackgroundSync for FailingPlatform {
        async fn register(&self, _tag: &str) -> Result<(), WakeError> {
            Err(WakeError::Unavailable("not supported".into()))
        }
    }

    struct Fixture {
        remote: Arc<InMemoryRemote>,
        monitor: Arc<ConnectivityMonitor>,
        queue: SyncQueue,
        events: SyncEvents,
        orchestrator: Arc<SyncOrchestrator>,
    }

    async fn fixture(online: bool) -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let monitor = ConnectivityMonitor::new(online, Duration::from_millis(20));
        let events = new_bus();
        let orchestrator = Arc::new(SyncOrchestrator::new(
            &db,
            remote.clone(),
            monitor.clone(),
            events.clone(),
            DrainLease::new(&db, "test", Duration::from_secs(60)),
        ));
        Fixture {
            remote,
            monitor,
            queue: SyncQueue::new(&db),
            events,
            orchestrator,
        }
    }

    async fn queue_create(queue: &SyncQueue) {
        queue
            .enqueue(NewOperation::create(EntityKind::Store, RecordId::temporary(), json!({"name": "Tienda"})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn repeated_registrations_are_deduplicated() {
        let (platform, mut wakes) = InProcessBackgroundSync::channel();

        platform.register(SYNC_TAG).await.unwrap();
        platform.register(SYNC_TAG).await.unwrap();
        platform.register(SYNC_TAG).await.unwrap();

        assert_eq!(wakes.recv().await, Some(SyncRequested::new(SYNC_TAG)));
        assert!(wakes.receiver.try_recv().is_err());

        platform.register(SYNC_TAG).await.unwrap();
        assert_eq!(wakes.recv().await, Some(SyncRequested::new(SYNC_TAG)));
    }

    #[tokio::test]
    async fn registration_fails_once_the_worker_is_gone() {
        let (platform, wakes) = InProcessBackgroundSync::channel();
        drop(wakes);
        assert!(matches!(platform.register(SYNC_TAG).await, Err(WakeError::Unavailable(_))));
    }

    #[tokio::test]
    async fn request_registers_with_the_platform() {
        let f = fixture(true).await;
        queue_create(&f.queue).await;
        let (platform, mut wakes) = InProcessBackgroundSync::channel();
        let trigger = WakeTrigger::new(Some(platform), f.orchestrator.clone());

        assert_eq!(trigger.request().await, WakeOutcome::Registered);
        assert_eq!(wakes.recv().await.unwrap().tag, SYNC_TAG);
        assert!(f.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn request_falls_back_to_foreground_drain() {
        let f = fixture(true).await;
        queue_create(&f.queue).await;
        let trigger = WakeTrigger::new(Some(Arc::new(FailingPlatform)), f.orchestrator.clone());

        let outcome = trigger.request().await;

        assert!(matches!(outcome, WakeOutcome::Drained(DrainOutcome::Completed(ref s)) if s.synced == 1));
        assert_eq!(f.remote.calls_of(RemoteMethod::Create).len(), 1);

        let trigger = WakeTrigger::new(None, f.orchestrator.clone());
        queue_create(&f.queue).await;
        assert!(matches!(trigger.request().await, WakeOutcome::Drained(_)));
        assert_eq!(f.queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn listener_requests_sync_after_reconnection() {
        let f = fixture(false).await;
        queue_create(&f.queue).await;
        let (platform, mut wakes) = InProcessBackgroundSync::channel();
        let shutdown = Arc::new(Notify::new());
        let handle = WakeTrigger::new(Some(platform), f.orchestrator.clone()).spawn_listener(
            f.monitor.clone(),
            f.queue.clone(),
            &f.events,
            shutdown.clone(),
        );

        f.monitor.set_online(true);
        let wake = tokio::time::timeout(Duration::from_secs(5), wakes.recv()).await.unwrap();
        assert_eq!(wake, Some(SyncRequested::new(SYNC_TAG)));

        shutdown.notify_one();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn listener_reacts_to_mutations_queued_while_online() {
        let f = fixture(true).await;
        let (platform, mut wakes) = InProcessBackgroundSync::channel();
        let shutdown = Arc::new(Notify::new());
        let handle = WakeTrigger::new(Some(platform), f.orchestrator.clone()).spawn_listener(
            f.monitor.clone(),
            f.queue.clone(),
            &f.events,
            shutdown.clone(),
        );

        crate::events::emit(
            &f.events,
            SyncEvent::Pending { entity: EntityKind::Store, kind: crate::types::OperationKind::Create },
        );
        let wake = tokio::time::timeout(Duration::from_secs(5), wakes.recv()).await.unwrap();
        assert!(wake.is_some());

        shutdown.notify_one();
        handle.await.unwrap();
    }
}
