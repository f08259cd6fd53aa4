//! Connectivity monitor.
//!
//! Owns the process-wide online flag. Platform handlers feed it through
//! [`ConnectivityMonitor::set_online`]; everything else only reads it or
//! subscribes to transitions. The monitor never drains the queue itself: it
//! bumps a "reconnected" signal once connectivity has held for the settle
//! delay, and whoever listens decides what to do.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::watch;

use crate::types::ConnectivityState;

type Callback = Arc<dyn Fn(ConnectivityState) + Send + Sync>;
type Subscribers = Mutex<Vec<(u64, Callback)>>;

pub struct ConnectivityMonitor {
    online: AtomicBool,
    generation: AtomicU64,
    next_subscriber: AtomicU64,
    subscribers: Arc<Subscribers>,
    reconnected: watch::Sender<u64>,
    settle_delay: Duration,
}

impl core::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("online", &self.is_online())
            .field("settle_delay", &self.settle_delay)
            .finish_non_exhaustive()
    }
}

impl ConnectivityMonitor {
    /// Monitor seeded from the platform reachability signal.
    pub fn new(initially_online: bool, settle_delay: Duration) -> Arc<Self> {
        let (reconnected, _) = watch::channel(0);
        Arc::new(Self {
            online: AtomicBool::new(initially_online),
            generation: AtomicU64::new(0),
            next_subscriber: AtomicU64::new(0),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            reconnected,
            settle_delay,
        })
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectivityState {
        ConnectivityState::from_online(self.is_online())
    }

    /// Register a transition callback. It stays registered until the returned
    /// subscription is dropped or unsubscribed.
    pub fn subscribe(&self, callback: impl Fn(ConnectivityState) + Send + Sync + 'static) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        lock(&self.subscribers).push((id, Arc::new(callback)));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Receiver bumped once per settled reconnection.
    pub fn reconnected(&self) -> watch::Receiver<u64> {
        self.reconnected.subscribe()
    }

    /// Platform signal entry point. Repeating the current state is a no-op.
    pub fn set_online(self: &Arc<Self>, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let state = ConnectivityState::from_online(online);
        tracing::info!(?state, "connectivity changed");

        self.notify(state);

        if online {
            self.schedule_settle(generation);
        }
    }

    fn notify(&self, state: ConnectivityState) {
        // Snapshot so callbacks may subscribe or unsubscribe without deadlocking.
        let snapshot: Vec<(u64, Callback)> = lock(&self.subscribers).clone();
        for (id, callback) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(state))).is_err() {
                tracing::error!(subscriber = id, ?state, "connectivity subscriber panicked");
            }
        }
    }

    fn schedule_settle(self: &Arc<Self>, generation: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no runtime for settle delay, signalling reconnection immediately");
            self.signal_reconnected();
            return;
        };

        let monitor = Arc::clone(self);
        handle.spawn(async move {
            tokio::time::sleep(monitor.settle_delay).await;
            let unchanged = monitor.generation.load(Ordering::SeqCst) == generation;
            if unchanged && monitor.is_online() {
                monitor.signal_reconnected();
            } else {
                tracing::debug!("connectivity flapped during settle delay");
            }
        });
    }

    fn signal_reconnected(&self) {
        self.reconnected.send_modify(|n| *n += 1);
        tracing::debug!("reconnection settled");
    }
}

fn lock(subscribers: &Subscribers) -> MutexGuard<'_, Vec<(u64, Callback)>> {
    subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle keeping a connectivity callback registered.
#[must_use = "dropping the subscription unregisters the callback"]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Subscribers>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            lock(&subscribers).retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (Arc<StdMutex<Vec<ConnectivityState>>>, impl Fn(ConnectivityState) + Send + Sync + 'static) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |s| sink.lock().unwrap().push(s))
    }

    #[tokio::test]
    async fn subscribers_see_transitions_once() {
        let monitor = ConnectivityMonitor::new(true, Duration::from_secs(1));
        let (seen, callback) = recorder();
        let _sub = monitor.subscribe(callback);

        monitor.set_online(false);
        monitor.set_online(false);
        monitor.set_online(true);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectivityState::Offline, ConnectivityState::Online]
        );
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_block_others() {
        let monitor = ConnectivityMonitor::new(true, Duration::from_secs(1));
        let _bad = monitor.subscribe(|_| panic!("subscriber bug"));
        let (seen, callback) = recorder();
        let _good = monitor.subscribe(callback);

        monitor.set_online(false);

        assert_eq!(*seen.lock().unwrap(), vec![ConnectivityState::Offline]);
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn unsubscribe_stops_notifications() {
        let monitor = ConnectivityMonitor::new(false, Duration::from_secs(1));
        let (seen, callback) = recorder();
        let sub = monitor.subscribe(callback);
        sub.unsubscribe();

        monitor.set_online(true);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnection_is_signalled_after_settle_delay() {
        let monitor = ConnectivityMonitor::new(false, Duration::from_secs(1));
        let mut reconnected = monitor.reconnected();

        monitor.set_online(true);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!reconnected.has_changed().unwrap());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(reconnected.has_changed().unwrap());
        assert_eq!(*reconnected.borrow_and_update(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_within_settle_delay_signals_only_the_last_reconnection() {
        let monitor = ConnectivityMonitor::new(false, Duration::from_secs(1));
        let mut reconnected = monitor.reconnected();

        for _ in 0..5 {
            monitor.set_online(true);
            tokio::time::sleep(Duration::from_millis(100)).await;
            monitor.set_online(false);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        monitor.set_online(true);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(*reconnected.borrow_and_update(), 1);
    }

    #[test]
    fn without_runtime_reconnection_is_immediate() {
        let monitor = ConnectivityMonitor::new(false, Duration::from_secs(1));
        let reconnected = monitor.reconnected();
        monitor.set_online(true);
        assert_eq!(*reconnected.borrow(), 1);
    }
}
