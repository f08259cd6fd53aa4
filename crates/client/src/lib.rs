//! `visitsync-client`
//!
//! **Responsibility:** offline-first sync engine for the visit/delivery client.
//!
//! This crate provides:
//! - A local SQLite store holding the canonical copy of every record
//! - A durable queue of mutations made while offline
//! - Replay of that queue against the REST API once connectivity returns
//! - Reconciliation of temporary identifiers with server-assigned ones
//!
//! The remote API stays the authority; local records are optimistic until
//! the server echoes them.

pub mod config;
pub mod connectivity;
pub mod context;
pub mod db;
pub mod error;
pub mod events;
pub mod facade;
pub mod gateway;
pub mod lease;
pub mod orchestrator;
pub mod reconciler;
pub mod store;
pub mod sync_queue;
pub mod types;
pub mod wake;
pub mod worker;

pub use config::SyncConfig;
pub use connectivity::ConnectivityMonitor;
pub use context::SyncContext;
pub use db::Database;
pub use error::{StoreError, SyncError};
pub use events::{OperationFailure, SyncEvent, SyncEvents, SyncSummary};
pub use facade::EntityFacade;
pub use gateway::{GatewayError, HttpGateway, InMemoryRemote, RemoteGateway};
pub use orchestrator::{DrainOutcome, SkipReason, SyncOrchestrator, SyncStatus};
pub use store::{Discard, LocalStore};
pub use sync_queue::SyncQueue;
pub use types::{ConnectivityState, NewOperation, OperationKind, OperationStatus, QueueSummary, SyncOperation};
pub use wake::{BackgroundSync, InProcessBackgroundSync, SYNC_TAG, SyncRequested, WakeOutcome, WakeTrigger};
pub use worker::{BackgroundWorker, WorkerMessage};
