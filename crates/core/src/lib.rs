//! `visitsync-core` - domain building blocks for the offline sync engine.
//!
//! This crate contains **pure domain** primitives (no storage or network
//! concerns): identifiers, entity kinds, the generic record shape exchanged
//! with the REST API, and the typed models the field app works with.

pub mod entity;
pub mod error;
pub mod id;
pub mod models;
pub mod record;

pub use entity::{EntityKind, EntityModel};
pub use error::{DomainError, DomainResult};
pub use id::{OperationId, RecordId, ServerId, TEMP_PREFIX, TempId};
pub use models::{OrderLine, Product, Store, Visit};
pub use record::{Record, Tracked};
