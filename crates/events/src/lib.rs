//! Fire-and-forget event distribution for sync status notifications.
//!
//! The engine publishes progress (`started`, `completed`, `error`, `pending`)
//! through an [`EventBus`]; UI glue and the background wake listener subscribe.
//! Delivery is best-effort: a publisher never waits on, or fails because of, a
//! slow or departed subscriber.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
