//! Sync status events published to the UI and the wake listener.

use std::sync::Arc;

use serde::Serialize;
use visitsync_core::{EntityKind, OperationId};
use visitsync_events::{EventBus, InMemoryEventBus};

use crate::types::OperationKind;

/// Progress notifications of the sync engine. Fire-and-forget.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum SyncEvent {
    #[serde(rename = "sync-start")]
    Started,
    #[serde(rename = "sync-complete")]
    Completed(SyncSummary),
    #[serde(rename = "sync-error")]
    Error { message: String },
    /// A mutation was queued for later replay.
    #[serde(rename = "sync-pending")]
    Pending { entity: EntityKind, kind: OperationKind },
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub total: usize,
    pub synced: usize,
    pub failed: usize,
    /// Connectivity dropped (or the lease was lost) before the queue was exhausted.
    pub aborted: bool,
    pub errors: Vec<OperationFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationFailure {
    pub op_id: OperationId,
    pub entity: EntityKind,
    pub kind: OperationKind,
    pub correlation_id: String,
    pub message: String,
}

/// Bus shared by one context.
pub type SyncEvents = Arc<InMemoryEventBus<SyncEvent>>;

pub fn new_bus() -> SyncEvents {
    Arc::new(InMemoryEventBus::new())
}

/// Publish without letting a bus failure reach the caller.
pub(crate) fn emit(events: &SyncEvents, event: SyncEvent) {
    if let Err(err) = events.publish(event) {
        tracing::warn!(%err, "failed to publish sync event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_kebab_case_tags() {
        let pending = SyncEvent::Pending {
            entity: EntityKind::Product,
            kind: OperationKind::Create,
        };
        assert_eq!(
            serde_json::to_value(&pending).unwrap(),
            json!({"event": "sync-pending", "entity": "product", "kind": "create"})
        );

        let done = SyncEvent::Completed(SyncSummary {
            total: 2,
            synced: 2,
            ..SyncSummary::default()
        });
        let value = serde_json::to_value(&done).unwrap();
        assert_eq!(value["event"], "sync-complete");
        assert_eq!(serde_json::to_value(SyncEvent::Started).unwrap(), json!({"event": "sync-start"}));
        assert_eq!(value["synced"], 2);
    }

    #[test]
    fn emit_reaches_subscribers() {
        let bus = new_bus();
        let sub = bus.subscribe();
        emit(&bus, SyncEvent::Started);
        assert_eq!(sub.try_recv().unwrap(), SyncEvent::Started);
    }
}
