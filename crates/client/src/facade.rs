//! Entity facade: the read/write API the UI calls.
//!
//! Online, writes go straight to the remote and the echo is cached. Offline,
//! or when the network fails mid-call, writes land in the local store as
//! optimistic records and the operation is queued for the orchestrator.
//! Rejections from the server are surfaced, never queued.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use visitsync_core::record::domain_fields;
use visitsync_core::{EntityKind, EntityModel, OperationId, Record, RecordId, Tracked};

use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::events::{SyncEvent, SyncEvents, emit};
use crate::gateway::{GatewayError, RemoteGateway};
use crate::store::{Discard, LocalStore};
use crate::sync_queue::{NewOperation, OperationKind, SyncQueue};

#[derive(Clone)]
pub struct EntityFacade {
    store: LocalStore,
    queue: SyncQueue,
    gateway: Arc<dyn RemoteGateway>,
    monitor: Arc<ConnectivityMonitor>,
    events: SyncEvents,
}

impl core::fmt::Debug for EntityFacade {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntityFacade")
            .field("online", &self.monitor.is_online())
            .finish_non_exhaustive()
    }
}

/// Recoverable remote failures fall through to the offline path.
fn recoverable<T>(result: Result<T, GatewayError>, kind: EntityKind, action: &str) -> Result<Option<T>, SyncError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_retryable() => {
            tracing::warn!(entity = %kind, action, %err, "remote unavailable, falling back to local");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn object(data: Value) -> Result<Map<String, Value>, SyncError> {
    match data {
        Value::Object(map) => Ok(domain_fields(&map)),
        _ => Err(SyncError::Validation("record data must be a JSON object".into())),
    }
}

impl EntityFacade {
    pub fn new(
        store: LocalStore,
        queue: SyncQueue,
        gateway: Arc<dyn RemoteGateway>,
        monitor: Arc<ConnectivityMonitor>,
        events: SyncEvents,
    ) -> Self {
        Self {
            store,
            queue,
            gateway,
            monitor,
            events,
        }
    }

    /// Whether a confirmed record can be written through directly: online and
    /// nothing queued ahead of the write.
    async fn direct(&self, id: &RecordId) -> Result<bool, SyncError> {
        if !self.monitor.is_online() || id.is_temporary() {
            return Ok(false);
        }
        Ok(!self.queue.has_queued(id).await?)
    }

    fn pending(&self, entity: EntityKind, kind: OperationKind) {
        emit(&self.events, SyncEvent::Pending { entity, kind });
    }

    /// Server list when reachable (refreshing the local copy), local store otherwise.
    pub async fn get_all(&self, kind: EntityKind) -> Result<Vec<Tracked<Record>>, SyncError> {
        if self.monitor.is_online() {
            if let Some(records) = recoverable(self.gateway.list(kind).await, kind, "list")? {
                self.store.refresh(kind, &records).await?;
            }
        }
        Ok(self.store.get_all(kind).await?)
    }

    pub async fn get_by_id(&self, kind: EntityKind, id: &RecordId) -> Result<Tracked<Record>, SyncError> {
        if let (true, Some(server_id)) = (self.direct(id).await?, id.as_server()) {
            match self.gateway.fetch(kind, server_id).await {
                Ok(record) => {
                    self.store.put(kind, &record).await?;
                    return Ok(Tracked::Confirmed(record));
                }
                Err(GatewayError::NotFound(_)) => {
                    self.store.delete(kind, id).await?;
                    return Err(SyncError::NotFound(id.clone()));
                }
                Err(err) => {
                    recoverable::<()>(Err(err), kind, "fetch")?;
                }
            }
        }
        self.store
            .get(kind, id)
            .await?
            .ok_or_else(|| SyncError::NotFound(id.clone()))
    }

    pub async fn create(&self, kind: EntityKind, data: Value) -> Result<Tracked<Record>, SyncError> {
        let fields = object(data)?;

        if self.monitor.is_online() {
            let body = Value::Object(fields.clone());
            if let Some(record) = recoverable(self.gateway.create(kind, &body).await, kind, "create")? {
                self.store.put(kind, &record).await?;
                return Ok(Tracked::Confirmed(record));
            }
        }

        let record = Record::local(RecordId::temporary(), &fields, Utc::now());
        let op = NewOperation::create(kind, record.uuid.clone(), Value::Object(fields));
        let op_id = self.store.stage_write(kind, &record, op).await?;
        tracing::info!(entity = %kind, correlation_id = %record.uuid, op_id = %op_id, "create queued");
        self.pending(kind, OperationKind::Create);
        Ok(Tracked::Pending(record, op_id))
    }

    pub async fn update(&self, kind: EntityKind, id: &RecordId, data: Value) -> Result<Tracked<Record>, SyncError> {
        let patch = object(data)?;
        let local = self.store.get(kind, id).await?.map(Tracked::into_inner);

        if let (true, Some(server_id)) = (self.direct(id).await?, id.as_server()) {
            let now = Utc::now();
            let merged = match &local {
                Some(local) => local.merged(&patch, now),
                None => Record::local(id.clone(), &patch, now),
            };
            let body = Value::Object(merged.fields.clone());
            match self.gateway.update(kind, server_id, &body).await {
                Ok(echo) => {
                    let record = echo.unwrap_or(merged);
                    self.store.put(kind, &record).await?;
                    return Ok(Tracked::Confirmed(record));
                }
                Err(GatewayError::NotFound(_)) => {
                    self.store.delete(kind, id).await?;
                    return Err(SyncError::NotFound(id.clone()));
                }
                Err(err) => {
                    recoverable::<()>(Err(err), kind, "update")?;
                }
            }
        }

        let local = local.ok_or_else(|| SyncError::NotFound(id.clone()))?;
        let merged = local.merged(&patch, Utc::now());
        let op = NewOperation::update(kind, id.clone(), Value::Object(merged.fields.clone()));
        // Reconciliation may have moved the row since it was read.
        let op_id = self
            .store
            .stage_update(kind, &merged, op)
            .await?
            .ok_or_else(|| SyncError::NotFound(id.clone()))?;
        tracing::info!(entity = %kind, correlation_id = %id, op_id = %op_id, "update queued");
        self.pending(kind, OperationKind::Update);
        Ok(Tracked::Pending(merged, op_id))
    }

    /// Returns the queued operation, if the delete still has to reach the server.
    pub async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<Option<OperationId>, SyncError> {
        if id.is_temporary() {
            return match self.store.discard_local(kind, id).await? {
                // Already reconciled, or never existed.
                Discard::Missing => Err(SyncError::NotFound(id.clone())),
                Discard::Dropped => Ok(None),
                Discard::Deferred(op_id) => {
                    self.pending(kind, OperationKind::Delete);
                    Ok(Some(op_id))
                }
            };
        }

        if let (true, Some(server_id)) = (self.direct(id).await?, id.as_server()) {
            let result = match self.gateway.delete(kind, server_id).await {
                Err(GatewayError::NotFound(_)) => Ok(()),
                other => other,
            };
            if recoverable(result, kind, "delete")?.is_some() {
                self.store.delete(kind, id).await?;
                return Ok(None);
            }
        }

        let op_id = self.store.stage_delete(kind, id).await?;
        tracing::info!(entity = %kind, correlation_id = %id, op_id = %op_id, "delete queued");
        self.pending(kind, OperationKind::Delete);
        Ok(Some(op_id))
    }

    /// Validate and create a typed model.
    pub async fn create_model<T: EntityModel>(&self, model: &T) -> Result<Tracked<T>, SyncError> {
        model.validate()?;
        let tracked = self.create(T::KIND, serde_json::to_value(model).map_err(|e| SyncError::Validation(e.to_string()))?).await?;
        Ok(tracked.map(|record| record.to_model::<T>()).transpose()?)
    }

    /// Validate and update a typed model.
    pub async fn update_model<T: EntityModel>(&self, id: &RecordId, model: &T) -> Result<Tracked<T>, SyncError> {
        model.validate()?;
        let data = serde_json::to_value(model).map_err(|e| SyncError::Validation(e.to_string()))?;
        let tracked = self.update(T::KIND, id, data).await?;
        Ok(tracked.map(|record| record.to_model::<T>()).transpose()?)
    }

    /// Every record of a typed collection, with its identifier.
    pub async fn list_models<T: EntityModel>(&self) -> Result<Vec<(RecordId, Tracked<T>)>, SyncError> {
        let mut out = Vec::new();
        for tracked in self.get_all(T::KIND).await? {
            let id = tracked.value().uuid.clone();
            out.push((id, tracked.map(|r| r.to_model::<T>()).transpose()?));
        }
        Ok(out)
    }

    /// Refresh every collection from the server.
    pub async fn force_refresh(&self) -> Result<(), SyncError> {
        if !self.monitor.is_online() {
            return Err(SyncError::Network("cannot refresh while offline".into()));
        }
        for kind in EntityKind::ALL {
            let records = self.gateway.list(kind).await?;
            self.store.refresh(kind, &records).await?;
        }
        tracing::info!("all collections refreshed");
        Ok(())
    }
}
