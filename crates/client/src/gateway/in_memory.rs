//! In-memory remote for tests/dev.
//!
//! Behaves like the REST API (server-assigned ids, 404 on unknown ids) and
//! records every call it receives, so tests can assert on exactly what went
//! over the wire.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;
use visitsync_core::record::domain_fields;
use visitsync_core::{EntityKind, Record, RecordId, ServerId};

use super::{GatewayError, RemoteGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMethod {
    List,
    Fetch,
    Create,
    Update,
    Delete,
}

/// One request as the remote saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub method: RemoteMethod,
    pub entity: EntityKind,
    pub id: Option<ServerId>,
    pub payload: Option<Value>,
}

type CallHook = Arc<dyn Fn(&RemoteCall) + Send + Sync>;

#[derive(Default)]
struct RemoteState {
    records: HashMap<EntityKind, Vec<Record>>,
    calls: Vec<RemoteCall>,
    fail_next: VecDeque<GatewayError>,
    latency: Option<Duration>,
    hook: Option<CallHook>,
}

/// Scriptable stand-in for the REST API.
pub struct InMemoryRemote {
    reachable: AtomicBool,
    state: Mutex<RemoteState>,
}

impl core::fmt::Debug for InMemoryRemote {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryRemote")
            .field("reachable", &self.reachable.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            state: Mutex::new(RemoteState::default()),
        }
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Unreachable remotes fail every call with a network error.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Answer the next call with `err` instead of serving it.
    pub fn fail_next(&self, err: GatewayError) {
        self.state().fail_next.push_back(err);
    }

    /// Delay every call, to widen race windows in concurrency tests.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    /// Run `hook` after every successfully served call.
    pub fn on_call(&self, hook: impl Fn(&RemoteCall) + Send + Sync + 'static) {
        self.state().hook = Some(Arc::new(hook));
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    pub fn calls_of(&self, method: RemoteMethod) -> Vec<RemoteCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    pub fn records(&self, kind: EntityKind) -> Vec<Record> {
        self.state().records.get(&kind).cloned().unwrap_or_default()
    }

    /// Seed a record as if it had been created earlier; returns its id.
    pub fn insert(&self, kind: EntityKind, fields: Value) -> ServerId {
        let (id, record) = new_server_record(fields.as_object().cloned().unwrap_or_default());
        self.state().records.entry(kind).or_default().push(record);
        id
    }

    async fn serve<T>(
        &self,
        call: RemoteCall,
        handler: impl FnOnce(&mut RemoteState) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Network("remote unreachable".into()));
        }

        let (result, hook) = {
            let mut state = self.state();
            state.calls.push(call.clone());
            let result = match state.fail_next.pop_front() {
                Some(err) => Err(err),
                None => handler(&mut *state),
            };
            (result, state.hook.clone())
        };

        if result.is_ok() {
            if let Some(hook) = hook {
                hook(&call);
            }
        }
        result
    }
}

fn new_server_record(fields: Map<String, Value>) -> (ServerId, Record) {
    let now = Utc::now();
    let id = server_id();
    let record = Record {
        uuid: RecordId::Confirmed(id.clone()),
        created_at: Some(now),
        updated_at: Some(now),
        fields: domain_fields(&fields),
    };
    (id, record)
}

fn server_id() -> ServerId {
    match ServerId::new(Uuid::now_v7().to_string()) {
        Ok(id) => id,
        Err(_) => unreachable!("a uuid never carries the temporary prefix"),
    }
}

fn find<'a>(
    state: &'a mut RemoteState,
    kind: EntityKind,
    id: &ServerId,
) -> Result<&'a mut Record, GatewayError> {
    state
        .records
        .get_mut(&kind)
        .and_then(|records| records.iter_mut().find(|r| r.uuid.as_server() == Some(id)))
        .ok_or_else(|| GatewayError::NotFound(format!("{}/{}", kind.collection(), id)))
}

fn object(payload: &Value) -> Result<Map<String, Value>, GatewayError> {
    payload.as_object().cloned().ok_or_else(|| GatewayError::Rejected {
        status: 400,
        message: "expected a JSON object".into(),
    })
}

#[async_trait::async_trait]
impl RemoteGateway for InMemoryRemote {
    async fn list(&self, kind: EntityKind) -> Result<Vec<Record>, GatewayError> {
        let call = RemoteCall { method: RemoteMethod::List, entity: kind, id: None, payload: None };
        self.serve(call, |state| Ok(state.records.get(&kind).cloned().unwrap_or_default()))
            .await
    }

    async fn fetch(&self, kind: EntityKind, id: &ServerId) -> Result<Record, GatewayError> {
        let call = RemoteCall {
            method: RemoteMethod::Fetch,
            entity: kind,
            id: Some(id.clone()),
            payload: None,
        };
        self.serve(call, |state| find(state, kind, id).map(|r| r.clone())).await
    }

    async fn create(&self, kind: EntityKind, payload: &Value) -> Result<Record, GatewayError> {
        let call = RemoteCall {
            method: RemoteMethod::Create,
            entity: kind,
            id: None,
            payload: Some(payload.clone()),
        };
        self.serve(call, |state| {
            let (_, record) = new_server_record(object(payload)?);
            state.records.entry(kind).or_default().push(record.clone());
            Ok(record)
        })
        .await
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &ServerId,
        payload: &Value,
    ) -> Result<Option<Record>, GatewayError> {
        let call = RemoteCall {
            method: RemoteMethod::Update,
            entity: kind,
            id: Some(id.clone()),
            payload: Some(payload.clone()),
        };
        self.serve(call, |state| {
            let patch = object(payload)?;
            let record = find(state, kind, id)?;
            *record = record.merged(&patch, Utc::now());
            Ok(Some(record.clone()))
        })
        .await
    }

    async fn delete(&self, kind: EntityKind, id: &ServerId) -> Result<(), GatewayError> {
        let call = RemoteCall {
            method: RemoteMethod::Delete,
            entity: kind,
            id: Some(id.clone()),
            payload: None,
        };
        self.serve(call, |state| {
            let records = state.records.entry(kind).or_default();
            let before = records.len();
            records.retain(|r| r.uuid.as_server() != Some(id));
            if records.len() == before {
                return Err(GatewayError::NotFound(format!("{}/{}", kind.collection(), id)));
            }
            Ok(())
        })
        .await
    }
}
