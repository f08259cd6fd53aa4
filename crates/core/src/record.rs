//! Generic record shape exchanged with the REST API and kept in the local store.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::error::{DomainError, DomainResult};
use crate::id::{OperationId, RecordId};

const BOOKKEEPING: [&str; 3] = ["uuid", "createdAt", "updatedAt"];

/// One entity record: identifier, bookkeeping timestamps and the domain fields.
///
/// Domain fields are kept as an open JSON object so the engine stays agnostic
/// of the per-entity schema; typed access goes through [`Record::to_model`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub uuid: RecordId,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Parse a record out of a JSON value (server response or stored row).
    pub fn from_value(value: Value) -> DomainResult<Self> {
        if !value.is_object() {
            return Err(DomainError::invalid_record("expected a JSON object"));
        }
        serde_json::from_value(value).map_err(|e| DomainError::invalid_record(e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        let mut out = self.fields.clone();
        out.insert("uuid".into(), Value::String(self.uuid.to_string()));
        if let Some(at) = self.created_at {
            out.insert("createdAt".into(), Value::String(at.to_rfc3339()));
        }
        if let Some(at) = self.updated_at {
            out.insert("updatedAt".into(), Value::String(at.to_rfc3339()));
        }
        Value::Object(out)
    }

    /// Build a locally authored record (optimistic write made offline).
    pub fn local(uuid: RecordId, payload: &Map<String, Value>, now: DateTime<Utc>) -> Self {
        Self {
            uuid,
            created_at: Some(now),
            updated_at: Some(now),
            fields: domain_fields(payload),
        }
    }

    /// Apply a partial update on top of this record and bump `updatedAt`.
    pub fn merged(&self, patch: &Map<String, Value>, now: DateTime<Utc>) -> Self {
        let mut fields = self.fields.clone();
        fields.extend(domain_fields(patch));
        Self {
            uuid: self.uuid.clone(),
            created_at: self.created_at,
            updated_at: Some(now),
            fields,
        }
    }

    /// Server echo with the given local field values laid on top.
    ///
    /// Used when later queued writes still have to reach the server: the
    /// confirmed identifier and timestamps come from the echo, the visible
    /// values stay the ones the user typed.
    pub fn overlaid_with(&self, local: &Record) -> Self {
        let mut fields = self.fields.clone();
        fields.extend(local.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            uuid: self.uuid.clone(),
            created_at: self.created_at.or(local.created_at),
            updated_at: local.updated_at.max(self.updated_at),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Wrap a typed model as a record under the given identifier.
    pub fn from_model<T: Serialize>(uuid: RecordId, model: &T, now: DateTime<Utc>) -> DomainResult<Self> {
        match serde_json::to_value(model) {
            Ok(Value::Object(map)) => Ok(Self::local(uuid, &map, now)),
            Ok(_) => Err(DomainError::invalid_record("model did not serialize to an object")),
            Err(e) => Err(DomainError::invalid_record(e.to_string())),
        }
    }

    /// Decode the domain fields into a typed model.
    pub fn to_model<T: DeserializeOwned>(&self) -> DomainResult<T> {
        serde_json::from_value(Value::Object(self.fields.clone()))
            .map_err(|e| DomainError::invalid_record(e.to_string()))
    }
}

/// Copy of `payload` without the bookkeeping keys the engine owns.
pub fn domain_fields(payload: &Map<String, Value>) -> Map<String, Value> {
    payload
        .iter()
        .filter(|(k, _)| !BOOKKEEPING.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

// Servers in the wild send RFC 3339, naive `YYYY-MM-DD HH:MM:SS` or nothing at all.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let Some(Value::String(text)) = raw else {
        return Ok(None);
    };
    if let Ok(at) = DateTime::parse_from_rfc3339(&text) {
        return Ok(Some(at.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&text, format) {
            return Ok(Some(naive.and_utc()));
        }
    }
    Ok(None)
}

/// A value read from the local store, flagged when a queued write has not
/// reached the server yet.
#[derive(Debug, Clone, PartialEq)]
pub enum Tracked<T> {
    Confirmed(T),
    Pending(T, OperationId),
}

impl<T> Tracked<T> {
    pub fn value(&self) -> &T {
        match self {
            Self::Confirmed(v) | Self::Pending(v, _) => v,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Confirmed(v) | Self::Pending(v, _) => v,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(..))
    }

    pub fn pending_op(&self) -> Option<OperationId> {
        match self {
            Self::Pending(_, op) => Some(*op),
            Self::Confirmed(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Tracked<U> {
        match self {
            Self::Confirmed(v) => Tracked::Confirmed(f(v)),
            Self::Pending(v, op) => Tracked::Pending(f(v), op),
        }
    }
}

impl<T, E> Tracked<Result<T, E>> {
    pub fn transpose(self) -> Result<Tracked<T>, E> {
        match self {
            Self::Confirmed(v) => v.map(Tracked::Confirmed),
            Self::Pending(v, op) => v.map(|v| Tracked::Pending(v, op)),
        }
    }
}
