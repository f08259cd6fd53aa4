//! Shared types of the sync queue and connectivity layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use visitsync_core::{EntityKind, OperationId, RecordId};

/// What a queued operation does to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OperationKind::Create),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

/// Lifecycle of a queued operation. Acknowledged operations are deleted, not kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Syncing,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Syncing => "syncing",
            OperationStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OperationStatus::Pending),
            "syncing" => Some(OperationStatus::Syncing),
            "failed" => Some(OperationStatus::Failed),
            _ => None,
        }
    }
}

macro_rules! impl_sqlite_text_enum {
    ($t:ty, $name:literal) => {
        impl sqlx::Type<sqlx::Sqlite> for $t {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $t {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value)?;
                <$t>::parse(s).ok_or_else(|| format!("invalid {}: {}", $name, s).into())
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $t {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                let s = self.as_str();
                <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode_by_ref(&s, buf)
            }
        }
    };
}

impl_sqlite_text_enum!(OperationKind, "OperationKind");
impl_sqlite_text_enum!(OperationStatus, "OperationStatus");

/// A mutation waiting to be replayed against the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: OperationId,
    pub entity: EntityKind,
    pub kind: OperationKind,
    pub payload: Option<Value>,
    pub correlation_id: RecordId,
    pub timestamp: DateTime<Utc>,
    pub status: OperationStatus,
    pub retries: u32,
    pub last_error: Option<String>,
}

/// An operation before it has been assigned its queue position.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub entity: EntityKind,
    pub kind: OperationKind,
    pub payload: Option<Value>,
    pub correlation_id: RecordId,
}

impl NewOperation {
    pub fn create(entity: EntityKind, id: RecordId, payload: Value) -> Self {
        Self {
            entity,
            kind: OperationKind::Create,
            payload: Some(payload),
            correlation_id: id,
        }
    }

    pub fn update(entity: EntityKind, id: RecordId, payload: Value) -> Self {
        Self {
            entity,
            kind: OperationKind::Update,
            payload: Some(payload),
            correlation_id: id,
        }
    }

    pub fn delete(entity: EntityKind, id: RecordId) -> Self {
        Self {
            entity,
            kind: OperationKind::Delete,
            payload: None,
            correlation_id: id,
        }
    }
}

/// Connectivity state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// The platform reports a usable network.
    Online,
    /// No network; writes go to the queue.
    Offline,
}

impl ConnectivityState {
    pub fn from_online(online: bool) -> Self {
        if online { Self::Online } else { Self::Offline }
    }

    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

/// Queue contents grouped for display.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub total: usize,
    pub by_entity: BTreeMap<EntityKind, usize>,
    pub by_kind: BTreeMap<OperationKind, usize>,
    pub by_status: BTreeMap<OperationStatus, usize>,
}

impl QueueSummary {
    pub fn from_operations<'a>(ops: impl IntoIterator<Item = &'a SyncOperation>) -> Self {
        let mut summary = Self::default();
        for op in ops {
            summary.total += 1;
            *summary.by_entity.entry(op.entity).or_default() += 1;
            *summary.by_kind.entry(op.kind).or_default() += 1;
            *summary.by_status.entry(op.status).or_default() += 1;
        }
        summary
    }
}
