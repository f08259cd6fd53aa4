//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::DomainError;

/// Textual prefix marking a locally generated identifier at rest and on the wire.
pub const TEMP_PREFIX: &str = "temp-";

/// Locally generated identifier of a record the server has not acknowledged yet.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TempId(Uuid);

impl TempId {
    /// Create a new temporary identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TempId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for TempId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{TEMP_PREFIX}{}", self.0)
    }
}

impl From<Uuid> for TempId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for TempId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix(TEMP_PREFIX)
            .ok_or_else(|| DomainError::invalid_id(format!("TempId: missing prefix in {s:?}")))?;
        let uuid =
            Uuid::from_str(raw).map_err(|e| DomainError::invalid_id(format!("TempId: {e}")))?;
        Ok(Self(uuid))
    }
}

/// Identifier assigned by the remote API. Opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    /// Wrap a server-assigned identifier.
    ///
    /// Rejects blank values and values carrying the temporary prefix, so a
    /// local identifier can never masquerade as a confirmed one.
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::invalid_id("ServerId: empty"));
        }
        if value.starts_with(TEMP_PREFIX) {
            return Err(DomainError::invalid_id(format!(
                "ServerId: reserved prefix in {value:?}"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ServerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServerId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for ServerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Identifier of a record, either still local or confirmed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordId {
    Temporary(TempId),
    Confirmed(ServerId),
}

impl RecordId {
    /// Fresh temporary identifier for an offline create.
    pub fn temporary() -> Self {
        Self::Temporary(TempId::new())
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    pub fn as_temp(&self) -> Option<&TempId> {
        match self {
            Self::Temporary(id) => Some(id),
            Self::Confirmed(_) => None,
        }
    }

    pub fn as_server(&self) -> Option<&ServerId> {
        match self {
            Self::Confirmed(id) => Some(id),
            Self::Temporary(_) => None,
        }
    }
}

impl core::fmt::Display for RecordId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Temporary(id) => core::fmt::Display::fmt(id, f),
            Self::Confirmed(id) => core::fmt::Display::fmt(id, f),
        }
    }
}

impl From<TempId> for RecordId {
    fn from(value: TempId) -> Self {
        Self::Temporary(value)
    }
}

impl From<ServerId> for RecordId {
    fn from(value: ServerId) -> Self {
        Self::Confirmed(value)
    }
}

impl FromStr for RecordId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with(TEMP_PREFIX) {
            Ok(Self::Temporary(s.parse()?))
        } else {
            Ok(Self::Confirmed(ServerId::new(s)?))
        }
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifier of a queued sync operation (auto-increment, defines queue order).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(i64);

impl OperationId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for OperationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<i64> for OperationId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}
