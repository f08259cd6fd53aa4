//! Error taxonomy of the sync engine.

use thiserror::Error;
use visitsync_core::{DomainError, RecordId};

use crate::gateway::GatewayError;

/// Failure of the local persistent store.
///
/// Never treated as "empty": callers surface it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("local storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("local storage unavailable: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },
}

impl StoreError {
    pub(crate) fn corrupt(table: &'static str, message: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            message: message.into(),
        }
    }
}

/// Errors surfaced by the entity facade and recorded by the orchestrator.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Offline, timeout, DNS, connection reset or 5xx. Retryable.
    #[error("network failure: {0}")]
    Network(String),

    /// 4xx other than 404. Surfaced, never queued.
    #[error("remote rejected the request ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// 404 on a record the client believed to exist.
    #[error("record no longer exists on the server: {0}")]
    RemoteGone(String),

    /// The server answered with something the engine cannot use.
    #[error("invalid response from server: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    StorageUnavailable(#[from] StoreError),

    #[error("record not found: {0}")]
    NotFound(RecordId),

    #[error("validation failed: {0}")]
    Validation(String),

    /// An update cannot be sent before the record's create has been confirmed.
    #[error("record {0} has not been created on the server yet")]
    Unconfirmed(RecordId),
}

impl SyncError {
    /// Whether the facade may recover by falling back to the local queue.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(value: sqlx::Error) -> Self {
        Self::StorageUnavailable(StoreError::Unavailable(value))
    }
}

impl From<DomainError> for SyncError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => Self::Validation(msg),
            DomainError::InvalidId(msg) | DomainError::InvalidRecord(msg) => {
                Self::InvalidResponse(msg)
            }
        }
    }
}

impl From<GatewayError> for SyncError {
    fn from(value: GatewayError) -> Self {
        match value {
            GatewayError::Network(msg) => Self::Network(msg),
            GatewayError::Timeout => Self::Network("request timed out".into()),
            GatewayError::Server { status, message } => {
                Self::Network(format!("server error {status}: {message}"))
            }
            GatewayError::Rejected { status, message } => Self::RemoteRejected { status, message },
            GatewayError::NotFound(what) => Self::RemoteGone(what),
            GatewayError::Decode(msg) => Self::InvalidResponse(msg),
            GatewayError::InvalidUrl(msg) => Self::Validation(format!("invalid api url: {msg}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_failures_are_retryable() {
        assert!(SyncError::from(GatewayError::Timeout).is_retryable());
        assert!(
            SyncError::from(GatewayError::Server {
                status: 503,
                message: "down".into()
            })
            .is_retryable()
        );
        assert!(
            !SyncError::from(GatewayError::Rejected {
                status: 422,
                message: "bad".into()
            })
            .is_retryable()
        );
        assert!(!SyncError::from(GatewayError::NotFound("products/1".into())).is_retryable());
    }

    #[test]
    fn domain_validation_maps_to_validation() {
        let err = SyncError::from(DomainError::validation("name is required"));
        assert!(matches!(err, SyncError::Validation(msg) if msg == "name is required"));
    }
}
