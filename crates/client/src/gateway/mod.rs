//! Remote gateway: the REST API seen as five calls per entity collection.
//!
//! Path parameters are `&ServerId`, so a record that only exists locally can
//! never be addressed on the server.

use serde_json::Value;
use visitsync_core::{EntityKind, Record, ServerId};

pub mod http;
pub mod in_memory;

pub use http::HttpGateway;
pub use in_memory::{InMemoryRemote, RemoteCall, RemoteMethod};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid api url: {0}")]
    InvalidUrl(String),
}

impl GatewayError {
    /// Transport-level trouble that may go away on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout | Self::Server { .. })
    }
}

/// Access to the remote REST API.
#[async_trait::async_trait]
pub trait RemoteGateway: Send + Sync {
    /// `GET {base}/{collection}`
    async fn list(&self, kind: EntityKind) -> Result<Vec<Record>, GatewayError>;

    /// `GET {base}/{collection}/{id}`
    async fn fetch(&self, kind: EntityKind, id: &ServerId) -> Result<Record, GatewayError>;

    /// `POST {base}/{collection}`; the echo carries the server-assigned id.
    async fn create(&self, kind: EntityKind, payload: &Value) -> Result<Record, GatewayError>;

    /// `PUT {base}/{collection}/{id}`; `None` when the server answers without a body.
    async fn update(
        &self,
        kind: EntityKind,
        id: &ServerId,
        payload: &Value,
    ) -> Result<Option<Record>, GatewayError>;

    /// `DELETE {base}/{collection}/{id}`
    async fn delete(&self, kind: EntityKind, id: &ServerId) -> Result<(), GatewayError>;

    /// Replace the bearer token used for subsequent calls.
    fn set_token(&self, _token: Option<String>) {}
}
