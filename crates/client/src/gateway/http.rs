//! `reqwest`-backed gateway.

use std::sync::RwLock;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde_json::Value;
use visitsync_core::{EntityKind, Record, ServerId};

use super::{GatewayError, RemoteGateway};
use crate::config::SyncConfig;

/// HTTP client for the REST API.
///
/// Every call is bounded by the client timeout; a timeout is a network failure.
#[derive(Debug)]
pub struct HttpGateway {
    client: Client,
    base_url: Url,
    token: RwLock<Option<String>>,
}

impl HttpGateway {
    pub fn new(base_url: impl AsRef<str>, timeout: Duration) -> Result<Self, GatewayError> {
        let base_url = Url::parse(base_url.as_ref()).map_err(|e| GatewayError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            token: RwLock::new(None),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, GatewayError> {
        let gateway = Self::new(&config.api_url, config.request_timeout)?;
        gateway.set_token(config.auth_token.clone());
        Ok(gateway)
    }

    /// Ids go in as one percent-encoded path segment each.
    fn url(&self, kind: EntityKind, id: Option<&ServerId>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(kind.collection());
            if let Some(id) = id {
                segments.push(id.as_str());
            }
        }
        url
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let token = self.token.read().ok().and_then(|t| t.clone());
        match token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Send a request and return the unwrapped JSON body, `None` for an empty one.
    async fn send(&self, req: RequestBuilder) -> Result<Option<Value>, GatewayError> {
        let resp = self.authorize(req).send().await.map_err(transport_error)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        if status == StatusCode::NO_CONTENT || body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let value: Value =
            serde_json::from_slice(&body).map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok(Some(unwrap_data(value)))
    }
}

#[async_trait::async_trait]
impl RemoteGateway for HttpGateway {
    async fn list(&self, kind: EntityKind) -> Result<Vec<Record>, GatewayError> {
        let body = self.send(self.client.get(self.url(kind, None))).await?;
        match body {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => items.into_iter().map(decode_record).collect(),
            Some(other) => Err(GatewayError::Decode(format!(
                "expected a list of {}, got {}",
                kind.collection(),
                kind_of(&other)
            ))),
        }
    }

    async fn fetch(&self, kind: EntityKind, id: &ServerId) -> Result<Record, GatewayError> {
        let body = self.send(self.client.get(self.url(kind, Some(id)))).await?;
        body.map(decode_record)
            .unwrap_or_else(|| Err(GatewayError::Decode("empty response".into())))
    }

    async fn create(&self, kind: EntityKind, payload: &Value) -> Result<Record, GatewayError> {
        let body = self
            .send(self.client.post(self.url(kind, None)).json(payload))
            .await?;
        body.map(decode_record).unwrap_or_else(|| {
            Err(GatewayError::Decode("create returned no record".into()))
        })
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &ServerId,
        payload: &Value,
    ) -> Result<Option<Record>, GatewayError> {
        let body = self
            .send(self.client.put(self.url(kind, Some(id))).json(payload))
            .await?;
        body.map(decode_record).transpose()
    }

    async fn delete(&self, kind: EntityKind, id: &ServerId) -> Result<(), GatewayError> {
        self.send(self.client.delete(self.url(kind, Some(id)))).await?;
        Ok(())
    }

    fn set_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = token;
        }
    }
}

fn transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Network(err.to_string())
    }
}

fn status_error(status: StatusCode, body: &[u8]) -> GatewayError {
    let message = error_message(body)
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_else(|| status.to_string());
    let code = status.as_u16();

    if status == StatusCode::NOT_FOUND {
        GatewayError::NotFound(message)
    } else if status.is_client_error() {
        GatewayError::Rejected { status: code, message }
    } else {
        GatewayError::Server { status: code, message }
    }
}

/// `{message}`, `{error}` or the plain text body.
fn error_message(body: &[u8]) -> Option<String> {
    if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) {
        for key in ["message", "error"] {
            if let Some(Value::String(msg)) = map.get(key) {
                return Some(msg.clone());
            }
        }
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn unwrap_data(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn decode_record(value: Value) -> Result<Record, GatewayError> {
    let record = Record::from_value(value).map_err(|e| GatewayError::Decode(e.to_string()))?;
    if record.uuid.is_temporary() {
        return Err(GatewayError::Decode(format!(
            "server returned a temporary identifier {}",
            record.uuid
        )));
    }
    Ok(record)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
