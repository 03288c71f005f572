//! Pluggable request/response transport.
//!
//! The REST adapters in [`crate::rest`] only speak this trait. Each adapter
//! can be given its own instance through a [`TransportFactory`], which is how
//! the flush pipeline gets a connection that unrelated requests cannot abort.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use client_sync_core::NetworkError;
use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// Path including any query string, e.g. `/notifications?limit=50`.
    pub path: String,
    pub bearer: Option<String>,
    pub body: Option<Value>,
}

impl Request {
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            bearer: None,
            body: None,
        }
    }

    #[must_use]
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            bearer: None,
            body: Some(body),
        }
    }

    #[must_use]
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    #[must_use]
    pub const fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    #[must_use]
    pub const fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Body of a 2xx response, or `NetworkError::Status` carrying the
    /// server's `error` message when present.
    pub fn into_body(self) -> Result<Value, NetworkError> {
        if self.is_success() {
            return Ok(self.body);
        }
        let message = self
            .body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Err(NetworkError::status(self.status, message))
    }

    /// Decode a 2xx body into `T`.
    pub fn json<T: DeserializeOwned>(self) -> Result<T, NetworkError> {
        let body = self.into_body()?;
        serde_json::from_value(body).map_err(|e| NetworkError::Decode(e.to_string()))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request. Must give up and return `NetworkError::Timeout`
    /// once `timeout` elapses.
    async fn send(&self, request: Request, timeout: Duration) -> Result<Response, NetworkError>;
}

/// Creates independent transport instances. `purpose` is a label such as
/// `"api"` or `"telemetry"`.
pub trait TransportFactory: Send + Sync {
    fn create(&self, purpose: &str) -> Arc<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&str) -> Arc<dyn Transport> + Send + Sync,
{
    fn create(&self, purpose: &str) -> Arc<dyn Transport> {
        self(purpose)
    }
}

/// Enforce `timeout` around any transport future.
pub async fn with_timeout<F>(
    operation: &str,
    timeout: Duration,
    fut: F,
) -> Result<Response, NetworkError>
where
    F: std::future::Future<Output = Result<Response, NetworkError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| Err(NetworkError::timeout(operation, timeout)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_body_becomes_status_error() {
        let err = Response::new(404, json!({"error": "no such notification"}))
            .into_body()
            .unwrap_err();
        assert_eq!(err, NetworkError::status(404, "no such notification"));
    }

    #[test]
    fn malformed_body_is_decode_error() {
        let err = Response::ok(json!({"unexpected": true}))
            .json::<client_sync_core::ServerHistory>()
            .unwrap_err();
        assert!(matches!(err, NetworkError::Decode(_)));
    }

    #[test]
    fn request_builders() {
        let req = Request::post("/events/batch", json!({"events": []})).with_bearer("t");
        assert_eq!(req.method.as_str(), "POST");
        assert_eq!(req.bearer.as_deref(), Some("t"));
        assert!(Request::get("/x").body.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_maps_elapsed() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Response::ok(Value::Null))
        };
        let err = with_timeout("probe", Duration::from_secs(1), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Timeout(_)));
    }
}
