//! REST adapters implementing the collaborator traits over a [`Transport`].
//!
//! Routes:
//! - `POST /auth/refresh`
//! - `GET /notifications?limit=N`
//! - `POST /notifications/{id}/read`, `POST /notifications/{id}/dismiss`
//! - `POST /notifications/read-all`, `POST /notifications/dismiss-all`
//! - `POST /events/batch`
//! - `GET /resources/{path}`, `POST /resources/{path}`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use client_sync_core::{
    Ack, AuthError, Credential, NetworkError, QueuedEvent, ServerHistory,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::{EventIngest, NotificationApi, RefreshApi, ResourceApi};
use crate::refresh_gate::RefreshGate;
use crate::transport::{Request, Transport, with_timeout};

// ---------------------------------------------------------------------------
// Credential refresh
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    /// Absent when the server does not rotate refresh tokens.
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl RefreshResponse {
    fn into_credential(self, previous_refresh_token: &str) -> Result<Credential, NetworkError> {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => at,
            (None, Some(secs)) => Utc::now() + chrono::Duration::seconds(secs),
            (None, None) => {
                return Err(NetworkError::Decode(
                    "refresh response carries no expiry".to_string(),
                ));
            }
        };
        Ok(Credential::new(
            self.access_token,
            self.refresh_token
                .unwrap_or_else(|| previous_refresh_token.to_string()),
            expires_at,
        ))
    }
}

pub struct RestRefreshApi {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl RestRefreshApi {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }
}

#[async_trait]
impl RefreshApi for RestRefreshApi {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, AuthError> {
        let request = Request::post("/auth/refresh", json!({ "refresh_token": refresh_token }));
        let response = with_timeout(
            "POST /auth/refresh",
            self.timeout,
            self.transport.send(request, self.timeout),
        )
        .await?;
        if response.status == 401 {
            return Err(AuthError::InvalidRefreshToken);
        }
        let parsed: RefreshResponse = response.json()?;
        Ok(parsed.into_credential(refresh_token)?)
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

pub struct RestNotificationApi {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl RestNotificationApi {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    async fn post(&self, path: String, access_token: &str) -> Result<(), NetworkError> {
        let request = Request::post(path, Value::Null).with_bearer(access_token);
        let label = format!("POST {}", request.path);
        with_timeout(&label, self.timeout, self.transport.send(request, self.timeout))
            .await?
            .into_body()
            .map(drop)
    }
}

#[async_trait]
impl NotificationApi for RestNotificationApi {
    async fn fetch_history(
        &self,
        access_token: &str,
        limit: usize,
    ) -> Result<ServerHistory, NetworkError> {
        let request = Request::get(format!("/notifications?limit={limit}")).with_bearer(access_token);
        with_timeout(
            "GET /notifications",
            self.timeout,
            self.transport.send(request, self.timeout),
        )
        .await?
        .json()
    }

    async fn mark_read(&self, access_token: &str, server_id: &str) -> Result<(), NetworkError> {
        self.post(format!("/notifications/{server_id}/read"), access_token)
            .await
    }

    async fn dismiss(&self, access_token: &str, server_id: &str) -> Result<(), NetworkError> {
        self.post(format!("/notifications/{server_id}/dismiss"), access_token)
            .await
    }

    async fn mark_all_read(&self, access_token: &str) -> Result<(), NetworkError> {
        self.post("/notifications/read-all".to_string(), access_token)
            .await
    }

    async fn dismiss_all(&self, access_token: &str) -> Result<(), NetworkError> {
        self.post("/notifications/dismiss-all".to_string(), access_token)
            .await
    }
}

// ---------------------------------------------------------------------------
// Telemetry ingestion
// ---------------------------------------------------------------------------

/// Batch ingestion. Give it a dedicated transport so it cannot be aborted by
/// unrelated traffic.
pub struct RestEventIngest {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    gate: Option<RefreshGate>,
}

impl RestEventIngest {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            gate: None,
        }
    }

    /// Attach a bearer token to each batch when the user is signed in.
    #[must_use]
    pub fn with_gate(mut self, gate: RefreshGate) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl EventIngest for RestEventIngest {
    async fn send_batch(&self, events: &[QueuedEvent]) -> Result<Ack, NetworkError> {
        let mut request = Request::post("/events/batch", json!({ "events": events }));
        if let Some(gate) = &self.gate {
            // Telemetry is accepted anonymously; a failed refresh is not fatal here.
            if let Ok(credential) = gate.ensure_valid().await {
                request = request.with_bearer(credential.access_token);
            }
        }
        with_timeout(
            "POST /events/batch",
            self.timeout,
            self.transport.send(request, self.timeout),
        )
        .await?
        .json()
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

pub struct RestResourceApi {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl RestResourceApi {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }
}

fn resource_path(path: &str) -> String {
    format!("/resources/{}", path.trim_start_matches('/'))
}

#[async_trait]
impl ResourceApi for RestResourceApi {
    async fn fetch(&self, access_token: &str, path: &str) -> Result<Value, NetworkError> {
        let request = Request::get(resource_path(path)).with_bearer(access_token);
        with_timeout(
            "GET /resources",
            self.timeout,
            self.transport.send(request, self.timeout),
        )
        .await?
        .into_body()
    }

    async fn mutate(
        &self,
        access_token: &str,
        path: &str,
        body: &Value,
    ) -> Result<Value, NetworkError> {
        let request = Request::post(resource_path(path), body.clone()).with_bearer(access_token);
        with_timeout(
            "POST /resources",
            self.timeout,
            self.transport.send(request, self.timeout),
        )
        .await?
        .into_body()
    }
}
