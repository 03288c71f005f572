//! Collaborator contracts consumed by the sync components.
//!
//! Implementations live in [`crate::rest`] (HTTP over a [`crate::transport::Transport`])
//! and [`crate::testing`] (in-process fakes).

use async_trait::async_trait;
use client_sync_core::{
    Ack, AuthError, Credential, NetworkError, QueuedEvent, Result, ServerHistory,
};
use serde_json::Value;

/// Durable last-write-wins persistence for the current credential.
#[async_trait]
pub trait CredentialStorage: Send + Sync {
    async fn load(&self) -> Result<Option<Credential>>;
    async fn save(&self, credential: &Credential) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// Exchanges a refresh token for a new credential.
#[async_trait]
pub trait RefreshApi: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<Credential, AuthError>;
}

/// Server side of the notification log. Every call carries a bearer token.
#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn fetch_history(
        &self,
        access_token: &str,
        limit: usize,
    ) -> std::result::Result<ServerHistory, NetworkError>;

    async fn mark_read(
        &self,
        access_token: &str,
        server_id: &str,
    ) -> std::result::Result<(), NetworkError>;

    async fn dismiss(
        &self,
        access_token: &str,
        server_id: &str,
    ) -> std::result::Result<(), NetworkError>;

    async fn mark_all_read(&self, access_token: &str) -> std::result::Result<(), NetworkError>;

    async fn dismiss_all(&self, access_token: &str) -> std::result::Result<(), NetworkError>;
}

/// Telemetry ingestion. The server may dedupe by each event's `id`.
#[async_trait]
pub trait EventIngest: Send + Sync {
    async fn send_batch(&self, events: &[QueuedEvent]) -> std::result::Result<Ack, NetworkError>;
}

/// Read-mostly remote resources addressed by path (`agents`, `clients/42`, ...).
#[async_trait]
pub trait ResourceApi: Send + Sync {
    async fn fetch(&self, access_token: &str, path: &str)
    -> std::result::Result<Value, NetworkError>;

    async fn mutate(
        &self,
        access_token: &str,
        path: &str,
        body: &Value,
    ) -> std::result::Result<Value, NetworkError>;
}
