//! Data model shared by the sync components
//!
//! Wall-clock timestamps (`DateTime<Utc>`) are used for anything that crosses
//! the wire or is persisted. Monotonic deadlines stay inside the components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Width of the coarse time bucket folded into a content key.
pub const CONTENT_KEY_BUCKET_SECS: i64 = 300;

// =============================================================================
// Credentials
// =============================================================================

/// Access/refresh token pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    #[must_use]
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    /// Valid if it does not expire within `skew` of `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>, skew: std::time::Duration) -> bool {
        let skew = chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::zero());
        self.expires_at
            .checked_sub_signed(skew)
            .is_some_and(|deadline| deadline > now)
    }

    /// Force the credential into the expired state, keeping the refresh token.
    pub fn expire(&mut self) {
        self.expires_at = DateTime::<Utc>::MIN_UTC;
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// =============================================================================
// Notifications
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    Mention,
    Assignment,
    Reminder,
    StatusChange,
    System,
    #[serde(other)]
    Unknown,
}

impl NotificationKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Mention => "mention",
            Self::Assignment => "assignment",
            Self::Reminder => "reminder",
            Self::StatusChange => "status_change",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }
}

/// Stable fingerprint of a logical notification: kind, subject and the
/// coarse creation bucket. Two records from different sources with the same
/// key are the same notification.
#[must_use]
pub fn content_key(kind: &NotificationKind, subject_id: &str, created_at: DateTime<Utc>) -> String {
    let bucket = created_at.timestamp().div_euclid(CONTENT_KEY_BUCKET_SECS);
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(subject_id.as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// A notification as returned by the server history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub kind: NotificationKind,
    pub subject_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub is_dismissed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl ServerRecord {
    #[must_use]
    pub fn content_key(&self) -> String {
        content_key(&self.kind, &self.subject_id, self.created_at)
    }
}

/// Page returned by the history endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHistory {
    pub records: Vec<ServerRecord>,
    #[serde(default)]
    pub unread_count: Option<usize>,
}

/// The merged, locally-held view of one notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub local_id: Uuid,
    pub server_id: Option<String>,
    pub kind: NotificationKind,
    pub subject_id: String,
    pub title: Option<String>,
    pub body: Option<String>,
    pub is_read: bool,
    pub is_dismissed: bool,
    pub created_at: DateTime<Utc>,
    pub content_key: String,
}

impl NotificationRecord {
    /// A record that arrived out-of-band (live push) and has no server id yet.
    #[must_use]
    pub fn local(
        kind: NotificationKind,
        subject_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let subject_id = subject_id.into();
        let content_key = content_key(&kind, &subject_id, created_at);
        Self {
            local_id: Uuid::new_v4(),
            server_id: None,
            kind,
            subject_id,
            title: None,
            body: None,
            is_read: false,
            is_dismissed: false,
            created_at,
            content_key,
        }
    }

    #[must_use]
    pub fn with_text(mut self, title: impl Into<String>, body: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn from_server(record: &ServerRecord) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            server_id: Some(record.id.clone()),
            kind: record.kind.clone(),
            subject_id: record.subject_id.clone(),
            title: record.title.clone(),
            body: record.body.clone(),
            is_read: record.is_read,
            is_dismissed: record.is_dismissed,
            created_at: record.created_at,
            content_key: record.content_key(),
        }
    }
}

// =============================================================================
// Pending navigation
// =============================================================================

/// Where the presentation layer should go once it is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NavigationTarget {
    Notification { content_key: String },
    Subject { kind: NotificationKind, subject_id: String },
    Route { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNavigation {
    pub target: NavigationTarget,
    pub set_at: DateTime<Utc>,
}

// =============================================================================
// Telemetry
// =============================================================================

/// A producer-side analytics/activity event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub name: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

impl TelemetryEvent {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: serde_json::Map::new(),
            occurred_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// One event waiting for the next flush. `id` lets the server dedupe retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub id: Uuid,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedEvent {
    #[must_use]
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// Ingestion acknowledgement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub accepted: usize,
    #[serde(default)]
    pub duplicates: usize,
}
