//! Core types for the client sync layer
//!
//! This crate provides:
//! - Configuration management
//! - Error types shared by every component
//! - Data models (credentials, notifications, queued telemetry)

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod models;

pub use config::Config;
pub use error::{AuthError, Error, NetworkError, Result};
pub use models::{
    Ack, CONTENT_KEY_BUCKET_SECS, Credential, NavigationTarget, NotificationKind,
    NotificationRecord, PendingNavigation, QueuedEvent, ServerHistory, ServerRecord,
    TelemetryEvent, content_key,
};
