//! Client-side sync core
//!
//! This crate provides:
//! - [`ExpiringCache`]: per-key TTL cache with stale fallback
//! - [`RefreshGate`]: single-flight, cancellation-safe credential refresh
//! - [`FlushScheduler`]: non-resetting batched telemetry flush
//! - [`NotificationStore`]: optimistic, reconciling notification log
//! - [`SyncCoordinator`]: composition root for the presentation layer

#![forbid(unsafe_code)]

pub mod api;
pub mod cache;
pub mod coordinator;
pub mod credentials;
pub mod flush;
pub mod notifications;
pub mod refresh_gate;
pub mod rest;
pub mod retry;
pub mod testing;
pub mod transport;

pub use api::{CredentialStorage, EventIngest, NotificationApi, RefreshApi, ResourceApi};
pub use cache::{CacheMetricsSnapshot, ExpiringCache, Lookup};
pub use coordinator::{
    CacheClass, Collaborators, Fetched, Mutation, ResourceKey, Source, SyncCoordinator, SyncEvent,
};
pub use credentials::{FileCredentialStorage, MemoryCredentialStorage};
pub use flush::{
    EnqueueOutcome, FlushMetrics, FlushObserver, FlushOutcome, FlushReport, FlushScheduler,
    FlushSettings, FlushState,
};
pub use notifications::{MergeStats, NotificationStore, StoreMetrics, StoreSettings, SyncOutcome};
pub use refresh_gate::{RefreshGate, RefreshMetrics};
pub use retry::FlushRetryPolicy;
pub use transport::{Method, Request, Response, Transport, TransportFactory};

pub use client_sync_core::{AuthError, Config, Error, NetworkError, Result};
