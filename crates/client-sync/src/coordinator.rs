//! Composition root wiring the sync components to their collaborators.
//!
//! [`SyncCoordinator`] owns one [`RefreshGate`], one [`ExpiringCache`] per
//! TTL class, the [`FlushScheduler`] and the [`NotificationStore`]. The
//! presentation layer talks to it and listens on [`SyncCoordinator::subscribe`].

use std::sync::Arc;
use std::time::Duration;

use client_sync_core::{
    Config, Credential, Error, NavigationTarget, NetworkError, NotificationRecord, Result,
    TelemetryEvent,
};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::api::{CredentialStorage, EventIngest, NotificationApi, RefreshApi, ResourceApi};
use crate::cache::{CacheMetricsSnapshot, ExpiringCache, Lookup};
use crate::flush::{
    EnqueueOutcome, FlushObserver, FlushOutcome, FlushReport, FlushScheduler, FlushSettings,
};
use crate::notifications::{NotificationStore, StoreSettings, SyncOutcome};
use crate::refresh_gate::RefreshGate;
use crate::rest::{RestEventIngest, RestNotificationApi, RestRefreshApi, RestResourceApi};
use crate::transport::TransportFactory;

const EVENT_BUS_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Resource addressing
// ---------------------------------------------------------------------------

/// TTL class of a cached resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheClass {
    /// Rarely-changing lists (`list_cache_ttl`).
    List,
    /// Frequently-changing per-user data (`user_cache_ttl`).
    User,
    /// Dashboards and counters (`metrics_cache_ttl`).
    Metrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub class: CacheClass,
    pub path: String,
}

impl ResourceKey {
    #[must_use]
    pub fn list(path: impl Into<String>) -> Self {
        Self {
            class: CacheClass::List,
            path: path.into(),
        }
    }

    #[must_use]
    pub fn user(path: impl Into<String>) -> Self {
        Self {
            class: CacheClass::User,
            path: path.into(),
        }
    }

    #[must_use]
    pub fn metrics(path: impl Into<String>) -> Self {
        Self {
            class: CacheClass::Metrics,
            path: path.into(),
        }
    }
}

/// Where a fetched value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Network,
    /// Expired cache entry served because the re-fetch failed.
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub value: Value,
    pub source: Source,
}

/// A write to `path` and the cached reads it makes stale.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub path: String,
    pub body: Value,
    pub invalidates: Vec<ResourceKey>,
}

impl Mutation {
    #[must_use]
    pub fn new(path: impl Into<String>, body: Value) -> Self {
        Self {
            path: path.into(),
            body,
            invalidates: Vec::new(),
        }
    }

    #[must_use]
    pub fn invalidating(mut self, key: ResourceKey) -> Self {
        self.invalidates.push(key);
        self
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Change notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    CacheStored { key: ResourceKey },
    CacheInvalidated { key: ResourceKey },
    /// Every cache was emptied (login/logout).
    CachesCleared,
    NotificationsChanged { version: u64 },
    /// The pending-navigation slot was filled.
    PendingNavigation,
    /// A terminal authentication failure; prompt for a full re-login.
    ReauthRequired,
    FlushFailed {
        seq: u64,
        batch_len: usize,
        error: NetworkError,
    },
}

#[derive(Clone)]
struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }
}

impl FlushObserver for EventBus {
    fn on_flush(&self, report: &FlushReport) {
        if let FlushOutcome::Dropped(error) = &report.outcome {
            self.emit(SyncEvent::FlushFailed {
                seq: report.seq,
                batch_len: report.batch_len,
                error: error.clone(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Collaborators for [`SyncCoordinator::new`].
pub struct Collaborators {
    pub refresh: Arc<dyn RefreshApi>,
    pub storage: Arc<dyn CredentialStorage>,
    pub notifications: Arc<dyn NotificationApi>,
    pub resources: Arc<dyn ResourceApi>,
    /// Should not share a connection with the other collaborators.
    pub ingest: Arc<dyn EventIngest>,
}

struct Caches {
    list: ExpiringCache<String, Value>,
    user: ExpiringCache<String, Value>,
    metrics: ExpiringCache<String, Value>,
}

impl Caches {
    fn from_config(config: &Config) -> Self {
        Self {
            list: ExpiringCache::new("list", config.list_cache_ttl, config.cache_capacity),
            user: ExpiringCache::new("user", config.user_cache_ttl, config.cache_capacity),
            metrics: ExpiringCache::new("metrics", config.metrics_cache_ttl, config.cache_capacity),
        }
    }

    const fn for_class(&self, class: CacheClass) -> &ExpiringCache<String, Value> {
        match class {
            CacheClass::List => &self.list,
            CacheClass::User => &self.user,
            CacheClass::Metrics => &self.metrics,
        }
    }

    fn invalidate_all(&self) {
        self.list.invalidate_all();
        self.user.invalidate_all();
        self.metrics.invalidate_all();
    }

    fn purge_expired(&self) -> usize {
        self.list.purge_expired() + self.user.purge_expired() + self.metrics.purge_expired()
    }
}

struct CoordinatorInner {
    gate: RefreshGate,
    caches: Caches,
    resources: Arc<dyn ResourceApi>,
    request_timeout: Duration,
    scheduler: FlushScheduler,
    store: NotificationStore,
    events: EventBus,
    shutdown: CancellationToken,
}

impl Drop for CoordinatorInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Public entry point of the sync layer. Cheap to clone.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("gate", &self.inner.gate)
            .field("scheduler", &self.inner.scheduler)
            .field("store", &self.inner.store)
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    /// Build from collaborator trait objects. Must be called inside a tokio runtime.
    pub fn new(config: &Config, collaborators: Collaborators) -> Result<Self> {
        let gate = RefreshGate::from_config(collaborators.refresh, collaborators.storage, config);
        Self::assemble(
            config,
            gate,
            collaborators.notifications,
            collaborators.resources,
            collaborators.ingest,
        )
    }

    /// Build REST collaborators on transports from `factory`. Telemetry gets
    /// its own transport instance.
    pub fn from_transport(
        config: &Config,
        factory: &dyn TransportFactory,
        storage: Arc<dyn CredentialStorage>,
    ) -> Result<Self> {
        let api = factory.create("api");
        let telemetry = factory.create("telemetry");
        let timeout = config.request_timeout;

        let gate = RefreshGate::from_config(
            Arc::new(RestRefreshApi::new(Arc::clone(&api), config.refresh_timeout)),
            storage,
            config,
        );
        let ingest = RestEventIngest::new(telemetry, config.flush_send_timeout).with_gate(gate.clone());
        Self::assemble(
            config,
            gate,
            Arc::new(RestNotificationApi::new(Arc::clone(&api), timeout)),
            Arc::new(RestResourceApi::new(api, timeout)),
            Arc::new(ingest),
        )
    }

    fn assemble(
        config: &Config,
        gate: RefreshGate,
        notifications: Arc<dyn NotificationApi>,
        resources: Arc<dyn ResourceApi>,
        ingest: Arc<dyn EventIngest>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("sync coordinator needs a tokio runtime: {e}")))?;
        let events = EventBus::new(EVENT_BUS_CAPACITY);
        let scheduler = FlushScheduler::with_runtime(
            ingest,
            FlushSettings::from_config(config),
            runtime.clone(),
        )
        .with_observer(Arc::new(events.clone()));
        let store = NotificationStore::new(
            notifications,
            gate.clone(),
            StoreSettings::from_config(config),
        );
        let shutdown = CancellationToken::new();
        runtime.spawn(forward_store_changes(
            store.subscribe(),
            store.subscribe_pending_navigation(),
            events.clone(),
            shutdown.clone(),
        ));

        tracing::debug!(
            flush_interval_ms = u64::try_from(config.flush_interval.as_millis()).unwrap_or(u64::MAX),
            "sync coordinator assembled"
        );
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                gate,
                caches: Caches::from_config(config),
                resources,
                request_timeout: config.request_timeout,
                scheduler,
                store,
                events,
                shutdown,
            }),
        })
    }

    // -- Accessors ------------------------------------------------------------

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.sender.subscribe()
    }

    #[must_use]
    pub fn gate(&self) -> &RefreshGate {
        &self.inner.gate
    }

    #[must_use]
    pub fn scheduler(&self) -> &FlushScheduler {
        &self.inner.scheduler
    }

    #[must_use]
    pub fn notifications(&self) -> &NotificationStore {
        &self.inner.store
    }

    #[must_use]
    pub fn cache_metrics(&self, class: CacheClass) -> CacheMetricsSnapshot {
        self.inner.caches.for_class(class).metrics()
    }

    // -- Authentication -------------------------------------------------------

    /// Load a persisted credential. Returns whether one was found.
    pub async fn restore(&self) -> Result<bool> {
        self.inner.gate.restore().await
    }

    pub async fn login(&self, credential: Credential) -> Result<()> {
        self.inner.gate.login(credential).await?;
        self.clear_caches();
        Ok(())
    }

    /// Forget the credential, every cached read, the notification list and
    /// the pending navigation.
    pub async fn logout(&self) -> Result<()> {
        let result = self.inner.gate.logout().await;
        self.clear_caches();
        self.inner.store.clear();
        result
    }

    /// A valid credential for requests the caller issues itself.
    pub async fn ensure_valid(&self) -> Result<Credential> {
        let result = self.inner.gate.ensure_valid().await.map_err(Error::from);
        self.observe(result)
    }

    fn clear_caches(&self) {
        self.inner.caches.invalidate_all();
        self.inner.events.emit(SyncEvent::CachesCleared);
    }

    /// Emit `ReauthRequired` for terminal auth failures and pass the result on.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if result.as_ref().is_err_and(Error::requires_reauth) {
            tracing::warn!("re-authentication required");
            self.inner.events.emit(SyncEvent::ReauthRequired);
        }
        result
    }

    // -- Cached reads -----------------------------------------------------------

    /// Fresh cache hit, else an authenticated fetch, else the stale entry.
    pub async fn fetch_resource(&self, key: &ResourceKey) -> Result<Fetched> {
        let cache = self.inner.caches.for_class(key.class);
        let stale = match cache.lookup(key.path.as_str()) {
            Lookup::Fresh(value) => {
                return Ok(Fetched {
                    value,
                    source: Source::Cache,
                });
            }
            Lookup::Stale(value) => Some(value),
            Lookup::Miss => None,
        };

        match self.remote_fetch(&key.path).await {
            Ok(value) => {
                cache.put(key.path.clone(), value.clone());
                self.inner
                    .events
                    .emit(SyncEvent::CacheStored { key: key.clone() });
                Ok(Fetched {
                    value,
                    source: Source::Network,
                })
            }
            Err(err) if err.requires_reauth() => self.observe(Err(err)),
            Err(err) => match stale {
                Some(value) => {
                    tracing::debug!(path = %key.path, error = %err, "serving stale resource");
                    Ok(Fetched {
                        value,
                        source: Source::Stale,
                    })
                }
                None => Err(err),
            },
        }
    }

    async fn remote_fetch(&self, path: &str) -> Result<Value> {
        let api = &self.inner.resources;
        let timeout = self.inner.request_timeout;
        let fetch = self.inner.gate.authorized(|token| {
            let api = Arc::clone(api);
            async move { api.fetch(&token, path).await }
        });
        tokio::time::timeout(timeout, fetch)
            .await
            .unwrap_or_else(|_| Err(NetworkError::timeout("resource fetch", timeout).into()))
    }

    /// Apply a write and drop every cached read it declares stale.
    pub async fn mutate(&self, mutation: &Mutation) -> Result<Value> {
        let api = &self.inner.resources;
        let timeout = self.inner.request_timeout;
        let call = self.inner.gate.authorized(|token| {
            let api = Arc::clone(api);
            async move { api.mutate(&token, &mutation.path, &mutation.body).await }
        });
        let result = tokio::time::timeout(timeout, call)
            .await
            .unwrap_or_else(|_| Err(NetworkError::timeout("resource mutation", timeout).into()));
        let value = self.observe(result)?;

        for key in &mutation.invalidates {
            if self
                .inner
                .caches
                .for_class(key.class)
                .invalidate(key.path.as_str())
            {
                self.inner
                    .events
                    .emit(SyncEvent::CacheInvalidated { key: key.clone() });
            }
        }
        Ok(value)
    }

    // -- Notifications ------------------------------------------------------------

    /// A live notification arrived out of band.
    pub fn receive_push(&self, record: NotificationRecord) -> bool {
        self.inner.store.add_local(record)
    }

    /// A notification was tapped before its screen exists.
    pub fn open_later(&self, target: NavigationTarget) {
        self.inner.store.set_pending_navigation(target);
    }

    pub async fn sync_notifications(&self, force: bool) -> Result<SyncOutcome> {
        let result = self.inner.store.sync(force).await;
        self.observe(result)
    }

    /// Optimistic mark-read; reverted locally if the server rejects it.
    pub async fn mark_notification_read(&self, content_key: &str) -> Result<()> {
        let result = self.inner.store.mark_read(content_key).await;
        self.observe(result)
    }

    pub async fn dismiss_notification(&self, content_key: &str) -> Result<()> {
        let result = self.inner.store.dismiss(content_key).await;
        self.observe(result)
    }

    pub async fn mark_all_notifications_read(&self) -> Result<()> {
        let result = self.inner.store.mark_all_read().await;
        self.observe(result)
    }

    pub async fn dismiss_all_notifications(&self) -> Result<()> {
        let result = self.inner.store.dismiss_all().await;
        self.observe(result)
    }

    // -- Telemetry ----------------------------------------------------------------

    pub fn track(&self, event: &TelemetryEvent) -> Result<EnqueueOutcome> {
        self.inner.scheduler.enqueue(event)
    }

    // -- Lifecycle ----------------------------------------------------------------

    /// The app became visible: drop expired cache entries and request a
    /// (throttled) notification sync.
    pub async fn on_foreground(&self) -> Result<SyncOutcome> {
        let purged = self.inner.caches.purge_expired();
        tracing::debug!(purged, "app foregrounded");
        self.sync_notifications(false).await
    }

    /// The app is going away: close the telemetry window now.
    pub fn on_background(&self) -> bool {
        self.inner.scheduler.flush_now()
    }

    /// The authentication state changed elsewhere. Signed in: throttled sync.
    /// Signed out: local state is cleared.
    pub async fn on_auth_changed(&self) -> Result<Option<SyncOutcome>> {
        if self.inner.gate.is_authenticated() {
            self.sync_notifications(false).await.map(Some)
        } else {
            self.clear_caches();
            self.inner.store.clear();
            Ok(None)
        }
    }
}

/// Relay store watch channels onto the event bus until shutdown.
async fn forward_store_changes(
    mut version: watch::Receiver<u64>,
    mut pending: watch::Receiver<bool>,
    events: EventBus,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            changed = version.changed() => {
                if changed.is_err() {
                    return;
                }
                let version = *version.borrow_and_update();
                events.emit(SyncEvent::NotificationsChanged { version });
            }
            changed = pending.changed() => {
                if changed.is_err() {
                    return;
                }
                if *pending.borrow_and_update() {
                    events.emit(SyncEvent::PendingNavigation);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStorage;
    use crate::testing::{
        FakeNotificationApi, MemoryResourceApi, RecordingIngest, ScriptedRefreshApi,
        SimulatedServer, expired_credential, server_record, valid_credential,
    };
    use client_sync_core::{AuthError, NotificationKind};
    use serde_json::json;

    struct Rig {
        coordinator: SyncCoordinator,
        refresh: Arc<ScriptedRefreshApi>,
        resources: Arc<MemoryResourceApi>,
        ingest: Arc<RecordingIngest>,
    }

    fn rig() -> Rig {
        let refresh = Arc::new(ScriptedRefreshApi::new(Duration::ZERO));
        let resources = Arc::new(MemoryResourceApi::new());
        let ingest = Arc::new(RecordingIngest::new());
        let coordinator = SyncCoordinator::new(
            &Config::default(),
            Collaborators {
                refresh: refresh.clone(),
                storage: Arc::new(MemoryCredentialStorage::new()),
                notifications: Arc::new(FakeNotificationApi::new()),
                resources: resources.clone(),
                ingest: ingest.clone(),
            },
        )
        .expect("coordinator");
        Rig {
            coordinator,
            refresh,
            resources,
            ingest,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_serves_cache_until_ttl_then_refetches() {
        let rig = rig();
        rig.coordinator.login(valid_credential("a1")).await.expect("login");
        rig.resources.set("agents", json!(["a"]));
        let key = ResourceKey::user("agents");

        let first = rig.coordinator.fetch_resource(&key).await.expect("fetch");
        assert_eq!(first.source, Source::Network);
        let second = rig.coordinator.fetch_resource(&key).await.expect("fetch");
        assert_eq!(second.source, Source::Cache);
        assert_eq!(rig.resources.fetches(), 1);

        tokio::time::advance(Config::default().user_cache_ttl).await;
        let third = rig.coordinator.fetch_resource(&key).await.expect("fetch");
        assert_eq!(third.source, Source::Network);
        assert_eq!(rig.resources.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_covers_a_failed_refetch() {
        let rig = rig();
        rig.coordinator.login(valid_credential("a1")).await.expect("login");
        rig.resources.set("metrics", json!({"open": 3}));
        let key = ResourceKey::metrics("metrics");
        rig.coordinator.fetch_resource(&key).await.expect("fetch");

        tokio::time::advance(Config::default().metrics_cache_ttl).await;
        rig.resources
            .fail_next(NetworkError::Connectivity("offline".into()));
        let fetched = rig.coordinator.fetch_resource(&key).await.expect("stale");
        assert_eq!(fetched.source, Source::Stale);
        assert_eq!(fetched.value, json!({"open": 3}));
    }

    #[tokio::test]
    async fn miss_without_stale_entry_surfaces_error() {
        let rig = rig();
        rig.coordinator.login(valid_credential("a1")).await.expect("login");
        let err = rig
            .coordinator
            .fetch_resource(&ResourceKey::list("absent"))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "HTTP_STATUS");
    }

    #[tokio::test]
    async fn mutation_invalidates_declared_keys() {
        let rig = rig();
        rig.coordinator.login(valid_credential("a1")).await.expect("login");
        rig.resources.set("clients", json!([1]));
        let list = ResourceKey::list("clients");
        rig.coordinator.fetch_resource(&list).await.expect("fetch");
        let mut events = rig.coordinator.subscribe();

        rig.coordinator
            .mutate(&Mutation::new("clients", json!([1, 2])).invalidating(list.clone()))
            .await
            .expect("mutate");
        assert_eq!(
            events.recv().await.expect("event"),
            SyncEvent::CacheInvalidated { key: list.clone() }
        );

        let fetched = rig.coordinator.fetch_resource(&list).await.expect("fetch");
        assert_eq!(fetched.source, Source::Network);
        assert_eq!(fetched.value, json!([1, 2]));
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_once() {
        let rig = rig();
        rig.coordinator.login(valid_credential("a1")).await.expect("login");
        rig.resources.reject_token("a1");
        rig.resources.set("agents", json!([]));

        rig.coordinator
            .fetch_resource(&ResourceKey::list("agents"))
            .await
            .expect("fetch after refresh");
        assert_eq!(rig.refresh.calls(), 1);
        assert_eq!(rig.resources.tokens_seen(), vec!["a1".to_string(), "access-1".to_string()]);
    }

    #[tokio::test]
    async fn terminal_auth_failure_is_broadcast() {
        let rig = rig();
        let mut events = rig.coordinator.subscribe();
        let err = rig.coordinator.ensure_valid().await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::NotAuthenticated)));
        assert_eq!(events.recv().await.expect("event"), SyncEvent::ReauthRequired);
    }

    #[tokio::test]
    async fn rejected_refresh_during_mark_read_asks_for_login() {
        let rig = rig();
        let mut events = rig.coordinator.subscribe();
        rig.coordinator.login(expired_credential("old")).await.expect("login");
        rig.refresh.fail_next(AuthError::InvalidRefreshToken);
        let record = server_record("s1", NotificationKind::Mention, "t", chrono::Utc::now(), false);
        rig.coordinator
            .notifications()
            .sync_from_server(std::slice::from_ref(&record), None);
        let key = record.content_key();

        let err = rig.coordinator.mark_notification_read(&key).await.unwrap_err();
        assert!(err.requires_reauth());
        assert!(!rig.coordinator.notifications().get(&key).expect("record").is_read);

        let reauth = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if events.recv().await.expect("event") == SyncEvent::ReauthRequired {
                    break;
                }
            }
        })
        .await;
        assert!(reauth.is_ok(), "no ReauthRequired event");
    }

    #[tokio::test(start_paused = true)]
    async fn background_flushes_tracked_events() {
        let rig = rig();
        rig.coordinator
            .track(&TelemetryEvent::new("screen_view").with_property("screen", "inbox"))
            .expect("track");
        assert!(rig.coordinator.on_background());
        tokio::time::sleep(Duration::from_millis(1)).await;
        let batches = rig.ingest.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].events[0].payload["name"], json!("screen_view"));
    }

    #[tokio::test]
    async fn logout_clears_local_state() {
        let rig = rig();
        rig.coordinator.login(valid_credential("a1")).await.expect("login");
        rig.resources.set("agents", json!([]));
        rig.coordinator
            .fetch_resource(&ResourceKey::list("agents"))
            .await
            .expect("fetch");
        rig.coordinator.receive_push(NotificationRecord::local(
            NotificationKind::Mention,
            "thread-1",
            chrono::Utc::now(),
        ));
        rig.coordinator.open_later(NavigationTarget::Route { path: "/inbox".into() });

        rig.coordinator.logout().await.expect("logout");
        assert!(!rig.coordinator.gate().is_authenticated());
        assert!(rig.coordinator.notifications().is_empty());
        assert!(rig.coordinator.notifications().peek_pending_navigation().is_none());
        assert_eq!(rig.coordinator.on_auth_changed().await.expect("auth changed"), None);

        rig.coordinator
            .login(valid_credential("a2"))
            .await
            .expect("login");
        rig.coordinator
            .fetch_resource(&ResourceKey::list("agents"))
            .await
            .expect("fetch");
        assert_eq!(rig.resources.fetches(), 2);
    }

    #[tokio::test]
    async fn store_changes_reach_the_event_bus() {
        let rig = rig();
        let mut events = rig.coordinator.subscribe();
        rig.coordinator.receive_push(NotificationRecord::local(
            NotificationKind::System,
            "maintenance",
            chrono::Utc::now(),
        ));
        assert!(matches!(
            events.recv().await.expect("event"),
            SyncEvent::NotificationsChanged { .. }
        ));
        rig.coordinator.open_later(NavigationTarget::Route { path: "/x".into() });
        assert_eq!(events.recv().await.expect("event"), SyncEvent::PendingNavigation);
    }

    #[tokio::test]
    async fn rest_wiring_talks_to_simulated_server() {
        let server = SimulatedServer::new();
        server.push_notification("n1", NotificationKind::Mention, "thread-7");
        server.set_resource("agents", json!(["blue-lake"]));
        let factory = {
            let server = server.clone();
            move |_purpose: &str| server.transport()
        };
        let coordinator = SyncCoordinator::from_transport(
            &Config::default(),
            &factory,
            Arc::new(MemoryCredentialStorage::new()),
        )
        .expect("coordinator");
        coordinator.login(server.login()).await.expect("login");

        // A revoked token forces one refresh through the REST refresh route.
        server.revoke_access_tokens();
        let fetched = coordinator
            .fetch_resource(&ResourceKey::list("agents"))
            .await
            .expect("fetch");
        assert_eq!(fetched.value, json!(["blue-lake"]));
        assert_eq!(server.refresh_calls(), 1);

        assert!(matches!(
            coordinator.on_foreground().await.expect("sync"),
            SyncOutcome::Merged(_)
        ));
        assert_eq!(coordinator.notifications().unread_count(), 1);
    }
}
