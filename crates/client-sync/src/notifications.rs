//! Local-first notification log reconciled against server history.
//!
//! Records are keyed by content key (kind, subject, coarse time bucket), so a
//! live push and the same notification pulled from history collapse into one
//! entry. The list is kept newest first.
//!
//! Mutations (`mark_read`, `dismiss`, and the bulk variants) apply locally
//! first and are recorded as overlays. While an overlay is outstanding, a
//! merge does not overwrite that field. When the server call fails, the field
//! is reverted and the error returned. A record without a server id keeps its
//! overlay as a pending intent that is pushed once a sync assigns the id.
//!
//! All state lives behind one mutex; network calls happen outside it. A
//! server call and the settling of its overlays run together on a task the
//! store owns, so a caller that is dropped mid-call only stops waiting.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use client_sync_core::{
    Config, Error, NavigationTarget, NetworkError, NotificationRecord, PendingNavigation, Result,
    ServerHistory, ServerRecord,
};
use indexmap::IndexMap;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::api::NotificationApi;
use crate::refresh_gate::RefreshGate;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Store tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSettings {
    pub sync_min_interval: Duration,
    pub sync_timeout: Duration,
    pub mutation_timeout: Duration,
    pub history_limit: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl StoreSettings {
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            sync_min_interval: config.sync_min_interval,
            sync_timeout: config.sync_timeout,
            mutation_timeout: config.mutation_timeout,
            history_limit: config.history_limit,
        }
    }
}

/// Counts from one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Merged(MergeStats),
    /// A sync started less than `sync_min_interval` ago.
    Throttled,
    /// Another sync is in progress.
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetrics {
    pub syncs: u64,
    pub throttled: u64,
    pub sync_failures: u64,
    pub reverts: u64,
    pub intents_pushed: u64,
}

#[derive(Debug, Default)]
struct StoreCounters {
    syncs: AtomicU64,
    throttled: AtomicU64,
    sync_failures: AtomicU64,
    reverts: AtomicU64,
    intents_pushed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Field {
    Read,
    Dismissed,
}

impl Field {
    const fn get(self, record: &NotificationRecord) -> bool {
        match self {
            Self::Read => record.is_read,
            Self::Dismissed => record.is_dismissed,
        }
    }

    const fn set(self, record: &mut NotificationRecord, value: bool) {
        match self {
            Self::Read => record.is_read = value,
            Self::Dismissed => record.is_dismissed = value,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Dismissed => "dismissed",
        }
    }
}

/// An optimistic write not yet confirmed by the server.
#[derive(Debug, Clone)]
struct Overlay {
    token: u64,
    previous: bool,
    value: bool,
    /// Last value the server reported while this overlay was outstanding.
    server_seen: Option<bool>,
    /// The record had no server id when mutated.
    awaiting_server_id: bool,
}

/// A pending intent whose record just received a server id.
#[derive(Debug, Clone)]
struct ReadyIntent {
    content_key: String,
    field: Field,
    token: u64,
    server_id: String,
}

#[derive(Debug, Clone, Copy)]
enum BulkOp {
    MarkAllRead,
    DismissAll,
}

#[derive(Default)]
struct StoreState {
    records: IndexMap<String, NotificationRecord>,
    overlays: HashMap<(String, Field), Overlay>,
    ready_intents: Vec<ReadyIntent>,
    next_token: u64,
    last_sync_started: Option<Instant>,
    server_unread: Option<usize>,
    pending_nav: Option<PendingNavigation>,
    version: u64,
}

impl StoreState {
    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Newest first. Equal timestamps keep arrival order.
    fn insert_ordered(&mut self, record: NotificationRecord) {
        let idx = self
            .records
            .values()
            .position(|existing| existing.created_at < record.created_at)
            .unwrap_or(self.records.len());
        self.records
            .shift_insert(idx, record.content_key.clone(), record);
    }

    /// Apply `value` optimistically. Returns the overlay's server id, or
    /// `None` if the record has none yet. No-op if already at `value`.
    fn apply(
        &mut self,
        content_key: &str,
        field: Field,
        value: bool,
        token: u64,
    ) -> Option<Option<String>> {
        let record = self.records.get_mut(content_key)?;
        let current = field.get(record);
        if current == value {
            return None;
        }
        field.set(record, value);
        let server_id = record.server_id.clone();
        let overlay = self
            .overlays
            .entry((content_key.to_string(), field))
            .or_insert(Overlay {
                token,
                previous: current,
                value,
                server_seen: None,
                awaiting_server_id: server_id.is_none(),
            });
        overlay.token = token;
        overlay.value = value;
        overlay.awaiting_server_id = server_id.is_none();
        Some(server_id)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct StoreInner {
    api: Arc<dyn NotificationApi>,
    gate: RefreshGate,
    settings: StoreSettings,
    state: Mutex<StoreState>,
    sync_lane: tokio::sync::Mutex<()>,
    version_tx: watch::Sender<u64>,
    nav_tx: watch::Sender<bool>,
    counters: StoreCounters,
}

/// Cloneable handle to the notification log.
#[derive(Clone)]
pub struct NotificationStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for NotificationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("NotificationStore")
            .field("records", &state.records.len())
            .field("overlays", &state.overlays.len())
            .field("version", &state.version)
            .finish_non_exhaustive()
    }
}

impl NotificationStore {
    #[must_use]
    pub fn new(api: Arc<dyn NotificationApi>, gate: RefreshGate, settings: StoreSettings) -> Self {
        let (version_tx, _) = watch::channel(0);
        let (nav_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(StoreInner {
                api,
                gate,
                settings,
                state: Mutex::new(StoreState::default()),
                sync_lane: tokio::sync::Mutex::new(()),
                version_tx,
                nav_tx,
                counters: StoreCounters::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, version: u64) {
        self.inner.version_tx.send_replace(version);
    }

    // -- Queries ------------------------------------------------------------

    /// All records, newest first, dismissed included.
    #[must_use]
    pub fn records(&self) -> Vec<NotificationRecord> {
        self.lock().records.values().cloned().collect()
    }

    /// Records the presentation layer should show.
    #[must_use]
    pub fn visible(&self) -> Vec<NotificationRecord> {
        self.lock()
            .records
            .values()
            .filter(|r| !r.is_dismissed)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get(&self, content_key: &str) -> Option<NotificationRecord> {
        self.lock().records.get(content_key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Unread, non-dismissed records in the local view.
    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.lock()
            .records
            .values()
            .filter(|r| !r.is_read && !r.is_dismissed)
            .count()
    }

    /// Unread count reported by the last successful sync.
    #[must_use]
    pub fn server_unread_count(&self) -> Option<usize> {
        self.lock().server_unread
    }

    /// Outstanding optimistic writes, pending intents included.
    #[must_use]
    pub fn pending_mutations(&self) -> usize {
        self.lock().overlays.len()
    }

    /// Receiver that changes whenever the list changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.version_tx.subscribe()
    }

    /// Receiver that is `true` while a pending navigation is waiting.
    #[must_use]
    pub fn subscribe_pending_navigation(&self) -> watch::Receiver<bool> {
        self.inner.nav_tx.subscribe()
    }

    #[must_use]
    pub fn metrics(&self) -> StoreMetrics {
        let c = &self.inner.counters;
        StoreMetrics {
            syncs: c.syncs.load(Ordering::Relaxed),
            throttled: c.throttled.load(Ordering::Relaxed),
            sync_failures: c.sync_failures.load(Ordering::Relaxed),
            reverts: c.reverts.load(Ordering::Relaxed),
            intents_pushed: c.intents_pushed.load(Ordering::Relaxed),
        }
    }

    // -- Local arrivals -----------------------------------------------------

    /// Insert a record that arrived out-of-band. Returns false if a record
    /// with the same content key is already present.
    pub fn add_local(&self, record: NotificationRecord) -> bool {
        let mut state = self.lock();
        if state.records.contains_key(&record.content_key) {
            return false;
        }
        tracing::debug!(content_key = %record.content_key, kind = record.kind.as_str(), "local notification added");
        state.insert_ordered(record);
        let version = state.bump();
        drop(state);
        self.publish(version);
        true
    }

    // -- Reconciliation -----------------------------------------------------

    /// Merge server records by content key. Idempotent: merging the same
    /// input again changes nothing.
    pub fn sync_from_server(
        &self,
        server_records: &[ServerRecord],
        server_unread_count: Option<usize>,
    ) -> MergeStats {
        let mut stats = MergeStats::default();
        let mut state = self.lock();
        let mut seen: HashSet<String> = HashSet::with_capacity(server_records.len());

        for server in server_records {
            let key = server.content_key();
            if !seen.insert(key.clone()) {
                continue;
            }
            if state.records.contains_key(&key) {
                if merge_existing(&mut state, &key, server) {
                    stats.updated += 1;
                }
            } else if !server.is_dismissed {
                state.insert_ordered(NotificationRecord::from_server(server));
                stats.added += 1;
            }
        }
        state.server_unread = server_unread_count;

        let changed = stats.added + stats.updated > 0;
        let version = if changed { state.bump() } else { state.version };
        drop(state);
        if changed {
            self.publish(version);
        }
        tracing::debug!(added = stats.added, updated = stats.updated, "server history merged");
        stats
    }

    /// Throttled fetch + merge. Failures leave the local list untouched.
    pub async fn sync(&self, force: bool) -> Result<SyncOutcome> {
        let Ok(_lane) = self.inner.sync_lane.try_lock() else {
            tracing::debug!("sync already running");
            return Ok(SyncOutcome::AlreadyRunning);
        };
        {
            let mut state = self.lock();
            let now = Instant::now();
            let recent = state.last_sync_started.is_some_and(|started| {
                now.saturating_duration_since(started) < self.inner.settings.sync_min_interval
            });
            if recent && !force {
                self.inner.counters.throttled.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("sync throttled");
                return Ok(SyncOutcome::Throttled);
            }
            state.last_sync_started = Some(now);
        }
        self.inner.counters.syncs.fetch_add(1, Ordering::Relaxed);

        let history = match self.fetch_history().await {
            Ok(history) => history,
            Err(err) => {
                self.inner
                    .counters
                    .sync_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "notification sync failed");
                return Err(err);
            }
        };
        let stats = self.sync_from_server(&history.records, history.unread_count);
        self.push_pending_intents().await;
        Ok(SyncOutcome::Merged(stats))
    }

    async fn fetch_history(&self) -> Result<ServerHistory> {
        let api = &self.inner.api;
        let limit = self.inner.settings.history_limit;
        let timeout = self.inner.settings.sync_timeout;
        let fetch = self.inner.gate.authorized(|token| {
            let api = Arc::clone(api);
            async move { api.fetch_history(&token, limit).await }
        });
        tokio::time::timeout(timeout, fetch)
            .await
            .unwrap_or_else(|_| Err(NetworkError::timeout("notification sync", timeout).into()))
    }

    /// Push intents whose records received a server id. Failures revert.
    /// Returns the number pushed successfully.
    pub async fn push_pending_intents(&self) -> usize {
        let intents = std::mem::take(&mut self.lock().ready_intents);
        if intents.is_empty() {
            return 0;
        }
        let store = self.clone();
        detached(async move { Ok(store.push_intents(intents).await) })
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "pending intent push aborted");
                0
            })
    }

    async fn push_intents(&self, intents: Vec<ReadyIntent>) -> usize {
        let mut pushed = 0;
        for intent in intents {
            let success = match self.push_field(intent.field, &intent.server_id).await {
                Ok(()) => {
                    pushed += 1;
                    self.inner
                        .counters
                        .intents_pushed
                        .fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(err) => {
                    tracing::warn!(
                        content_key = %intent.content_key,
                        field = intent.field.as_str(),
                        error = %err,
                        "pending intent rejected; reverting"
                    );
                    false
                }
            };
            self.settle(&[(intent.content_key, intent.field)], intent.token, success, false);
        }
        pushed
    }

    // -- Optimistic mutations -----------------------------------------------

    pub async fn mark_read(&self, content_key: &str) -> Result<()> {
        self.mutate(content_key, Field::Read).await
    }

    pub async fn dismiss(&self, content_key: &str) -> Result<()> {
        self.mutate(content_key, Field::Dismissed).await
    }

    pub async fn mark_all_read(&self) -> Result<()> {
        self.bulk(BulkOp::MarkAllRead).await
    }

    /// Dismiss everything. On success the dismissed records are removed.
    pub async fn dismiss_all(&self) -> Result<()> {
        self.bulk(BulkOp::DismissAll).await
    }

    async fn mutate(&self, content_key: &str, field: Field) -> Result<()> {
        let (token, server_id, version) = {
            let mut state = self.lock();
            if !state.records.contains_key(content_key) {
                return Err(Error::not_found("notification", content_key));
            }
            let token = state.token();
            let Some(server_id) = state.apply(content_key, field, true, token) else {
                return Ok(());
            };
            (token, server_id, state.bump())
        };
        self.publish(version);

        let Some(server_id) = server_id else {
            tracing::debug!(content_key, field = field.as_str(), "no server id yet; kept as pending intent");
            return Ok(());
        };

        let store = self.clone();
        let content_key = content_key.to_string();
        detached(async move {
            let result = store.push_field(field, &server_id).await;
            if let Err(err) = &result {
                tracing::warn!(%content_key, field = field.as_str(), error = %err, "mutation failed; reverting");
            }
            store.settle(&[(content_key, field)], token, result.is_ok(), false);
            result
        })
        .await
    }

    async fn bulk(&self, op: BulkOp) -> Result<()> {
        let field = match op {
            BulkOp::MarkAllRead => Field::Read,
            BulkOp::DismissAll => Field::Dismissed,
        };
        let (token, touched, version) = {
            let mut state = self.lock();
            let token = state.token();
            let keys: Vec<String> = state.records.keys().cloned().collect();
            let touched: Vec<(String, Field)> = keys
                .into_iter()
                .filter(|key| state.apply(key, field, true, token).is_some())
                .map(|key| (key, field))
                .collect();
            let version = if touched.is_empty() { None } else { Some(state.bump()) };
            (token, touched, version)
        };
        if let Some(version) = version {
            self.publish(version);
        }

        let store = self.clone();
        detached(async move {
            let api = &store.inner.api;
            let call = store.inner.gate.authorized(|access_token| {
                let api = Arc::clone(api);
                async move {
                    match op {
                        BulkOp::MarkAllRead => api.mark_all_read(&access_token).await,
                        BulkOp::DismissAll => api.dismiss_all(&access_token).await,
                    }
                }
            });
            let timeout = store.inner.settings.mutation_timeout;
            let result = tokio::time::timeout(timeout, call).await.unwrap_or_else(|_| {
                Err(NetworkError::timeout("notification bulk mutation", timeout).into())
            });

            let count = touched.len();
            match &result {
                Ok(()) => tracing::info!(?op, touched = count, "bulk mutation confirmed"),
                Err(err) => {
                    tracing::warn!(?op, touched = count, error = %err, "bulk mutation failed; reverting");
                }
            }
            store.settle(&touched, token, result.is_ok(), matches!(op, BulkOp::DismissAll));
            result
        })
        .await
    }

    async fn push_field(&self, field: Field, server_id: &str) -> Result<()> {
        let api = &self.inner.api;
        let call = self.inner.gate.authorized(|access_token| {
            let api = Arc::clone(api);
            let server_id = server_id.to_string();
            async move {
                match field {
                    Field::Read => api.mark_read(&access_token, &server_id).await,
                    Field::Dismissed => api.dismiss(&access_token, &server_id).await,
                }
            }
        });
        let timeout = self.inner.settings.mutation_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or_else(|_| Err(NetworkError::timeout("notification mutation", timeout).into()))
    }

    /// Resolve the overlays on `targets` that are still owned by `token`.
    /// Success confirms them (keeping intents that still wait for a server
    /// id); failure reverts them to the server's value, or the pre-mutation
    /// value if none was seen. An overlay rewritten by a later mutation
    /// carries a newer token and is left alone.
    fn settle(&self, targets: &[(String, Field)], token: u64, success: bool, purge_dismissed: bool) {
        let mut state = self.lock();
        let mut changed = false;
        let mut reverted = 0u64;
        for (key, field) in targets {
            let (key, field) = (key.clone(), *field);
            let Some(overlay) = state
                .overlays
                .get(&(key.clone(), field))
                .filter(|overlay| overlay.token == token)
                .cloned()
            else {
                continue;
            };
            if success {
                if overlay.awaiting_server_id {
                    continue;
                }
                state.overlays.remove(&(key.clone(), field));
                if purge_dismissed && field == Field::Dismissed {
                    state.overlays.remove(&(key.clone(), Field::Read));
                    changed |= state.records.shift_remove(&key).is_some();
                }
            } else {
                state.overlays.remove(&(key.clone(), field));
                let restore = overlay.server_seen.unwrap_or(overlay.previous);
                if let Some(record) = state.records.get_mut(&key) {
                    if field.get(record) != restore {
                        field.set(record, restore);
                        changed = true;
                        reverted += 1;
                    }
                }
            }
        }
        if reverted > 0 {
            self.inner
                .counters
                .reverts
                .fetch_add(reverted, Ordering::Relaxed);
        }
        let version = changed.then(|| state.bump());
        drop(state);
        if let Some(version) = version {
            self.publish(version);
        }
    }

    // -- Pending navigation -------------------------------------------------

    /// Overwrite the single pending navigation slot.
    pub fn set_pending_navigation(&self, target: NavigationTarget) {
        let replaced = self
            .lock()
            .pending_nav
            .replace(PendingNavigation {
                target,
                set_at: Utc::now(),
            })
            .is_some();
        tracing::debug!(replaced, "pending navigation set");
        self.inner.nav_tx.send_replace(true);
    }

    /// Take the pending navigation, leaving the slot empty.
    pub fn consume_pending_navigation(&self) -> Option<NavigationTarget> {
        let taken = self.lock().pending_nav.take();
        if taken.is_some() {
            self.inner.nav_tx.send_replace(false);
        }
        taken.map(|pending| pending.target)
    }

    #[must_use]
    pub fn peek_pending_navigation(&self) -> Option<PendingNavigation> {
        self.lock().pending_nav.clone()
    }

    /// Forget everything (logout).
    pub fn clear(&self) {
        let mut state = self.lock();
        let version = state.version + 1;
        *state = StoreState {
            version,
            ..StoreState::default()
        };
        drop(state);
        self.publish(version);
        self.inner.nav_tx.send_replace(false);
        tracing::debug!("notification store cleared");
    }
}

/// Run `work` on its own task. Dropping the returned future stops the wait,
/// not the work.
async fn detached<T, F>(work: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work)
        .await
        .unwrap_or_else(|err| Err(Error::Internal(format!("notification task failed: {err}"))))
}

/// Fold a server record into the local one with the same key. Returns
/// whether anything changed.
fn merge_existing(state: &mut StoreState, key: &str, server: &ServerRecord) -> bool {
    let mut changed = false;
    let mut newly_identified = false;

    if let Some(record) = state.records.get_mut(key) {
        if record.server_id.is_none() {
            record.server_id = Some(server.id.clone());
            newly_identified = true;
            changed = true;
        }
        if record.title.is_none() && server.title.is_some() {
            record.title.clone_from(&server.title);
            changed = true;
        }
        if record.body.is_none() && server.body.is_some() {
            record.body.clone_from(&server.body);
            changed = true;
        }
    }

    for (field, server_value) in [
        (Field::Read, server.is_read),
        (Field::Dismissed, server.is_dismissed),
    ] {
        let overlay_key = (key.to_string(), field);
        if let Some(overlay) = state.overlays.get_mut(&overlay_key) {
            overlay.server_seen = Some(server_value);
            if overlay.awaiting_server_id && newly_identified {
                overlay.awaiting_server_id = false;
                if server_value == overlay.value {
                    state.overlays.remove(&overlay_key);
                } else {
                    let token = overlay.token;
                    state.ready_intents.push(ReadyIntent {
                        content_key: key.to_string(),
                        field,
                        token,
                        server_id: server.id.clone(),
                    });
                }
            }
            continue;
        }
        if let Some(record) = state.records.get_mut(key) {
            if field.get(record) != server_value {
                field.set(record, server_value);
                changed = true;
            }
        }
    }
    changed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
