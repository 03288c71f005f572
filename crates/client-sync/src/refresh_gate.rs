//! Single-flight credential refresh.
//!
//! When the current credential is expired, the first caller of
//! [`RefreshGate::ensure_valid`] becomes the leader and starts one refresh
//! round; every other caller arriving before the round completes joins it.
//! All registered waiters receive the same outcome.
//!
//! Design:
//! - **Detached round**: the refresh runs on its own tokio task. Dropping or
//!   cancelling any caller, the leader's included, never cancels the round.
//! - **Self-deregistering waiters**: each caller owns a [`WaiterGuard`] that
//!   removes its entry from the registry on drop. Removing an entry that the
//!   round already drained is a no-op.
//! - **Round ownership**: `login`/`logout` abandon the in-flight round. A round
//!   that finishes after being abandoned writes nothing.
//! - **Metrics**: atomic counters for rounds, joins, failures and cancellations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use client_sync_core::{AuthError, Config, Credential, NetworkError, Result};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::api::{CredentialStorage, RefreshApi};

type RoundResult = std::result::Result<Credential, AuthError>;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Default)]
struct GateState {
    current: Option<Credential>,
    /// Id of the round currently in flight, if any.
    in_flight: Option<u64>,
    next_round: u64,
    waiters: HashMap<u64, oneshot::Sender<RoundResult>>,
    next_waiter: u64,
}

impl GateState {
    fn drain_waiters(&mut self) -> Vec<oneshot::Sender<RoundResult>> {
        self.waiters.drain().map(|(_, tx)| tx).collect()
    }
}

#[derive(Debug, Default)]
struct GateCounters {
    rounds_started: AtomicU64,
    joined: AtomicU64,
    failures: AtomicU64,
    cancelled_waiters: AtomicU64,
}

/// Snapshot of refresh gate metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshMetrics {
    /// Refresh network calls started (one per round).
    pub rounds_started: u64,
    /// Callers that joined a round started by someone else.
    pub joined: u64,
    pub failures: u64,
    /// Waiters that went away before their round completed.
    pub cancelled_waiters: u64,
}

struct GateInner {
    api: Arc<dyn RefreshApi>,
    storage: Arc<dyn CredentialStorage>,
    refresh_timeout: Duration,
    expiry_skew: Duration,
    state: Mutex<GateState>,
    /// Serializes credential writes (round commit, login, logout) with their
    /// storage side effects.
    persist: tokio::sync::Mutex<()>,
    counters: GateCounters,
}

impl GateInner {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Waiter registration
// ---------------------------------------------------------------------------

/// A caller blocked on a round. Deregisters itself when dropped.
struct WaiterGuard {
    inner: Arc<GateInner>,
    id: u64,
    rx: oneshot::Receiver<RoundResult>,
}

impl WaiterGuard {
    async fn wait(mut self) -> RoundResult {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::Network(NetworkError::Aborted(
                "credential refresh ended without a result".to_string(),
            ))),
        }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let removed = self.inner.lock().waiters.remove(&self.id).is_some();
        if removed {
            self.inner
                .counters
                .cancelled_waiters
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(waiter = self.id, "refresh waiter deregistered");
        }
    }
}

/// Abandons the round if the refresh task unwinds before committing.
struct RoundGuard {
    inner: Arc<GateInner>,
    round: u64,
    committed: bool,
}

impl Drop for RoundGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut state = self.inner.lock();
        if state.in_flight == Some(self.round) {
            state.in_flight = None;
            // Dropping the senders resolves every waiter with `Aborted`.
            drop(state.drain_waiters());
        }
    }
}

// ---------------------------------------------------------------------------
// RefreshGate
// ---------------------------------------------------------------------------

/// Cloneable handle to the single-flight credential gate.
#[derive(Clone)]
pub struct RefreshGate {
    inner: Arc<GateInner>,
}

impl std::fmt::Debug for RefreshGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("RefreshGate")
            .field("authenticated", &state.current.is_some())
            .field("in_flight", &state.in_flight)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl RefreshGate {
    #[must_use]
    pub fn new(
        api: Arc<dyn RefreshApi>,
        storage: Arc<dyn CredentialStorage>,
        refresh_timeout: Duration,
        expiry_skew: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(GateInner {
                api,
                storage,
                refresh_timeout,
                expiry_skew,
                state: Mutex::new(GateState::default()),
                persist: tokio::sync::Mutex::new(()),
                counters: GateCounters::default(),
            }),
        }
    }

    #[must_use]
    pub fn from_config(
        api: Arc<dyn RefreshApi>,
        storage: Arc<dyn CredentialStorage>,
        config: &Config,
    ) -> Self {
        Self::new(
            api,
            storage,
            config.refresh_timeout,
            config.credential_expiry_skew,
        )
    }

    /// Load the persisted credential, if any. Returns whether one was found.
    pub async fn restore(&self) -> Result<bool> {
        let _persist = self.inner.persist.lock().await;
        let loaded = self.inner.storage.load().await?;
        let found = loaded.is_some();
        if let Some(credential) = loaded {
            self.inner.lock().current = Some(credential);
        }
        tracing::debug!(found, "credential restored from storage");
        Ok(found)
    }

    /// Snapshot of the current credential, valid or not.
    #[must_use]
    pub fn snapshot(&self) -> Option<Credential> {
        self.inner.lock().current.clone()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.lock().current.is_some()
    }

    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.inner.lock().in_flight.is_some()
    }

    /// Number of callers currently blocked on a round.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    #[must_use]
    pub fn metrics(&self) -> RefreshMetrics {
        let c = &self.inner.counters;
        RefreshMetrics {
            rounds_started: c.rounds_started.load(Ordering::Relaxed),
            joined: c.joined.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            cancelled_waiters: c.cancelled_waiters.load(Ordering::Relaxed),
        }
    }

    /// Install a freshly issued credential. Waiters of an in-flight round
    /// receive it immediately; that round's result is discarded.
    pub async fn login(&self, credential: Credential) -> Result<()> {
        let _persist = self.inner.persist.lock().await;
        let waiters = {
            let mut state = self.inner.lock();
            state.current = Some(credential.clone());
            state.in_flight = None;
            state.drain_waiters()
        };
        for tx in waiters {
            let _ = tx.send(Ok(credential.clone()));
        }
        self.inner.storage.save(&credential).await?;
        tracing::info!("credential installed");
        Ok(())
    }

    /// Forget the credential. Waiters of an in-flight round fail with
    /// `NotAuthenticated`, and that round can no longer resurrect it.
    pub async fn logout(&self) -> Result<()> {
        let _persist = self.inner.persist.lock().await;
        let waiters = {
            let mut state = self.inner.lock();
            state.current = None;
            state.in_flight = None;
            state.drain_waiters()
        };
        for tx in waiters {
            let _ = tx.send(Err(AuthError::NotAuthenticated));
        }
        self.inner.storage.clear().await?;
        tracing::info!("credential cleared");
        Ok(())
    }

    /// The server rejected `access_token`. If it is still the current one,
    /// mark it expired so the next [`ensure_valid`](Self::ensure_valid) refreshes.
    pub fn mark_rejected(&self, access_token: &str) -> bool {
        let mut state = self.inner.lock();
        match state.current.as_mut() {
            Some(current) if current.access_token == access_token => {
                current.expire();
                tracing::debug!("access token rejected by server; marked expired");
                true
            }
            _ => false,
        }
    }

    /// Return a valid credential, refreshing it (single-flight) if needed.
    pub async fn ensure_valid(&self) -> std::result::Result<Credential, AuthError> {
        let waiter = {
            let mut state = self.inner.lock();
            let refresh_token = match &state.current {
                None => return Err(AuthError::NotAuthenticated),
                Some(c) if c.is_valid_at(Utc::now(), self.inner.expiry_skew) => {
                    return Ok(c.clone());
                }
                Some(c) => c.refresh_token.clone(),
            };

            let id = state.next_waiter;
            state.next_waiter += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(id, tx);

            if state.in_flight.is_none() {
                let round = state.next_round;
                state.next_round += 1;
                state.in_flight = Some(round);
                self.inner
                    .counters
                    .rounds_started
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(round, "starting credential refresh");
                tokio::spawn(run_round(Arc::clone(&self.inner), round, refresh_token));
            } else {
                self.inner.counters.joined.fetch_add(1, Ordering::Relaxed);
            }

            WaiterGuard {
                inner: Arc::clone(&self.inner),
                id,
                rx,
            }
        };
        waiter.wait().await
    }

    /// Like [`ensure_valid`](Self::ensure_valid), but resolves to
    /// `AuthError::Cancelled` as soon as `cancel` fires. The round itself keeps
    /// running for everyone else.
    pub async fn ensure_valid_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<Credential, AuthError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AuthError::Cancelled),
            result = self.ensure_valid() => result,
        }
    }

    /// Run an authenticated call. On HTTP 401 the token is marked rejected and
    /// the call is retried once with a refreshed credential.
    pub async fn authorized<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = std::result::Result<T, NetworkError>>,
    {
        let credential = self.ensure_valid().await?;
        match call(credential.access_token.clone()).await {
            Err(err) if err.is_unauthorized() => {
                self.mark_rejected(&credential.access_token);
                let credential = self.ensure_valid().await?;
                Ok(call(credential.access_token).await?)
            }
            other => Ok(other?),
        }
    }
}

async fn run_round(inner: Arc<GateInner>, round: u64, refresh_token: String) {
    let mut guard = RoundGuard {
        inner: Arc::clone(&inner),
        round,
        committed: false,
    };

    let outcome =
        match tokio::time::timeout(inner.refresh_timeout, inner.api.refresh(&refresh_token)).await
        {
            Ok(result) => result,
            Err(_) => Err(AuthError::Network(NetworkError::timeout(
                "credential refresh",
                inner.refresh_timeout,
            ))),
        };

    let _persist = inner.persist.lock().await;
    let waiters = {
        let mut state = inner.lock();
        if state.in_flight != Some(round) {
            guard.committed = true;
            tracing::debug!(round, "refresh round abandoned by login/logout");
            return;
        }
        match &outcome {
            Ok(credential) => state.current = Some(credential.clone()),
            Err(AuthError::InvalidRefreshToken) => state.current = None,
            Err(_) => {}
        }
        state.in_flight = None;
        state.drain_waiters()
    };
    guard.committed = true;

    let waiter_count = waiters.len();
    for tx in waiters {
        // A waiter that went away between drain and send is fine.
        let _ = tx.send(outcome.clone());
    }

    let persisted = match &outcome {
        Ok(credential) => {
            tracing::info!(round, waiters = waiter_count, "credential refreshed");
            inner.storage.save(credential).await
        }
        Err(AuthError::InvalidRefreshToken) => {
            inner.counters.failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(round, waiters = waiter_count, "refresh token rejected; re-login required");
            inner.storage.clear().await
        }
        Err(err) => {
            inner.counters.failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(round, waiters = waiter_count, error = %err, "credential refresh failed");
            Ok(())
        }
    };
    if let Err(err) = persisted {
        tracing::warn!(round, error = %err, "failed to persist credential");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
