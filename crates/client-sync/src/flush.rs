//! Batched, non-resetting flush of producer events.
//!
//! Events accumulate in an in-memory queue. The first event into an idle
//! scheduler arms a window of `flush_interval`; later events only append and
//! never move the deadline. When the window closes, the whole queue is taken
//! in one snapshot and sent as a single batch.
//!
//! The window timer and the send run on a task spawned onto the runtime
//! captured at construction, owned by the scheduler rather than by whoever
//! called [`FlushScheduler::enqueue`]. Cancelling that caller cannot cancel
//! a scheduled or in-flight flush.
//!
//! A failed batch is reported to the observer and dropped (unless a
//! [`FlushRetryPolicy`] with retries is configured). Events that arrived while
//! flushing re-arm the next window immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use client_sync_core::{Ack, Config, Error, NetworkError, QueuedEvent, Result};
use futures::FutureExt as _;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::api::EventIngest;
use crate::retry::FlushRetryPolicy;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Scheduler phase. At most one window is scheduled or flushing at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Idle,
    Scheduled { deadline: Instant },
    Flushing,
}

impl FlushState {
    /// Apply a transition. `Scheduled -> Scheduled` and every transition not
    /// on the `Idle -> Scheduled -> Flushing -> Idle|Scheduled` cycle are refused.
    pub fn transition(&mut self, next: Self) -> bool {
        let allowed = matches!(
            (*self, next),
            (Self::Idle, Self::Scheduled { .. })
                | (Self::Scheduled { .. }, Self::Flushing)
                | (Self::Flushing, Self::Idle | Self::Scheduled { .. })
        );
        if allowed {
            *self = next;
        }
        allowed
    }

    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The event opened a new window.
    Scheduled,
    /// The event joined the current window (or the queue of an in-flight flush).
    Appended,
    /// The queue is at capacity; the event was not stored.
    QueueFull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Sent(Ack),
    Dropped(NetworkError),
}

/// Result of one flush, delivered to the [`FlushObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Monotonic batch number, starting at 0.
    pub seq: u64,
    pub batch_len: usize,
    pub attempts: u32,
    pub outcome: FlushOutcome,
}

impl FlushReport {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, FlushOutcome::Sent(_))
    }
}

/// Receives a report after every flush. Called from the flush task; must not block.
pub trait FlushObserver: Send + Sync {
    fn on_flush(&self, report: &FlushReport);
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSettings {
    pub flush_interval: Duration,
    pub send_timeout: Duration,
    pub queue_capacity: usize,
    pub retry: FlushRetryPolicy,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl FlushSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            flush_interval: config.flush_interval,
            send_timeout: config.flush_send_timeout,
            queue_capacity: config.flush_queue_capacity,
            retry: FlushRetryPolicy::from_config(config),
        }
    }
}

/// Snapshot of flush counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushMetrics {
    pub enqueued: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub events_sent: u64,
    pub events_dropped: u64,
    pub queue_full: u64,
}

#[derive(Debug, Default)]
struct FlushCounters {
    enqueued: AtomicU64,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
    queue_full: AtomicU64,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct Pending {
    event: QueuedEvent,
    enqueued: Instant,
}

struct Shared {
    queue: Vec<Pending>,
    state: FlushState,
    next_seq: u64,
    /// `flush_now` was requested while a batch was in flight.
    urgent: bool,
}

struct FlushInner {
    ingest: Arc<dyn EventIngest>,
    settings: FlushSettings,
    observer: Option<Arc<dyn FlushObserver>>,
    runtime: Handle,
    shared: Mutex<Shared>,
    wake: Notify,
    counters: FlushCounters,
}

impl FlushInner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move into `Scheduled`. Caller holds the lock.
    fn arm(&self, shared: &mut Shared, deadline: Instant) -> bool {
        // Discard a wake-up left over from a previous window.
        let _ = self.wake.notified().now_or_never();
        shared.state.transition(FlushState::Scheduled { deadline })
    }
}

/// Cloneable handle to the flush pipeline.
#[derive(Clone)]
pub struct FlushScheduler {
    inner: Arc<FlushInner>,
}

impl std::fmt::Debug for FlushScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.lock();
        f.debug_struct("FlushScheduler")
            .field("state", &shared.state)
            .field("queued", &shared.queue.len())
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl FlushScheduler {
    /// Build a scheduler bound to the current tokio runtime.
    pub fn new(ingest: Arc<dyn EventIngest>, settings: FlushSettings) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("flush scheduler needs a tokio runtime: {e}")))?;
        Ok(Self::with_runtime(ingest, settings, runtime))
    }

    /// Build a scheduler whose flush tasks run on `runtime`.
    #[must_use]
    pub fn with_runtime(
        ingest: Arc<dyn EventIngest>,
        settings: FlushSettings,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(FlushInner {
                ingest,
                settings,
                observer: None,
                runtime,
                shared: Mutex::new(Shared {
                    queue: Vec::new(),
                    state: FlushState::Idle,
                    next_seq: 0,
                    urgent: false,
                }),
                wake: Notify::new(),
                counters: FlushCounters::default(),
            }),
        }
    }

    /// Attach an observer. Only valid before the scheduler is shared.
    #[must_use]
    pub fn with_observer(self, observer: Arc<dyn FlushObserver>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.observer = Some(observer);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                tracing::warn!("flush observer ignored: scheduler already shared");
                Self { inner }
            }
        }
    }

    /// Queue one event. Never blocks and never waits for the network.
    pub fn enqueue<T: Serialize + ?Sized>(&self, event: &T) -> Result<EnqueueOutcome> {
        let payload = serde_json::to_value(event)?;
        Ok(self.enqueue_event(QueuedEvent::new(payload)))
    }

    /// Queue an already-built event, keeping its id.
    pub fn enqueue_event(&self, event: QueuedEvent) -> EnqueueOutcome {
        let now = Instant::now();
        let mut shared = self.inner.lock();
        if shared.queue.len() >= self.inner.settings.queue_capacity {
            drop(shared);
            self.inner.counters.queue_full.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                capacity = self.inner.settings.queue_capacity,
                "flush queue full; event rejected"
            );
            return EnqueueOutcome::QueueFull;
        }
        shared.queue.push(Pending {
            event,
            enqueued: now,
        });
        self.inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        if !shared.state.is_idle() {
            return EnqueueOutcome::Appended;
        }
        let deadline = now + self.inner.settings.flush_interval;
        if !self.inner.arm(&mut shared, deadline) {
            return EnqueueOutcome::Appended;
        }
        drop(shared);
        tracing::debug!(
            interval_ms = u64::try_from(self.inner.settings.flush_interval.as_millis())
                .unwrap_or(u64::MAX),
            "flush window scheduled"
        );
        self.inner
            .runtime
            .spawn(run_windows(Arc::clone(&self.inner), deadline));
        EnqueueOutcome::Scheduled
    }

    /// Close the current window early. Returns false if there is nothing queued.
    /// Never opens a second window.
    pub fn flush_now(&self) -> bool {
        let mut shared = self.inner.lock();
        match shared.state {
            FlushState::Scheduled { .. } => {
                self.inner.wake.notify_one();
                true
            }
            FlushState::Flushing => {
                shared.urgent = true;
                true
            }
            FlushState::Idle => false,
        }
    }

    #[must_use]
    pub fn state(&self) -> FlushState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    #[must_use]
    pub fn settings(&self) -> FlushSettings {
        self.inner.settings
    }

    #[must_use]
    pub fn metrics(&self) -> FlushMetrics {
        let c = &self.inner.counters;
        FlushMetrics {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            batches_sent: c.batches_sent.load(Ordering::Relaxed),
            batches_failed: c.batches_failed.load(Ordering::Relaxed),
            events_sent: c.events_sent.load(Ordering::Relaxed),
            events_dropped: c.events_dropped.load(Ordering::Relaxed),
            queue_full: c.queue_full.load(Ordering::Relaxed),
        }
    }
}

/// Puts the scheduler back to `Idle` if a window task unwinds (a panicking
/// observer, runtime shutdown). Events still queued get a fresh window.
struct WindowGuard {
    inner: Arc<FlushInner>,
    finished: bool,
}

impl Drop for WindowGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut shared = self.inner.lock();
        shared.state = FlushState::Idle;
        shared.urgent = false;
        let Some(oldest) = shared.queue.first().map(|p| p.enqueued) else {
            return;
        };
        let deadline = (oldest + self.inner.settings.flush_interval).max(Instant::now());
        if !self.inner.arm(&mut shared, deadline) {
            return;
        }
        drop(shared);
        tracing::warn!("flush window ended abnormally; re-armed for queued events");
        self.inner
            .runtime
            .spawn(run_windows(Arc::clone(&self.inner), deadline));
    }
}

/// Owns windows back to back until the queue is empty.
async fn run_windows(inner: Arc<FlushInner>, first_deadline: Instant) {
    let mut guard = WindowGuard {
        inner: Arc::clone(&inner),
        finished: false,
    };
    let mut deadline = first_deadline;
    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {}
            () = inner.wake.notified() => {}
        }

        let (batch, seq) = {
            let mut shared = inner.lock();
            shared.state.transition(FlushState::Flushing);
            shared.urgent = false;
            let seq = shared.next_seq;
            shared.next_seq += 1;
            (std::mem::take(&mut shared.queue), seq)
        };

        send_batch(&inner, seq, batch).await;

        let mut shared = inner.lock();
        let Some(oldest) = shared.queue.first().map(|p| p.enqueued) else {
            shared.state.transition(FlushState::Idle);
            guard.finished = true;
            return;
        };
        // Events that arrived mid-flush wait at most one interval from arrival.
        let now = Instant::now();
        deadline = if shared.urgent {
            now
        } else {
            (oldest + inner.settings.flush_interval).max(now)
        };
        shared.urgent = false;
        inner.arm(&mut shared, deadline);
        drop(shared);
        tracing::debug!(seq, "flush window re-armed for events queued during send");
    }
}

async fn send_batch(inner: &FlushInner, seq: u64, batch: Vec<Pending>) {
    let events: Vec<QueuedEvent> = batch.into_iter().map(|p| p.event).collect();
    let batch_len = events.len();
    let batch_len_u64 = u64::try_from(batch_len).unwrap_or(u64::MAX);
    let timeout = inner.settings.send_timeout;
    let ingest = &inner.ingest;
    let batch = &events;

    let (result, attempts) = inner
        .settings
        .retry
        .run(|| async move {
            match tokio::time::timeout(timeout, ingest.send_batch(batch)).await {
                Ok(result) => result,
                Err(_) => Err(NetworkError::timeout("event batch send", timeout)),
            }
        })
        .await;

    let outcome = match result {
        Ok(ack) => {
            inner.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
            inner
                .counters
                .events_sent
                .fetch_add(batch_len_u64, Ordering::Relaxed);
            tracing::debug!(seq, batch_len, accepted = ack.accepted, "event batch flushed");
            FlushOutcome::Sent(ack)
        }
        Err(err) => {
            inner.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
            inner
                .counters
                .events_dropped
                .fetch_add(batch_len_u64, Ordering::Relaxed);
            tracing::warn!(seq, batch_len, attempts, error = %err, "event batch dropped");
            FlushOutcome::Dropped(err)
        }
    };

    if let Some(observer) = &inner.observer {
        observer.on_flush(&FlushReport {
            seq,
            batch_len,
            attempts,
            outcome,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
