//! Scenario runner behind `client-sync-sim`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use client_sync::rest::{RestEventIngest, RestNotificationApi, RestRefreshApi, RestResourceApi};
use client_sync::testing::SimulatedServer;
use client_sync::{
    Collaborators, EventIngest, FlushState, MemoryCredentialStorage, SyncCoordinator, SyncEvent,
};
use client_sync_core::{Ack, Config, NetworkError, NotificationKind, QueuedEvent, TelemetryEvent};
use serde::Serialize;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::Instant;

use crate::CliResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    pub events: usize,
    pub event_interval: Duration,
    /// Server rejects every Kth batch; 0 disables.
    pub fail_every: u64,
    pub latency: Duration,
    pub notifications: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlushRecord {
    /// Milliseconds since the simulation started.
    pub at_ms: u64,
    pub batch_len: usize,
    pub accepted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub events_tracked: usize,
    pub flush_interval_ms: u64,
    pub flushes: Vec<FlushRecord>,
    /// Longest gap between consecutive flush starts.
    pub max_flush_gap_ms: u64,
    pub events_sent: u64,
    pub events_dropped: u64,
    /// Events in batches reported through `SyncEvent::FlushFailed`.
    pub failed_flush_events: usize,
    pub server_batches: u64,
    pub server_ingested_events: usize,
    pub notifications_visible: usize,
    pub notifications_unread: usize,
    pub elapsed_ms: u64,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Time-stamps each batch on its way to the real ingest client.
struct TimedIngest {
    inner: RestEventIngest,
    origin: Instant,
    records: Mutex<Vec<FlushRecord>>,
}

impl TimedIngest {
    fn new(inner: RestEventIngest) -> Self {
        Self {
            inner,
            origin: Instant::now(),
            records: Mutex::new(Vec::new()),
        }
    }

    fn records(&self) -> Vec<FlushRecord> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl EventIngest for TimedIngest {
    async fn send_batch(&self, events: &[QueuedEvent]) -> Result<Ack, NetworkError> {
        let at_ms = millis(self.origin.elapsed());
        let result = self.inner.send_batch(events).await;
        lock(&self.records).push(FlushRecord {
            at_ms,
            batch_len: events.len(),
            accepted: result.as_ref().map_or(0, |ack| ack.accepted),
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }
}

/// Run `scenario` against a fresh simulated server.
pub async fn run(config: &Config, scenario: &Scenario) -> CliResult<SimReport> {
    let server = SimulatedServer::new();
    server.set_fail_every(scenario.fail_every);
    server.set_latency(scenario.latency);
    for i in 0..scenario.notifications {
        let kind = if i % 2 == 0 {
            NotificationKind::Mention
        } else {
            NotificationKind::Message
        };
        server.push_notification(&format!("n{i}"), kind, &format!("thread-{i}"));
    }

    // Telemetry gets a transport of its own.
    let api = server.transport();
    let ingest = Arc::new(TimedIngest::new(RestEventIngest::new(
        server.transport(),
        config.flush_send_timeout,
    )));
    let coordinator = SyncCoordinator::new(
        config,
        Collaborators {
            refresh: Arc::new(RestRefreshApi::new(Arc::clone(&api), config.refresh_timeout)),
            storage: Arc::new(MemoryCredentialStorage::new()),
            notifications: Arc::new(RestNotificationApi::new(
                Arc::clone(&api),
                config.request_timeout,
            )),
            resources: Arc::new(RestResourceApi::new(api, config.request_timeout)),
            ingest: ingest.clone(),
        },
    )?;
    let mut bus = coordinator.subscribe();

    coordinator.login(server.login()).await?;
    if let Err(err) = coordinator.on_foreground().await {
        tracing::warn!(error = %err, "initial notification sync failed");
    }

    let started = Instant::now();
    for seq in 0..scenario.events {
        let event = TelemetryEvent::new("sim_event").with_property("seq", seq);
        coordinator.track(&event)?;
        tokio::time::sleep(scenario.event_interval).await;
    }
    drain(&coordinator, config).await;
    let elapsed = started.elapsed();

    let mut failed_flush_events = 0;
    loop {
        match bus.try_recv() {
            Ok(SyncEvent::FlushFailed { batch_len, .. }) => failed_flush_events += batch_len,
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }

    let flushes = ingest.records();
    let max_flush_gap_ms = flushes
        .windows(2)
        .map(|pair| pair[1].at_ms.saturating_sub(pair[0].at_ms))
        .max()
        .unwrap_or(0);
    let metrics = coordinator.scheduler().metrics();
    let store = coordinator.notifications();
    let report = SimReport {
        events_tracked: scenario.events,
        flush_interval_ms: millis(config.flush_interval),
        flushes,
        max_flush_gap_ms,
        events_sent: metrics.events_sent,
        events_dropped: metrics.events_dropped,
        failed_flush_events,
        server_batches: server.batch_requests(),
        server_ingested_events: server.ingested_events(),
        notifications_visible: store.visible().len(),
        notifications_unread: store.unread_count(),
        elapsed_ms: millis(elapsed),
    };
    tracing::info!(
        flushes = report.flushes.len(),
        events_sent = report.events_sent,
        events_dropped = report.events_dropped,
        "simulation finished"
    );
    Ok(report)
}

/// Wait until the scheduler has sent everything, bounded by one window plus
/// the worst-case send time.
async fn drain(coordinator: &SyncCoordinator, config: &Config) {
    let attempts = config.flush_max_retries + 1;
    let budget = config.flush_interval
        + config.flush_send_timeout * attempts
        + config.flush_retry_max_delay * config.flush_max_retries
        + Duration::from_secs(1);
    let deadline = Instant::now() + budget;
    let scheduler = coordinator.scheduler();
    while Instant::now() < deadline {
        if scheduler.state() == FlushState::Idle && scheduler.queue_len() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    tracing::warn!(queued = scheduler.queue_len(), "flush pipeline did not drain in time");
}
