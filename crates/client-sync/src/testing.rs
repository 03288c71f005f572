//! In-process fakes for the collaborator traits.
//!
//! Used by unit tests, the integration suite and the `client-sync-sim`
//! binary. [`SimulatedServer`] speaks the REST routes over a
//! [`Transport`] so the adapters in [`crate::rest`] can be driven end to end.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use client_sync_core::{
    Ack, AuthError, Credential, NetworkError, NotificationKind, QueuedEvent, ServerHistory,
    ServerRecord,
};
use serde_json::{Value, json};
use tokio::time::Instant;
use uuid::Uuid;

use crate::api::{EventIngest, NotificationApi, RefreshApi, ResourceApi};
use crate::flush::{FlushObserver, FlushReport};
use crate::transport::{Method, Request, Response, Transport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Credential whose access token is `access_token`, valid for an hour.
#[must_use]
pub fn valid_credential(access_token: &str) -> Credential {
    Credential::new(
        access_token,
        format!("refresh-{access_token}"),
        Utc::now() + chrono::Duration::hours(1),
    )
}

/// Credential that expired an hour ago.
#[must_use]
pub fn expired_credential(access_token: &str) -> Credential {
    Credential::new(
        access_token,
        format!("refresh-{access_token}"),
        Utc::now() - chrono::Duration::hours(1),
    )
}

#[must_use]
pub fn server_record(
    id: &str,
    kind: NotificationKind,
    subject_id: &str,
    created_at: chrono::DateTime<Utc>,
    is_read: bool,
) -> ServerRecord {
    ServerRecord {
        id: id.to_string(),
        kind,
        subject_id: subject_id.to_string(),
        created_at,
        is_read,
        is_dismissed: false,
        title: None,
        body: None,
    }
}

// ---------------------------------------------------------------------------
// Refresh
// ---------------------------------------------------------------------------

/// Issues `access-1`, `access-2`, ... after `delay`. Queued failures are
/// returned first, one per call.
pub struct ScriptedRefreshApi {
    delay: Duration,
    calls: AtomicUsize,
    issued: AtomicU64,
    failures: Mutex<VecDeque<AuthError>>,
}

impl ScriptedRefreshApi {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
            issued: AtomicU64::new(0),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn fail_next(&self, error: AuthError) {
        lock(&self.failures).push_back(error);
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RefreshApi for ScriptedRefreshApi {
    async fn refresh(&self, _refresh_token: &str) -> Result<Credential, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        pause(self.delay).await;
        if let Some(err) = lock(&self.failures).pop_front() {
            return Err(err);
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credential::new(
            format!("access-{n}"),
            format!("refresh-{n}"),
            Utc::now() + chrono::Duration::hours(1),
        ))
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// One successfully delivered batch.
#[derive(Debug, Clone)]
pub struct RecordedBatch {
    pub events: Vec<QueuedEvent>,
    /// When the send started.
    pub sent_at: Instant,
}

#[derive(Default)]
struct IngestState {
    batches: Vec<RecordedBatch>,
    failures: VecDeque<NetworkError>,
    attempts: usize,
}

pub struct RecordingIngest {
    delay: Duration,
    state: Mutex<IngestState>,
}

impl Default for RecordingIngest {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingIngest {
    #[must_use]
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            state: Mutex::new(IngestState::default()),
        }
    }

    pub fn fail_next(&self, error: NetworkError) {
        lock(&self.state).failures.push_back(error);
    }

    #[must_use]
    pub fn batches(&self) -> Vec<RecordedBatch> {
        lock(&self.state).batches.clone()
    }

    /// Every call, successful or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        lock(&self.state).attempts
    }

    #[must_use]
    pub fn delivered_events(&self) -> usize {
        lock(&self.state).batches.iter().map(|b| b.events.len()).sum()
    }
}

#[async_trait]
impl EventIngest for RecordingIngest {
    async fn send_batch(&self, events: &[QueuedEvent]) -> Result<Ack, NetworkError> {
        let sent_at = Instant::now();
        let failure = {
            let mut state = lock(&self.state);
            state.attempts += 1;
            state.failures.pop_front()
        };
        pause(self.delay).await;
        if let Some(err) = failure {
            return Err(err);
        }
        lock(&self.state).batches.push(RecordedBatch {
            events: events.to_vec(),
            sent_at,
        });
        Ok(Ack {
            accepted: events.len(),
            duplicates: 0,
        })
    }
}

#[derive(Default)]
pub struct RecordingFlushObserver {
    reports: Mutex<Vec<FlushReport>>,
}

impl RecordingFlushObserver {
    #[must_use]
    pub fn reports(&self) -> Vec<FlushReport> {
        lock(&self.reports).clone()
    }
}

impl FlushObserver for RecordingFlushObserver {
    fn on_flush(&self, report: &FlushReport) {
        lock(&self.reports).push(report.clone());
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeNotificationState {
    history: Vec<ServerRecord>,
    delay: Duration,
    fail_next: Option<NetworkError>,
    read_ids: Vec<String>,
    dismissed_ids: Vec<String>,
    bulk_calls: usize,
    history_calls: usize,
    rejected_ids: HashSet<String>,
}

/// Notification log held in memory. `set_delay` and `fail_next` apply to
/// every method; `reject` fails single-record calls for one id.
#[derive(Default)]
pub struct FakeNotificationApi {
    state: Mutex<FakeNotificationState>,
}

impl FakeNotificationApi {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = delay;
    }

    pub fn fail_next(&self, error: NetworkError) {
        lock(&self.state).fail_next = Some(error);
    }

    pub fn set_history(&self, records: Vec<ServerRecord>) {
        lock(&self.state).history = records;
    }

    /// Answer 500 to every `mark_read`/`dismiss` for `server_id`.
    pub fn reject(&self, server_id: &str) {
        lock(&self.state).rejected_ids.insert(server_id.to_string());
    }

    /// Ids acknowledged by successful `mark_read` calls.
    #[must_use]
    pub fn read_ids(&self) -> Vec<String> {
        lock(&self.state).read_ids.clone()
    }

    #[must_use]
    pub fn dismissed_ids(&self) -> Vec<String> {
        lock(&self.state).dismissed_ids.clone()
    }

    /// `mark_all_read` and `dismiss_all` calls, failed ones included.
    #[must_use]
    pub fn bulk_calls(&self) -> usize {
        lock(&self.state).bulk_calls
    }

    #[must_use]
    pub fn history_calls(&self) -> usize {
        lock(&self.state).history_calls
    }

    async fn begin(&self) -> Result<(), NetworkError> {
        let delay = lock(&self.state).delay;
        pause(delay).await;
        lock(&self.state).fail_next.take().map_or(Ok(()), Err)
    }

    fn check_rejected(&self, server_id: &str) -> Result<(), NetworkError> {
        if lock(&self.state).rejected_ids.contains(server_id) {
            return Err(NetworkError::status(500, format!("{server_id} rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationApi for FakeNotificationApi {
    async fn fetch_history(
        &self,
        _access_token: &str,
        limit: usize,
    ) -> Result<ServerHistory, NetworkError> {
        lock(&self.state).history_calls += 1;
        self.begin().await?;
        let state = lock(&self.state);
        let records: Vec<ServerRecord> = state.history.iter().take(limit).cloned().collect();
        let unread = state
            .history
            .iter()
            .filter(|r| !r.is_read && !r.is_dismissed)
            .count();
        Ok(ServerHistory {
            records,
            unread_count: Some(unread),
        })
    }

    async fn mark_read(&self, _access_token: &str, server_id: &str) -> Result<(), NetworkError> {
        self.begin().await?;
        self.check_rejected(server_id)?;
        let mut state = lock(&self.state);
        if let Some(record) = state.history.iter_mut().find(|r| r.id == server_id) {
            record.is_read = true;
        }
        state.read_ids.push(server_id.to_string());
        Ok(())
    }

    async fn dismiss(&self, _access_token: &str, server_id: &str) -> Result<(), NetworkError> {
        self.begin().await?;
        self.check_rejected(server_id)?;
        let mut state = lock(&self.state);
        if let Some(record) = state.history.iter_mut().find(|r| r.id == server_id) {
            record.is_dismissed = true;
        }
        state.dismissed_ids.push(server_id.to_string());
        Ok(())
    }

    async fn mark_all_read(&self, _access_token: &str) -> Result<(), NetworkError> {
        lock(&self.state).bulk_calls += 1;
        self.begin().await?;
        for record in &mut lock(&self.state).history {
            record.is_read = true;
        }
        Ok(())
    }

    async fn dismiss_all(&self, _access_token: &str) -> Result<(), NetworkError> {
        lock(&self.state).bulk_calls += 1;
        self.begin().await?;
        for record in &mut lock(&self.state).history {
            record.is_dismissed = true;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ResourceState {
    values: HashMap<String, Value>,
    rejected_tokens: HashSet<String>,
    fail_next: Option<NetworkError>,
    fetches: usize,
    mutations: usize,
    tokens_seen: Vec<String>,
}

/// Path-addressed JSON values. Tokens passed to `reject_token` get a 401.
#[derive(Default)]
pub struct MemoryResourceApi {
    state: Mutex<ResourceState>,
}

impl MemoryResourceApi {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: &str, value: Value) {
        lock(&self.state).values.insert(path.to_string(), value);
    }

    pub fn reject_token(&self, token: &str) {
        lock(&self.state).rejected_tokens.insert(token.to_string());
    }

    pub fn fail_next(&self, error: NetworkError) {
        lock(&self.state).fail_next = Some(error);
    }

    #[must_use]
    pub fn fetches(&self) -> usize {
        lock(&self.state).fetches
    }

    #[must_use]
    pub fn mutations(&self) -> usize {
        lock(&self.state).mutations
    }

    #[must_use]
    pub fn tokens_seen(&self) -> Vec<String> {
        lock(&self.state).tokens_seen.clone()
    }

    fn admit(state: &mut ResourceState, access_token: &str) -> Result<(), NetworkError> {
        state.tokens_seen.push(access_token.to_string());
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        if state.rejected_tokens.contains(access_token) {
            return Err(NetworkError::status(401, "token rejected"));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceApi for MemoryResourceApi {
    async fn fetch(&self, access_token: &str, path: &str) -> Result<Value, NetworkError> {
        let mut state = lock(&self.state);
        state.fetches += 1;
        Self::admit(&mut state, access_token)?;
        state
            .values
            .get(path)
            .cloned()
            .ok_or_else(|| NetworkError::status(404, "no such resource"))
    }

    async fn mutate(
        &self,
        access_token: &str,
        path: &str,
        body: &Value,
    ) -> Result<Value, NetworkError> {
        let mut state = lock(&self.state);
        state.mutations += 1;
        Self::admit(&mut state, access_token)?;
        state.values.insert(path.to_string(), body.clone());
        Ok(body.clone())
    }
}

// ---------------------------------------------------------------------------
// Simulated REST server
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ServerData {
    access_tokens: HashSet<String>,
    issued: u64,
    notifications: Vec<ServerRecord>,
    resources: HashMap<String, Value>,
    seen_events: HashSet<Uuid>,
    batch_requests: u64,
    failed_batches: u64,
    fail_every: Option<u64>,
    latency: Duration,
    refresh_calls: u64,
}

/// Tiny in-memory implementation of the REST routes in [`crate::rest`].
#[derive(Clone, Default)]
pub struct SimulatedServer {
    data: Arc<Mutex<ServerData>>,
}

impl SimulatedServer {
    /// The only refresh token the server accepts.
    pub const REFRESH_TOKEN: &'static str = "sim-refresh-token";
    pub const ACCESS_TOKEN_TTL_SECS: i64 = 3600;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport bound to this server. Each call returns a new instance.
    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(SimulatedTransport {
            server: self.clone(),
        })
    }

    /// Latency added to every request.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.data).latency = latency;
    }

    /// Answer every `n`th event batch with a 503. Zero disables.
    pub fn set_fail_every(&self, n: u64) {
        lock(&self.data).fail_every = (n > 0).then_some(n);
    }

    #[must_use]
    pub fn issue_access_token(&self) -> String {
        let mut data = lock(&self.data);
        data.issued += 1;
        let token = format!("access-{}", data.issued);
        data.access_tokens.insert(token.clone());
        token
    }

    /// A credential the server will honour.
    #[must_use]
    pub fn login(&self) -> Credential {
        Credential::new(
            self.issue_access_token(),
            Self::REFRESH_TOKEN,
            Utc::now() + chrono::Duration::seconds(Self::ACCESS_TOKEN_TTL_SECS),
        )
    }

    #[must_use]
    pub fn is_valid_access_token(&self, token: &str) -> bool {
        lock(&self.data).access_tokens.contains(token)
    }

    /// Invalidate every issued access token, as after a server-side rotation.
    pub fn revoke_access_tokens(&self) {
        lock(&self.data).access_tokens.clear();
    }

    pub fn push_notification(&self, id: &str, kind: NotificationKind, subject_id: &str) {
        self.push_record(ServerRecord {
            id: id.to_string(),
            kind,
            subject_id: subject_id.to_string(),
            created_at: Utc::now(),
            is_read: false,
            is_dismissed: false,
            title: None,
            body: None,
        });
    }

    /// Newest first, matching the history route.
    pub fn push_record(&self, record: ServerRecord) {
        let mut data = lock(&self.data);
        data.notifications.push(record);
        data.notifications
            .sort_by(|a, b| b.created_at.cmp(&a.created_at));
    }

    pub fn set_resource(&self, path: &str, value: Value) {
        lock(&self.data)
            .resources
            .insert(path.trim_start_matches('/').to_string(), value);
    }

    /// Unique event ids accepted so far.
    #[must_use]
    pub fn ingested_events(&self) -> usize {
        lock(&self.data).seen_events.len()
    }

    #[must_use]
    pub fn batch_requests(&self) -> u64 {
        lock(&self.data).batch_requests
    }

    #[must_use]
    pub fn failed_batches(&self) -> u64 {
        lock(&self.data).failed_batches
    }

    #[must_use]
    pub fn refresh_calls(&self) -> u64 {
        lock(&self.data).refresh_calls
    }

    fn handle(&self, request: &Request) -> Response {
        let (path, query) = request
            .path
            .split_once('?')
            .unwrap_or((request.path.as_str(), ""));
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let mut data = lock(&self.data);

        match (request.method, segments.as_slice()) {
            (Method::Post, ["auth", "refresh"]) => Self::refresh(&mut data, request),
            (Method::Post, ["events", "batch"]) => Self::ingest(&mut data, request),
            _ => {
                let authorized = request
                    .bearer
                    .as_ref()
                    .is_some_and(|t| data.access_tokens.contains(t));
                if !authorized {
                    return error(401, "unauthorized");
                }
                Self::route_authorized(&mut data, request, &segments, query)
            }
        }
    }

    fn route_authorized(
        data: &mut ServerData,
        request: &Request,
        segments: &[&str],
        query: &str,
    ) -> Response {
        match (request.method, segments) {
            (Method::Get, ["notifications"]) => {
                let limit = query
                    .split('&')
                    .find_map(|pair| pair.strip_prefix("limit="))
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(usize::MAX);
                let records: Vec<&ServerRecord> = data.notifications.iter().take(limit).collect();
                let unread = data
                    .notifications
                    .iter()
                    .filter(|r| !r.is_read && !r.is_dismissed)
                    .count();
                Response::ok(json!({ "records": records, "unread_count": unread }))
            }
            (Method::Post, ["notifications", "read-all"]) => {
                for record in &mut data.notifications {
                    record.is_read = true;
                }
                Response::ok(json!({}))
            }
            (Method::Post, ["notifications", "dismiss-all"]) => {
                for record in &mut data.notifications {
                    record.is_dismissed = true;
                }
                Response::ok(json!({}))
            }
            (Method::Post, ["notifications", id, action @ ("read" | "dismiss")]) => {
                let Some(record) = data.notifications.iter_mut().find(|r| r.id == *id) else {
                    return error(404, "no such notification");
                };
                if *action == "read" {
                    record.is_read = true;
                } else {
                    record.is_dismissed = true;
                }
                Response::ok(json!({}))
            }
            (Method::Get, ["resources", rest @ ..]) if !rest.is_empty() => {
                data.resources
                    .get(&rest.join("/"))
                    .cloned()
                    .map_or_else(|| error(404, "no such resource"), Response::ok)
            }
            (Method::Post, ["resources", rest @ ..]) if !rest.is_empty() => {
                let body = request.body.clone().unwrap_or(Value::Null);
                data.resources.insert(rest.join("/"), body.clone());
                Response::ok(body)
            }
            _ => error(404, "no such route"),
        }
    }

    fn refresh(data: &mut ServerData, request: &Request) -> Response {
        data.refresh_calls += 1;
        let presented = request
            .body
            .as_ref()
            .and_then(|b| b.get("refresh_token"))
            .and_then(Value::as_str);
        if presented != Some(Self::REFRESH_TOKEN) {
            return error(401, "invalid refresh token");
        }
        data.issued += 1;
        let token = format!("access-{}", data.issued);
        data.access_tokens.insert(token.clone());
        Response::ok(json!({
            "access_token": token,
            "expires_in": Self::ACCESS_TOKEN_TTL_SECS,
        }))
    }

    fn ingest(data: &mut ServerData, request: &Request) -> Response {
        data.batch_requests += 1;
        if data
            .fail_every
            .is_some_and(|n| data.batch_requests % n == 0)
        {
            data.failed_batches += 1;
            return error(503, "ingest unavailable");
        }
        let events: Vec<QueuedEvent> = match request
            .body
            .as_ref()
            .and_then(|b| b.get("events"))
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(events)) => events,
            _ => return error(400, "malformed batch"),
        };
        let mut ack = Ack::default();
        for event in events {
            if data.seen_events.insert(event.id) {
                ack.accepted += 1;
            } else {
                ack.duplicates += 1;
            }
        }
        Response::ok(json!(ack))
    }
}

fn error(status: u16, message: &str) -> Response {
    Response::new(status, json!({ "error": message }))
}

struct SimulatedTransport {
    server: SimulatedServer,
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn send(&self, request: Request, timeout: Duration) -> Result<Response, NetworkError> {
        let latency = lock(&self.server.data).latency;
        if latency >= timeout {
            pause(timeout).await;
            return Err(NetworkError::timeout(
                &format!("{} {}", request.method.as_str(), request.path),
                timeout,
            ));
        }
        pause(latency).await;
        Ok(self.server.handle(&request))
    }
}
