//! End-to-end checks of the behavioural guarantees of each component,
//! driven through the public API with in-process fakes and a paused clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use client_sync::testing::{
    FakeNotificationApi, RecordingIngest, ScriptedRefreshApi, expired_credential, server_record,
    valid_credential,
};
use client_sync::{
    ExpiringCache, FlushRetryPolicy, FlushScheduler, FlushSettings, FlushState,
    MemoryCredentialStorage, NotificationStore, RefreshGate, StoreSettings,
};
use client_sync_core::{NavigationTarget, NetworkError, NotificationKind};
use serde_json::json;

fn gate(api: Arc<ScriptedRefreshApi>) -> RefreshGate {
    RefreshGate::new(
        api,
        Arc::new(MemoryCredentialStorage::new()),
        Duration::from_secs(15),
        Duration::ZERO,
    )
}

async fn signed_in_store(api: Arc<FakeNotificationApi>) -> NotificationStore {
    let gate = gate(Arc::new(ScriptedRefreshApi::new(Duration::ZERO)));
    gate.login(valid_credential("token")).await.expect("login");
    NotificationStore::new(api, gate, StoreSettings::default())
}

// ---------------------------------------------------------------------------
// Cache freshness
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cache_value_is_fresh_for_exactly_one_ttl() {
    let ttl = Duration::from_secs(60);
    let cache = ExpiringCache::new("user", ttl, 16);
    cache.put("client:42".to_string(), 7);

    assert_eq!(cache.get("client:42"), Some(7));
    tokio::time::advance(ttl - Duration::from_millis(1)).await;
    assert_eq!(cache.get("client:42"), Some(7));
    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(cache.get("client:42"), None);

    // A new put restarts the clock.
    cache.put("client:42".to_string(), 8);
    assert_eq!(cache.get("client:42"), Some(8));
}

// ---------------------------------------------------------------------------
// Single-flight refresh and cancellation safety
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_refresh() {
    let api = Arc::new(ScriptedRefreshApi::new(Duration::from_millis(250)));
    let gate = gate(Arc::clone(&api));
    gate.login(expired_credential("stale")).await.expect("login");

    let callers: Vec<_> = (0..25)
        .map(|_| {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ensure_valid().await })
        })
        .collect();

    let mut tokens = Vec::new();
    for caller in callers {
        tokens.push(caller.await.expect("join").expect("refresh").access_token);
    }
    assert_eq!(api.calls(), 1);
    assert!(tokens.iter().all(|t| t == "access-1"));
    assert_eq!(gate.metrics().rounds_started, 1);
    assert_eq!(gate.metrics().joined, 24);
}

#[tokio::test(start_paused = true)]
async fn cancelled_waiters_leave_no_trace() {
    let api = Arc::new(ScriptedRefreshApi::new(Duration::from_millis(250)));
    let gate = gate(Arc::clone(&api));
    gate.login(expired_credential("stale")).await.expect("login");

    let callers: Vec<_> = (0..10)
        .map(|_| {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ensure_valid().await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gate.waiter_count(), 10);

    // Cancel every other caller, the leader included.
    let mut survivors = Vec::new();
    for (i, caller) in callers.into_iter().enumerate() {
        if i % 2 == 0 {
            caller.abort();
            assert!(caller.await.expect_err("aborted").is_cancelled());
        } else {
            survivors.push(caller);
        }
    }
    assert_eq!(gate.waiter_count(), 5);

    for survivor in survivors {
        let cred = survivor.await.expect("join").expect("refresh");
        assert_eq!(cred.access_token, "access-1");
    }
    assert_eq!(api.calls(), 1);
    assert_eq!(gate.waiter_count(), 0);
    assert!(!gate.is_refreshing());
    assert_eq!(gate.metrics().cancelled_waiters, 5);
}

// ---------------------------------------------------------------------------
// Flush scheduling
// ---------------------------------------------------------------------------

fn flush_settings(interval: Duration) -> FlushSettings {
    FlushSettings {
        flush_interval: interval,
        send_timeout: Duration::from_secs(10),
        queue_capacity: 10_000,
        retry: FlushRetryPolicy::default(),
    }
}

#[tokio::test(start_paused = true)]
async fn continuous_enqueue_never_postpones_the_flush() {
    let interval = Duration::from_secs(2);
    let ingest = Arc::new(RecordingIngest::new());
    let scheduler =
        FlushScheduler::new(ingest.clone(), flush_settings(interval)).expect("scheduler");
    let start = tokio::time::Instant::now();

    // 50 events, one every 200ms: ten seconds of continuous load.
    let mut enqueued_at = Vec::new();
    for i in 0..50 {
        enqueued_at.push(tokio::time::Instant::now());
        scheduler.enqueue(&json!({ "i": i })).expect("enqueue");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_secs(3)).await;

    let batches = ingest.batches();
    assert_eq!(batches.len(), 5, "one flush per ~2s window");
    assert!(
        batches
            .iter()
            .filter(|b| b.sent_at - start <= Duration::from_secs(10))
            .count()
            >= 4
    );

    let mut seen = Vec::new();
    for batch in &batches[..batches.len() - 1] {
        // A full window holds 10 events, 11 when one lands on the boundary.
        assert!((10..=11).contains(&batch.events.len()), "batch of {}", batch.events.len());
    }
    for batch in &batches {
        for event in &batch.events {
            let i = usize::try_from(event.payload["i"].as_u64().expect("index")).expect("index");
            assert!(batch.sent_at - enqueued_at[i] <= interval, "event {i} waited too long");
            seen.push(i);
        }
    }
    // Every event exactly once, in enqueue order.
    assert_eq!(seen, (0..50).collect::<Vec<_>>());
    assert_eq!(scheduler.state(), FlushState::Idle);
}

#[tokio::test(start_paused = true)]
async fn aborting_the_producer_does_not_cancel_its_flush() {
    let ingest = Arc::new(RecordingIngest::new());
    let scheduler = FlushScheduler::new(ingest.clone(), flush_settings(Duration::from_secs(2)))
        .expect("scheduler");

    let producer = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler.enqueue(&json!("screen_closed")).expect("enqueue");
            std::future::pending::<()>().await;
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    producer.abort();
    let _ = producer.await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    let batches = ingest.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].events[0].payload, json!("screen_closed"));
}

#[tokio::test(start_paused = true)]
async fn aborting_the_producer_mid_send_does_not_cancel_it() {
    let ingest = Arc::new(RecordingIngest::with_delay(Duration::from_millis(500)));
    let scheduler = FlushScheduler::new(ingest.clone(), flush_settings(Duration::from_millis(100)))
        .expect("scheduler");

    let producer = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler.enqueue(&json!(1)).expect("enqueue");
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(scheduler.state(), FlushState::Flushing);
    producer.abort();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(ingest.batches().len(), 1);
    assert_eq!(scheduler.metrics().events_sent, 1);
}

// ---------------------------------------------------------------------------
// Reconciling store
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_merge_changes_nothing() {
    let store = signed_in_store(Arc::new(FakeNotificationApi::new())).await;
    let at = |s: i64| Utc.timestamp_opt(1_700_000_000 + s, 0).single().expect("ts");
    let page = vec![
        server_record("s1", NotificationKind::Message, "a", at(0), false),
        server_record("s2", NotificationKind::Mention, "b", at(90), true),
        server_record("s3", NotificationKind::Reminder, "c", at(400), false),
    ];
    store.sync_from_server(&page, Some(2));
    let once = store.records();
    store.sync_from_server(&page, Some(2));
    assert_eq!(store.records(), once);
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn failed_mark_read_restores_previous_flag() {
    let api = Arc::new(FakeNotificationApi::new());
    let store = signed_in_store(Arc::clone(&api)).await;
    let record = server_record("s1", NotificationKind::Mention, "t", Utc::now(), false);
    store.sync_from_server(std::slice::from_ref(&record), None);
    let key = record.content_key();

    api.fail_next(NetworkError::Timeout("mark read".into()));
    assert!(store.mark_read(&key).await.is_err());
    assert!(!store.get(&key).expect("record").is_read);

    let read = server_record("s2", NotificationKind::Mention, "u", Utc::now(), true);
    store.sync_from_server(std::slice::from_ref(&read), None);
    api.fail_next(NetworkError::Timeout("dismiss".into()));
    assert!(store.dismiss(&read.content_key()).await.is_err());
    let after = store.get(&read.content_key()).expect("record");
    assert!(after.is_read);
    assert!(!after.is_dismissed);
}

#[tokio::test(start_paused = true)]
async fn cancelled_mark_read_still_reaches_the_server() {
    let api = Arc::new(FakeNotificationApi::new());
    let store = signed_in_store(Arc::clone(&api)).await;
    let unread = server_record("s1", NotificationKind::Mention, "t", Utc::now(), false);
    api.set_history(vec![unread.clone()]);
    store.sync(true).await.expect("initial sync");
    let key = unread.content_key();

    api.set_delay(Duration::from_millis(500));
    let caller = {
        let store = store.clone();
        let key = key.clone();
        tokio::spawn(async move { store.mark_read(&key).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    caller.abort();
    assert!(caller.await.expect_err("aborted").is_cancelled());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(api.read_ids(), vec!["s1".to_string()]);
    assert_eq!(store.pending_mutations(), 0);
    assert!(store.get(&key).expect("record").is_read);

    // Local and server agree on every later sync.
    api.set_delay(Duration::ZERO);
    for _ in 0..3 {
        store.sync(true).await.expect("sync");
        assert!(store.get(&key).expect("record").is_read);
    }
}

#[tokio::test]
async fn pending_navigation_keeps_only_the_newest() {
    let store = signed_in_store(Arc::new(FakeNotificationApi::new())).await;
    let a = NavigationTarget::Subject {
        kind: NotificationKind::Mention,
        subject_id: "thread-a".into(),
    };
    let b = NavigationTarget::Subject {
        kind: NotificationKind::Mention,
        subject_id: "thread-b".into(),
    };
    store.set_pending_navigation(a);
    store.set_pending_navigation(b.clone());
    assert_eq!(store.consume_pending_navigation(), Some(b));
    assert_eq!(store.consume_pending_navigation(), None);
}
