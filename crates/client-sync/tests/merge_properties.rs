//! Property tests for server-history reconciliation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use client_sync::testing::{FakeNotificationApi, ScriptedRefreshApi, server_record};
use client_sync::{MemoryCredentialStorage, NotificationStore, RefreshGate, StoreSettings};
use client_sync_core::{NotificationKind, NotificationRecord, ServerRecord};
use proptest::prelude::*;

const KINDS: [NotificationKind; 4] = [
    NotificationKind::Message,
    NotificationKind::Mention,
    NotificationKind::Assignment,
    NotificationKind::Reminder,
];

fn store() -> NotificationStore {
    let gate = RefreshGate::new(
        Arc::new(ScriptedRefreshApi::new(Duration::ZERO)),
        Arc::new(MemoryCredentialStorage::new()),
        Duration::from_secs(1),
        Duration::ZERO,
    );
    NotificationStore::new(Arc::new(FakeNotificationApi::new()), gate, StoreSettings::default())
}

/// Small id/subject/time spaces so collisions are common.
fn arb_record() -> impl Strategy<Value = ServerRecord> {
    (0..12u32, 0..KINDS.len(), 0..4u32, 0..600i64, any::<bool>(), prop::bool::weighted(0.1)).prop_map(
        |(id, kind, subject, secs, is_read, is_dismissed)| {
            let created_at = Utc
                .timestamp_opt(1_700_000_000 + secs, 0)
                .single()
                .unwrap_or_else(Utc::now);
            let mut record = server_record(
                &format!("srv-{id}"),
                KINDS[kind].clone(),
                &format!("subject-{subject}"),
                created_at,
                is_read,
            );
            record.is_dismissed = is_dismissed;
            record
        },
    )
}

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    }
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn merging_twice_equals_merging_once(page in prop::collection::vec(arb_record(), 0..40)) {
        let store = store();
        store.sync_from_server(&page, None);
        let once = store.records();
        let second = store.sync_from_server(&page, None);
        prop_assert_eq!(second.added, 0);
        prop_assert_eq!(store.records(), once);
    }

    #[test]
    fn merged_list_has_unique_content_keys(
        pages in prop::collection::vec(prop::collection::vec(arb_record(), 0..20), 1..4),
    ) {
        let store = store();
        for page in &pages {
            store.sync_from_server(page, None);
        }
        let records = store.records();
        let keys: HashSet<&str> = records.iter().map(|r| r.content_key.as_str()).collect();
        prop_assert_eq!(keys.len(), records.len());
    }

    #[test]
    fn local_copy_collapses_into_server_copy(record in arb_record()) {
        prop_assume!(!record.is_dismissed);
        let store = store();
        store.add_local(NotificationRecord::local(
            record.kind.clone(),
            &record.subject_id,
            record.created_at,
        ));
        store.sync_from_server(std::slice::from_ref(&record), None);
        let records = store.records();
        prop_assert_eq!(records.len(), 1);
        prop_assert_eq!(records[0].server_id.as_deref(), Some(record.id.as_str()));
        prop_assert_eq!(records[0].is_read, record.is_read);
    }
}
