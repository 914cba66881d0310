//! Behaviour every `TimelineStore` must share
//!
//! Each check is written once against the trait and instantiated for the
//! sled and in-memory stores.

use digest_core::{Backoff, Delays, RawRecord, ScheduleIndex, TimelineState};
use std::sync::Arc;
use std::thread;
use timeline::{DigestOutcome, MemoryStore, SchedulePolicy, SledStore, StoreError, TimelineStore};

fn policy(timestamp: f64) -> SchedulePolicy {
    SchedulePolicy {
        timestamp,
        delays: Delays {
            minimum_delay: 60.0,
            maximum_delay: 600.0,
            increment_delay: 30.0,
        },
        backoff: Backoff::Linear,
    }
}

fn record(key: &str, value: &str, timestamp: f64) -> RawRecord {
    RawRecord::new(key, value.as_bytes().to_vec(), timestamp)
}

/// Each timeline sits in exactly one index
fn assert_exclusive(store: &dyn TimelineStore, timeline: &str) {
    let waiting = store.entries(ScheduleIndex::Waiting).unwrap();
    let ready = store.entries(ScheduleIndex::Ready).unwrap();
    let in_waiting = waiting.iter().filter(|e| e.timeline == timeline).count();
    let in_ready = ready.iter().filter(|e| e.timeline == timeline).count();

    match store.state(timeline).unwrap() {
        Some(TimelineState::Waiting { due }) => {
            assert_eq!((in_waiting, in_ready), (1, 0));
            assert!(waiting.iter().any(|e| e.timeline == timeline && e.timestamp == due));
        }
        Some(TimelineState::Ready { since }) => {
            assert_eq!((in_waiting, in_ready), (0, 1));
            assert!(ready.iter().any(|e| e.timeline == timeline && e.timestamp == since));
        }
        None => assert_eq!((in_waiting, in_ready), (0, 0)),
    }
}

fn first_add_waits_until_timestamp(store: &dyn TimelineStore) {
    assert!(store.add("t1", &record("a", "v1", 100.0), &policy(100.0)).unwrap());
    assert_eq!(
        store.state("t1").unwrap(),
        Some(TimelineState::Waiting { due: 100.0 })
    );
    assert!(!store.add("t1", &record("b", "v2", 150.0), &policy(150.0)).unwrap());
    assert_eq!(
        store.state("t1").unwrap(),
        Some(TimelineState::Waiting { due: 100.0 })
    );
    assert_eq!(store.live_len("t1").unwrap(), 2);
    assert_exclusive(store, "t1");
}

fn same_key_overwrites(store: &dyn TimelineStore) {
    store.add("t1", &record("a", "old", 100.0), &policy(100.0)).unwrap();
    store.add("t1", &record("a", "new", 120.0), &policy(120.0)).unwrap();
    assert_eq!(store.live_len("t1").unwrap(), 1);

    store.schedule_batch(200.0, 200.0, 10).unwrap();
    let snapshot = store.begin_digest("t1").unwrap();
    assert_eq!(snapshot.records, vec![record("a", "new", 120.0)]);
}

fn schedule_respects_deadline_and_limit(store: &dyn TimelineStore) {
    for (i, due) in [100.0, 200.0, 300.0, 400.0].iter().enumerate() {
        let id = format!("t{i}");
        store.add(&id, &record("a", "v", *due), &policy(*due)).unwrap();
    }

    let batch = store.schedule_batch(300.0, 500.0, 2).unwrap();
    assert_eq!(batch.scanned, 2);
    let moved: Vec<_> = batch.entries.iter().map(|e| e.timeline.as_str()).collect();
    assert_eq!(moved, vec!["t0", "t1"]);
    assert_eq!(batch.entries[0].timestamp, 100.0);

    let batch = store.schedule_batch(300.0, 500.0, 2).unwrap();
    assert_eq!(batch.entries.len(), 1);
    assert!(batch.is_exhausted(2));
    assert_eq!(batch.entries[0].timeline, "t2");

    assert_eq!(
        store.state("t2").unwrap(),
        Some(TimelineState::Ready { since: 500.0 })
    );
    assert_eq!(
        store.state("t3").unwrap(),
        Some(TimelineState::Waiting { due: 400.0 })
    );
    for i in 0..4 {
        assert_exclusive(store, &format!("t{i}"));
    }
}

fn add_while_ready_keeps_schedule(store: &dyn TimelineStore) {
    store.add("t1", &record("a", "v", 100.0), &policy(100.0)).unwrap();
    store.schedule_batch(100.0, 105.0, 10).unwrap();

    assert!(!store.add("t1", &record("b", "v", 110.0), &policy(110.0)).unwrap());
    assert_eq!(
        store.state("t1").unwrap(),
        Some(TimelineState::Ready { since: 105.0 })
    );
    assert_eq!(store.live_len("t1").unwrap(), 2);
}

fn digest_rejects_non_ready(store: &dyn TimelineStore) {
    let err = store.begin_digest("missing").unwrap_err();
    assert!(matches!(err, StoreError::InvalidState { .. }));

    store.add("t1", &record("a", "v", 100.0), &policy(100.0)).unwrap();
    let err = store.begin_digest("t1").unwrap_err();
    assert!(matches!(err, StoreError::InvalidState { .. }));
    assert!(err.to_string().contains("ready"));
}

fn commit_on_empty_deletes(store: &dyn TimelineStore) {
    store.add("t1", &record("a", "v", 100.0), &policy(100.0)).unwrap();
    store.schedule_batch(100.0, 100.0, 10).unwrap();

    let snapshot = store.begin_digest("t1").unwrap();
    assert_eq!(snapshot.records.len(), 1);
    let outcome = store.commit_digest("t1", snapshot.token, &policy(130.0)).unwrap();
    assert_eq!(outcome, DigestOutcome::Deleted);
    assert_eq!(store.state("t1").unwrap(), None);
    assert_exclusive(store, "t1");
}

fn records_added_during_digest_are_rescheduled(store: &dyn TimelineStore) {
    store.add("t1", &record("a", "v1", 100.0), &policy(100.0)).unwrap();
    store.schedule_batch(100.0, 100.0, 10).unwrap();

    let snapshot = store.begin_digest("t1").unwrap();
    store.add("t1", &record("c", "v3", 200.0), &policy(200.0)).unwrap();
    assert_eq!(snapshot.records.len(), 1);

    let outcome = store.commit_digest("t1", snapshot.token, &policy(210.0)).unwrap();
    // one record arrived: minimum 60 + increment 30
    assert_eq!(outcome, DigestOutcome::Rescheduled { due: 300.0 });
    assert_eq!(
        store.state("t1").unwrap(),
        Some(TimelineState::Waiting { due: 300.0 })
    );
    assert_exclusive(store, "t1");

    store.schedule_batch(300.0, 300.0, 10).unwrap();
    let next = store.begin_digest("t1").unwrap();
    assert_eq!(next.records, vec![record("c", "v3", 200.0)]);
}

fn failed_digest_is_merged_into_retry(store: &dyn TimelineStore) {
    store.add("t1", &record("a", "v1", 100.0), &policy(100.0)).unwrap();
    store.add("t1", &record("b", "v2", 101.0), &policy(101.0)).unwrap();
    store.schedule_batch(101.0, 101.0, 10).unwrap();

    let failed = store.begin_digest("t1").unwrap();
    assert_eq!(failed.records.len(), 2);
    // abandoned: no commit
    store.add("t1", &record("c", "v3", 102.0), &policy(102.0)).unwrap();
    store.add("t1", &record("a", "v1-newer", 103.0), &policy(103.0)).unwrap();

    let retry = store.begin_digest("t1").unwrap();
    let keys: Vec<_> = retry.records.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "c", "b"]);
    assert_eq!(retry.records[0].value, b"v1-newer".to_vec());

    let stale = store.commit_digest("t1", failed.token, &policy(110.0)).unwrap_err();
    assert!(matches!(stale, StoreError::InvalidState { .. }));

    let outcome = store.commit_digest("t1", retry.token, &policy(110.0)).unwrap();
    assert_eq!(outcome, DigestOutcome::Deleted);
}

fn maintenance_requeues_stuck_timelines(store: &dyn TimelineStore) {
    store.add("a-stuck", &record("a", "v", 100.0), &policy(100.0)).unwrap();
    store.add("b-fresh", &record("a", "v", 100.0), &policy(100.0)).unwrap();
    store.schedule_batch(100.0, 300.0, 1).unwrap();
    store.schedule_batch(100.0, 900.0, 10).unwrap();

    let batch = store.maintenance_batch(400.0, 1000.0, 10).unwrap();
    assert_eq!(batch.entries.len(), 1);
    assert_eq!(batch.entries[0].timeline, "a-stuck");
    assert_eq!(
        store.state("a-stuck").unwrap(),
        Some(TimelineState::Waiting { due: 1000.0 })
    );
    assert_eq!(
        store.state("b-fresh").unwrap(),
        Some(TimelineState::Ready { since: 900.0 })
    );
    assert_eq!(store.live_len("a-stuck").unwrap(), 1);

    // Ready exactly at the deadline is not yet stuck
    assert!(store.maintenance_batch(900.0, 1000.0, 10).unwrap().entries.is_empty());
    assert_eq!(store.maintenance_batch(900.5, 1000.0, 10).unwrap().entries.len(), 1);
}

fn truncate_drops_oldest(store: &dyn TimelineStore) {
    for i in 0..15 {
        let ts = 100.0 + i as f64;
        store.add("t1", &record(&format!("k{i:02}"), "v", ts), &policy(ts)).unwrap();
    }
    assert_eq!(store.truncate("t1", 10).unwrap(), 5);
    assert_eq!(store.live_len("t1").unwrap(), 10);
    assert_eq!(store.truncate("t1", 10).unwrap(), 0);

    store.schedule_batch(1000.0, 1000.0, 10).unwrap();
    let snapshot = store.begin_digest("t1").unwrap();
    assert_eq!(snapshot.records.len(), 10);
    assert_eq!(snapshot.records.last().unwrap().key, "k05");
    assert_eq!(snapshot.records.first().unwrap().key, "k14");
}

fn delete_removes_everything(store: &dyn TimelineStore) {
    store.add("t1", &record("a", "v", 100.0), &policy(100.0)).unwrap();
    store.add("t2", &record("a", "v", 100.0), &policy(100.0)).unwrap();
    store.delete("t1").unwrap();
    store.delete("never-existed").unwrap();

    assert_eq!(store.state("t1").unwrap(), None);
    assert_eq!(store.live_len("t1").unwrap(), 0);
    assert_exclusive(store, "t1");
    assert!(store.state("t2").unwrap().is_some());

    // Re-adding after delete starts a fresh timeline
    assert!(store.add("t1", &record("b", "v", 200.0), &policy(200.0)).unwrap());
    store.schedule_batch(200.0, 200.0, 10).unwrap();
    let snapshot = store.begin_digest("t1").unwrap();
    assert_eq!(snapshot.records.len(), 1);
    assert_eq!(snapshot.records[0].key, "b");
}

fn backoff_extends_after_first_digest(store: &dyn TimelineStore) {
    store.add("t1", &record("a", "v", 100.0), &policy(100.0)).unwrap();
    store.schedule_batch(100.0, 100.0, 10).unwrap();
    let snapshot = store.begin_digest("t1").unwrap();
    store.add("t1", &record("b", "v", 105.0), &policy(105.0)).unwrap();
    // last_processed = 110, due = 110 + 60 + 30
    store.commit_digest("t1", snapshot.token, &policy(110.0)).unwrap();
    assert_eq!(
        store.state("t1").unwrap(),
        Some(TimelineState::Waiting { due: 200.0 })
    );

    let mut previous = 200.0;
    for i in 0..30 {
        let ts = 120.0 + i as f64;
        store.add("t1", &record(&format!("k{i}"), "v", ts), &policy(ts)).unwrap();
        let Some(TimelineState::Waiting { due }) = store.state("t1").unwrap() else {
            panic!("timeline left waiting");
        };
        assert!(due >= previous);
        assert!(due <= 110.0 + 600.0);
        previous = due;
    }
    assert_eq!(previous, 710.0);
}

fn concurrent_adds_keep_every_record(store: Arc<dyn TimelineStore>) {
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..50 {
                    let key = format!("w{worker}-{i}");
                    let ts = 100.0 + i as f64;
                    store.add("shared", &record(&key, "v", ts), &policy(ts)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.live_len("shared").unwrap(), 200);
    assert_eq!(
        store.state("shared").unwrap(),
        Some(TimelineState::Waiting { due: 100.0 })
    );
    assert_exclusive(store.as_ref(), "shared");
}

macro_rules! store_contract {
    ($module:ident, $make:expr) => {
        mod $module {
            use super::*;

            #[test]
            fn first_add_waits_until_timestamp() {
                super::first_add_waits_until_timestamp(&$make);
            }

            #[test]
            fn same_key_overwrites() {
                super::same_key_overwrites(&$make);
            }

            #[test]
            fn schedule_respects_deadline_and_limit() {
                super::schedule_respects_deadline_and_limit(&$make);
            }

            #[test]
            fn add_while_ready_keeps_schedule() {
                super::add_while_ready_keeps_schedule(&$make);
            }

            #[test]
            fn digest_rejects_non_ready() {
                super::digest_rejects_non_ready(&$make);
            }

            #[test]
            fn commit_on_empty_deletes() {
                super::commit_on_empty_deletes(&$make);
            }

            #[test]
            fn records_added_during_digest_are_rescheduled() {
                super::records_added_during_digest_are_rescheduled(&$make);
            }

            #[test]
            fn failed_digest_is_merged_into_retry() {
                super::failed_digest_is_merged_into_retry(&$make);
            }

            #[test]
            fn maintenance_requeues_stuck_timelines() {
                super::maintenance_requeues_stuck_timelines(&$make);
            }

            #[test]
            fn truncate_drops_oldest() {
                super::truncate_drops_oldest(&$make);
            }

            #[test]
            fn delete_removes_everything() {
                super::delete_removes_everything(&$make);
            }

            #[test]
            fn backoff_extends_after_first_digest() {
                super::backoff_extends_after_first_digest(&$make);
            }

            #[test]
            fn concurrent_adds_keep_every_record() {
                super::concurrent_adds_keep_every_record(Arc::new($make));
            }
        }
    };
}

store_contract!(in_memory, MemoryStore::new());
store_contract!(sled_backed, SledStore::temporary().unwrap());
