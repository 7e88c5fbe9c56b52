//! End-to-end tests for logbee.
//!
//! Each test opens its own in-memory log and drives the tree through the
//! public API only: writes, views, queries, and the failure modes a log can
//! throw at a tree (read-only replicas, failed appends, missing records,
//! truncation).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use logbee::{
    Bee, BeeError, BeeOptions, Entry, HistoryKind, HistoryOptions, Log, MemoryLog, RangeOptions,
    WriteOptions,
};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn open() -> (Arc<MemoryLog>, Bee) {
    let log = Arc::new(MemoryLog::new());
    let bee = Bee::new(log.clone(), BeeOptions::default());
    (log, bee)
}

fn key(i: usize) -> Vec<u8> {
    format!("k{i:03}").into_bytes()
}

async fn fill(bee: &Bee, n: usize) {
    for i in 0..n {
        bee.put(&key(i), format!("v{i}").as_bytes()).await.unwrap();
    }
}

async fn pairs(bee: &Bee) -> Vec<(Bytes, Bytes)> {
    bee.range(RangeOptions::new())
        .collect()
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.key, e.value.unwrap()))
        .collect()
}

/// Fails the test instead of hanging when a write waits on a leaked lock.
async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("tree lock was not released")
}

// ---------------------------------------------------------------------------
// Shape
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ninth_key_splits_the_root() {
    let (_log, bee) = open();
    fill(&bee, 8).await;
    let report = bee.check().await.unwrap();
    assert!(report.is_ok(), "{:?}", report.violations);
    assert_eq!((report.depth, report.nodes, report.keys), (1, 1, 8));

    fill(&bee, 9).await;
    let report = bee.check().await.unwrap();
    assert!(report.is_ok(), "{:?}", report.violations);
    assert_eq!((report.depth, report.nodes, report.keys), (2, 3, 9));
}

#[tokio::test]
async fn shuffled_inserts_and_deletes_keep_the_tree_balanced() {
    let (_log, bee) = open();
    let mut rng = StdRng::seed_from_u64(7);
    let mut order: Vec<usize> = (0..400).collect();
    order.shuffle(&mut rng);

    for &i in &order {
        bee.put(&key(i), b"x").await.unwrap();
    }
    let report = bee.check().await.unwrap();
    assert!(report.is_ok(), "{:?}", report.violations);
    assert_eq!(report.keys, 400);

    order.shuffle(&mut rng);
    for &i in &order[..350] {
        bee.del(&key(i)).await.unwrap();
    }
    let report = bee.check().await.unwrap();
    assert!(report.is_ok(), "{:?}", report.violations);
    assert_eq!(report.keys, 50);

    let mut left: Vec<usize> = order[350..].to_vec();
    left.sort_unstable();
    let keys: Vec<Bytes> = pairs(&bee).await.into_iter().map(|(k, _)| k).collect();
    let expected: Vec<Bytes> = left.into_iter().map(|i| Bytes::from(key(i))).collect();
    assert_eq!(keys, expected);
}

// ---------------------------------------------------------------------------
// Reads and Writes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn put_overwrite_and_delete() {
    let (_log, bee) = open();
    bee.put(b"a", b"1").await.unwrap();
    bee.put(b"a", b"2").await.unwrap();

    let entry = bee.get(b"a").await.unwrap().unwrap();
    assert_eq!(entry.value.as_deref(), Some(&b"2"[..]));
    assert_eq!(entry.seq, 2);

    bee.del(b"a").await.unwrap();
    assert_eq!(bee.get(b"a").await.unwrap(), None);
    assert_eq!(bee.version(), 4);

    // Deleting an absent key appends nothing.
    bee.del(b"a").await.unwrap();
    assert_eq!(bee.version(), 4);
}

#[tokio::test]
async fn rejected_cas_keeps_the_stored_value() {
    let (_log, bee) = open();
    bee.put(b"a", b"1").await.unwrap();
    let version = bee.version();

    let never = WriteOptions::with_cas(|_: &Entry, _: &Entry| false);
    bee.put_with(b"a", b"2", never.clone()).await.unwrap();
    bee.del_with(b"a", never).await.unwrap();

    assert_eq!(bee.version(), version);
    let entry = bee.get(b"a").await.unwrap().unwrap();
    assert_eq!(entry.value.as_deref(), Some(&b"1"[..]));

    let only_upgrades =
        WriteOptions::with_cas(|prev: &Entry, next: &Entry| next.value > prev.value);
    bee.put_with(b"a", b"0", only_upgrades.clone()).await.unwrap();
    bee.put_with(b"a", b"9", only_upgrades).await.unwrap();
    let entry = bee.get(b"a").await.unwrap().unwrap();
    assert_eq!(entry.value.as_deref(), Some(&b"9"[..]));
}

#[tokio::test]
async fn duplicate_puts_are_skipped_when_asked() {
    let log = Arc::new(MemoryLog::new());
    let bee = Bee::new(
        log.clone(),
        BeeOptions {
            always_duplicate: false,
            ..BeeOptions::default()
        },
    );
    bee.put(b"a", b"1").await.unwrap();
    let version = bee.version();
    bee.put(b"a", b"1").await.unwrap();
    assert_eq!(bee.version(), version);
    bee.put(b"a", b"2").await.unwrap();
    assert_eq!(bee.version(), version + 1);
}

#[tokio::test]
async fn deleting_an_absent_key_appends_nothing() {
    for always_duplicate in [true, false] {
        let log = Arc::new(MemoryLog::new());
        let bee = Bee::new(
            log.clone(),
            BeeOptions {
                always_duplicate,
                ..BeeOptions::default()
            },
        );
        bee.put(b"a", b"1").await.unwrap();
        let version = bee.version();
        bee.del(b"missing").await.unwrap();
        assert_eq!(bee.version(), version);
        bee.put(b"a", b"1").await.unwrap();
        let expected = if always_duplicate { version + 1 } else { version };
        assert_eq!(bee.version(), expected);
    }
}

#[tokio::test]
async fn a_batch_lands_in_one_append() {
    let (log, bee) = open();
    bee.put(b"seed", b"0").await.unwrap();

    let mut batch = bee.batch();
    for i in 0..30 {
        batch.put(&key(i), b"b").await.unwrap();
    }
    batch.del(&key(3)).await.unwrap();
    assert_eq!(batch.get(&key(3)).await.unwrap(), None);
    assert_eq!(log.length(), 2);
    batch.flush().await.unwrap();

    assert_eq!(log.length(), 2 + 31);
    assert_eq!(bee.get(&key(3)).await.unwrap(), None);
    assert!(bee.get(&key(29)).await.unwrap().is_some());
    let report = bee.check().await.unwrap();
    assert!(report.is_ok(), "{:?}", report.violations);
    assert_eq!(report.keys, 30);
}

#[tokio::test]
async fn concurrent_writers_serialize_on_the_lock() {
    let (_log, bee) = open();
    let mut tasks = Vec::new();
    for w in 0..4 {
        let bee = bee.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                bee.put(&key(w * 100 + i), b"w").await.unwrap();
            }
        }));
    }
    for task in tasks {
        within(task).await.unwrap();
    }

    assert_eq!(bee.version(), 101);
    let report = bee.check().await.unwrap();
    assert!(report.is_ok(), "{:?}", report.violations);
    assert_eq!(report.keys, 100);
}

// ---------------------------------------------------------------------------
// Views and Queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn checkout_reproduces_an_old_version() {
    let (_log, bee) = open();
    fill(&bee, 60).await;
    let version = bee.version();
    let before = pairs(&bee).await;

    for i in 0..60 {
        if i % 3 == 0 {
            bee.del(&key(i)).await.unwrap();
        } else {
            bee.put(&key(i), b"changed").await.unwrap();
        }
    }

    let old = bee.checkout(version);
    assert_eq!(old.version(), version);
    assert_eq!(pairs(&old).await, before);
    assert!(matches!(old.put(b"x", b"y").await, Err(BeeError::ReadOnly)));
}

#[tokio::test]
async fn subs_are_isolated_from_each_other() {
    let (_log, bee) = open();
    let users = bee.sub(b"users");
    let posts = bee.sub(b"posts");
    users.put(b"ann", b"u1").await.unwrap();
    posts.put(b"ann", b"p1").await.unwrap();
    bee.put(b"plain", b"x").await.unwrap();

    let got = users.get(b"ann").await.unwrap().unwrap();
    assert_eq!(got.key.as_ref(), b"ann");
    assert_eq!(got.value.as_deref(), Some(&b"u1"[..]));

    let listed = pairs(&posts).await;
    assert_eq!(listed, vec![(Bytes::from("ann"), Bytes::from("p1"))]);
    assert_eq!(pairs(&bee).await.len(), 3);

    let nested = users.sub(b"admins");
    nested.put(b"root", b"1").await.unwrap();
    assert_eq!(pairs(&users).await.len(), 2);
    assert_eq!(pairs(&nested).await.len(), 1);
}

#[tokio::test]
async fn diff_matches_a_model_of_the_changes() {
    let (_log, bee) = open();
    fill(&bee, 200).await;
    let before = bee.version();

    let mut rng = StdRng::seed_from_u64(11);
    let mut order: Vec<usize> = (0..200).collect();
    order.shuffle(&mut rng);

    let mut expected: BTreeMap<Vec<u8>, (Option<String>, Option<String>)> = BTreeMap::new();
    for &i in &order[..40] {
        bee.del(&key(i)).await.unwrap();
        expected.insert(key(i), (None, Some(format!("v{i}"))));
    }
    for &i in &order[40..60] {
        bee.put(&key(i), b"new").await.unwrap();
        expected.insert(key(i), (Some("new".into()), Some(format!("v{i}"))));
    }
    for i in 200..210 {
        bee.put(&key(i), b"added").await.unwrap();
        expected.insert(key(i), (Some("added".into()), None));
    }

    let text = |e: Option<Entry>| e.and_then(|e| e.value).map(|v| String::from_utf8(v.to_vec()).unwrap());
    let changes = bee.diff(before, RangeOptions::new()).collect().await.unwrap();
    let keys: Vec<Vec<u8>> = changes
        .iter()
        .map(|c| c.left.as_ref().or(c.right.as_ref()).unwrap().key.to_vec())
        .collect();
    assert_eq!(keys.len(), expected.len(), "a key was reported more than once");
    assert!(keys.windows(2).all(|w| w[0] < w[1]), "changes out of key order");

    let got: BTreeMap<_, _> = keys
        .into_iter()
        .zip(changes)
        .map(|(k, c)| (k, (text(c.left), text(c.right))))
        .collect();
    assert_eq!(got, expected);
}

#[tokio::test]
async fn history_lists_every_write() {
    let (_log, bee) = open();
    bee.put(b"a", b"1").await.unwrap();
    bee.sub(b"s").put(b"b", b"2").await.unwrap();
    bee.del(b"a").await.unwrap();

    let history = bee.history(HistoryOptions::new()).collect().await.unwrap();
    let kinds: Vec<HistoryKind> = history.iter().map(|h| h.kind).collect();
    assert_eq!(kinds, vec![HistoryKind::Put, HistoryKind::Put, HistoryKind::Del]);
    assert_eq!(history[1].key.as_ref(), b"s\0b");
}

#[tokio::test]
async fn is_bee_recognizes_trees() {
    let (log, bee) = open();
    assert!(matches!(
        Bee::is_bee(log.as_ref()).await,
        Err(BeeError::NotAvailable { seq: 0 })
    ));
    bee.put(b"a", b"1").await.unwrap();
    assert!(Bee::is_bee(log.as_ref()).await.unwrap());
}

// ---------------------------------------------------------------------------
// Failure Modes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn read_only_handles_refuse_writes() {
    let (log, bee) = open();
    bee.put(b"a", b"1").await.unwrap();

    let replica = Bee::new(Arc::new(log.reader()), BeeOptions::default());
    assert!(!replica.writable());
    assert!(matches!(replica.put(b"b", b"2").await, Err(BeeError::ReadOnly)));
    assert_eq!(replica.get(b"a").await.unwrap().unwrap().value.as_deref(), Some(&b"1"[..]));

    let flagged = Bee::new(
        log.clone(),
        BeeOptions {
            readonly: true,
            ..BeeOptions::default()
        },
    );
    assert!(matches!(flagged.del(b"a").await, Err(BeeError::ReadOnly)));
    assert_eq!(log.length(), 2);

    // A refused write never took the lock it shares with the head.
    let old = bee.checkout(2);
    assert!(matches!(old.put(b"c", b"3").await, Err(BeeError::ReadOnly)));
    within(bee.put(b"c", b"3")).await.unwrap();
}

#[tokio::test]
async fn failed_append_releases_the_lock() {
    let (log, bee) = open();
    bee.put(b"a", b"1").await.unwrap();

    log.set_append_failure(Some("disk full".into()));
    let err = bee.put(b"b", b"2").await.unwrap_err();
    assert!(matches!(err, BeeError::AppendFailed(reason) if reason == "disk full"));
    assert_eq!(bee.get(b"b").await.unwrap(), None);

    log.set_append_failure(None);
    within(bee.put(b"b", b"2")).await.unwrap();
    assert!(bee.get(b"b").await.unwrap().is_some());
}

#[tokio::test]
async fn unreachable_records_surface_as_not_available() {
    let (log, bee) = open();
    fill(&bee, 20).await;

    // A fresh handle starts with cold caches.
    let cold = Bee::new(Arc::new(log.reader()), BeeOptions::default());
    let root_seq = log.length() - 1;
    log.set_local(root_seq, false);
    log.set_reachable(false);
    assert!(matches!(
        cold.get(&key(0)).await,
        Err(BeeError::NotAvailable { seq }) if seq == root_seq
    ));

    log.set_reachable(true);
    assert!(cold.get(&key(0)).await.unwrap().is_some());
}

#[tokio::test]
async fn truncation_invalidates_pinned_snapshots() {
    let (log, bee) = open();
    fill(&bee, 20).await;
    let snap = bee.snapshot();
    assert!(snap.get(&key(0)).await.unwrap().is_some());

    log.truncate(10);
    assert!(matches!(
        snap.get(&key(0)).await,
        Err(BeeError::SnapshotInvalidated { .. })
    ));
}

#[tokio::test]
async fn truncation_rewinds_shared_caches() {
    let (log, bee) = open();
    fill(&bee, 200).await;
    // Warm the caches with every record.
    assert_eq!(pairs(&bee).await.len(), 200);

    log.truncate(50);
    bee.put(b"after", b"truncate").await.unwrap();

    assert_eq!(bee.version(), 51);
    assert_eq!(bee.get(&key(60)).await.unwrap(), None);
    assert_eq!(
        bee.get(b"after").await.unwrap().unwrap().value.as_deref(),
        Some(&b"truncate"[..])
    );
    let report = bee.check().await.unwrap();
    assert!(report.is_ok(), "{:?}", report.violations);
    assert_eq!(report.keys, 50);
}

#[tokio::test]
async fn a_delete_that_hits_a_missing_record_leaves_the_batch_usable() {
    let mut failures = 0;
    let records = {
        let (log, bee) = open();
        fill(&bee, 60).await;
        log.length()
    };

    for seq in 1..records {
        let (log, bee) = open();
        fill(&bee, 60).await;

        // A second handle on the same log starts with cold caches.
        let cold = Bee::new(log.clone(), BeeOptions::default());
        log.set_local(seq, false);
        log.set_reachable(false);

        let mut batch = cold.batch();
        let removed = batch.del(&key(0)).await;

        log.set_reachable(true);
        log.set_local(seq, true);
        if removed.is_err() {
            failures += 1;
        }

        batch.put(b"zzz", b"1").await.unwrap();
        within(batch.flush()).await.unwrap();

        assert_eq!(
            cold.get(&key(0)).await.unwrap().is_some(),
            removed.is_err(),
            "delete with record {seq} missing"
        );
        assert!(cold.get(b"zzz").await.unwrap().is_some());
        let report = cold.check().await.unwrap();
        assert!(report.is_ok(), "record {seq} missing: {:?}", report.violations);
        assert_eq!(report.keys, if removed.is_err() { 61 } else { 60 });
    }
    assert!(failures > 0);
}

#[tokio::test]
async fn an_idle_batch_follows_the_log_across_a_fork() {
    let (log, bee) = open();
    for k in [b"a", b"b", b"c", b"d"] {
        bee.put(k, b"old").await.unwrap();
    }

    let mut batch = bee.batch();
    assert!(batch.get(b"d").await.unwrap().is_some());

    // Same length as before, different history.
    log.truncate(3);
    bee.put(b"0", b"new").await.unwrap();
    bee.put(b"1", b"new").await.unwrap();
    assert_eq!(bee.version(), 5);

    assert_eq!(batch.get(b"d").await.unwrap(), None);
    assert!(batch.get(b"1").await.unwrap().is_some());
    batch.put(b"z", b"new").await.unwrap();
    within(batch.flush()).await.unwrap();

    let keys: Vec<Bytes> = pairs(&bee).await.into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![
        Bytes::from_static(b"0"),
        Bytes::from_static(b"1"),
        Bytes::from_static(b"a"),
        Bytes::from_static(b"b"),
        Bytes::from_static(b"z"),
    ]);
    let report = bee.check().await.unwrap();
    assert!(report.is_ok(), "{:?}", report.violations);
}

#[tokio::test]
async fn a_fork_under_staged_writes_fails_the_flush() {
    let (log, bee) = open();
    fill(&bee, 10).await;

    let mut batch = bee.batch();
    batch.put(b"x", b"1").await.unwrap();
    log.truncate(5);

    assert!(matches!(batch.flush().await, Err(BeeError::Forked { .. })));
    assert_eq!(batch.pending(), 0);
    assert_eq!(bee.get(b"x").await.unwrap(), None);

    within(bee.put(b"y", b"1")).await.unwrap();
    assert_eq!(bee.version(), 6);
    let report = bee.check().await.unwrap();
    assert!(report.is_ok(), "{:?}", report.violations);
    assert_eq!(report.keys, 5);
}
