//! Tests for `src/reconcile/mod.rs` — one reconcile pass against fakes.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use connsync::descriptor::{ConnectionKind, DescriptorError};
use connsync::lifecycle::ConnectionLifecycleManager;
use connsync::reconcile::{Action, ReconcileError};
use connsync::store::MemoryStateStore;

use super::support::{
    consumer, entry, harness, id, open_ids, producer, DownStore, FakeConnector, SkewedStore,
};

fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| (*s).to_owned()).collect()
}

#[tokio::test]
async fn opens_missing_consumer_and_leaves_open_producer_alone() {
    let store = MemoryStateStore::new();
    let c1 = consumer("f1", "c1", &["orders"], "g1");
    let c2 = producer("f1", "c2");
    store.register(&c1).await;
    store.register(&c2).await;

    let h = harness(Arc::new(store), FakeConnector::new(), 4);
    h.lifecycle.open(&c2).await.expect("pre-open producer");
    assert_eq!(h.log.connects(), vec!["producer:f1:c2"]);

    let report = h.engine.reconcile_once().await.expect("pass should run");

    assert_eq!(report.opened, vec![id("consumer:f1:c1")]);
    assert!(report.closed.is_empty());
    assert!(report.is_clean());
    // Exactly one new connect: the consumer.
    assert_eq!(h.log.connects(), vec!["consumer:f1:c1", "producer:f1:c2"]);
    assert_eq!(
        open_ids(&h.registry).await,
        set(&["consumer:f1:c1", "producer:f1:c2"])
    );
}

#[tokio::test]
async fn closes_connection_that_is_no_longer_registered() {
    let store = MemoryStateStore::new();
    let h = harness(Arc::new(store), FakeConnector::new(), 4);
    h.lifecycle
        .open(&producer("f9", "c9"))
        .await
        .expect("pre-open");

    let report = h.engine.reconcile_once().await.expect("pass should run");

    assert_eq!(report.closed, vec![id("producer:f9:c9")]);
    assert!(report.opened.is_empty());
    assert_eq!(h.log.disconnects(), vec!["producer:f9:c9"]);
    assert!(h.registry.is_empty().await);
}

#[tokio::test]
async fn second_pass_without_changes_does_nothing() {
    let store = MemoryStateStore::new();
    store.register(&consumer("f1", "c1", &["orders"], "g1")).await;
    store.register(&producer("f1", "c2")).await;
    let h = harness(Arc::new(store), FakeConnector::new(), 4);

    let first = h.engine.reconcile_once().await.expect("first pass");
    assert_eq!(first.changes(), 2);

    let second = h.engine.reconcile_once().await.expect("second pass");
    assert_eq!(second.changes(), 0);
    assert!(second.stale.is_empty());
    assert_eq!(h.log.connects().len(), 2);
    assert!(h.log.disconnects().is_empty());
}

#[tokio::test]
async fn retracted_registration_is_not_opened() {
    let kept = producer("f1", "keep");
    let retracted = producer("f1", "gone");
    let live = MemoryStateStore::new();
    live.register(&kept).await;

    let store = SkewedStore {
        snapshot: vec![entry(&kept), entry(&retracted)],
        live,
        broken_gets: HashSet::new(),
    };
    let h = harness(Arc::new(store), FakeConnector::new(), 4);

    let report = h.engine.reconcile_once().await.expect("pass should run");

    assert_eq!(report.opened, vec![id("producer:f1:keep")]);
    assert_eq!(report.stale, vec![id("producer:f1:gone")]);
    assert_eq!(h.log.connects(), vec!["producer:f1:keep"]);
    assert_eq!(open_ids(&h.registry).await, set(&["producer:f1:keep"]));
}

#[tokio::test]
async fn re_registered_connection_is_not_closed() {
    let back = producer("f2", "back");
    let live = MemoryStateStore::new();
    live.register(&back).await;

    // Enumerated before the re-registration landed.
    let store = SkewedStore {
        snapshot: Vec::new(),
        live,
        broken_gets: HashSet::new(),
    };
    let h = harness(Arc::new(store), FakeConnector::new(), 4);
    h.lifecycle.open(&back).await.expect("pre-open");

    let report = h.engine.reconcile_once().await.expect("pass should run");

    assert!(report.closed.is_empty());
    assert_eq!(report.stale, vec![id("producer:f2:back")]);
    assert!(h.log.disconnects().is_empty());
    assert!(h.registry.contains(&id("producer:f2:back")).await);
}

#[tokio::test]
async fn one_failed_open_does_not_stop_the_others() {
    let store = MemoryStateStore::new();
    store.register(&producer("f1", "x")).await;
    store.register(&producer("f1", "y")).await;
    let connector = FakeConnector::new();
    connector.log.fail_on("producer:f1:x");
    let h = harness(Arc::new(store), connector, 4);

    let report = h.engine.reconcile_once().await.expect("pass should still succeed");

    assert_eq!(report.opened, vec![id("producer:f1:y")]);
    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.id, id("producer:f1:x"));
    assert_eq!(failure.action, Action::Open);
    assert!(matches!(
        failure.error,
        ReconcileError::ConnectionActionFailed { .. }
    ));
    assert!(!report.is_clean());
    assert_eq!(open_ids(&h.registry).await, set(&["producer:f1:y"]));

    // The failed connection is still in the diff and is retried next pass.
    h.log.fail_connect.lock().expect("lock").clear();
    let retry = h.engine.reconcile_once().await.expect("retry pass");
    assert_eq!(retry.opened, vec![id("producer:f1:x")]);
    assert!(retry.is_clean());
}

#[tokio::test]
async fn unreachable_store_aborts_the_pass() {
    let h = harness(Arc::new(DownStore), FakeConnector::new(), 4);
    h.lifecycle
        .open(&producer("f1", "c1"))
        .await
        .expect("pre-open");

    let err = h
        .engine
        .reconcile_once()
        .await
        .expect_err("pass should fail");

    assert!(matches!(err, ReconcileError::StateStore(_)));
    // Nothing torn down on the strength of an unreadable registry.
    assert!(h.log.disconnects().is_empty());
    assert_eq!(h.registry.len().await, 1);
}

#[tokio::test]
async fn failed_recheck_is_recorded_per_item() {
    let ok = producer("f1", "ok");
    let flaky = producer("f1", "flaky");
    let live = MemoryStateStore::new();
    live.register(&ok).await;
    live.register(&flaky).await;

    let store = SkewedStore {
        snapshot: vec![entry(&ok), entry(&flaky)],
        live,
        broken_gets: HashSet::from(["producer:f1:flaky".to_owned()]),
    };
    let h = harness(Arc::new(store), FakeConnector::new(), 4);

    let report = h.engine.reconcile_once().await.expect("pass should run");

    assert_eq!(report.opened, vec![id("producer:f1:ok")]);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(
        report.failures[0].error,
        ReconcileError::RecheckFailed { .. }
    ));
    assert_eq!(h.log.connects(), vec!["producer:f1:ok"]);
}

#[tokio::test]
async fn invalid_registry_entry_is_skipped() {
    let store = MemoryStateStore::new();
    store
        .insert_raw("consumer:f1:c1", serde_json::json!({"groupId": "g1"}))
        .await;
    store.register(&producer("f1", "c2")).await;
    let h = harness(Arc::new(store), FakeConnector::new(), 4);

    let report = h.engine.reconcile_once().await.expect("pass should run");

    assert_eq!(report.opened, vec![id("producer:f1:c2")]);
    assert_eq!(
        report.invalid,
        vec![("consumer:f1:c1".to_owned(), DescriptorError::MissingTopics)]
    );
    assert!(report.is_clean());
}

#[tokio::test(start_paused = true)]
async fn actions_run_concurrently_within_the_limit() {
    let store = MemoryStateStore::new();
    for n in 0..10 {
        store.register(&producer("bulk", &format!("c{n}"))).await;
    }
    let h = harness(
        Arc::new(store),
        FakeConnector::with_delay(Duration::from_millis(50)),
        3,
    );

    let report = h.engine.reconcile_once().await.expect("pass should run");

    assert_eq!(report.opened.len(), 10);
    let peak = h.log.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak in-flight {peak} exceeded limit");
    assert!(peak >= 2, "actions should overlap, peak was {peak}");
}

#[tokio::test]
async fn registry_values_without_ids_take_them_from_the_key() {
    let store = MemoryStateStore::new();
    store
        .insert_raw(
            "consumer:f1:c1",
            serde_json::json!({"topics": ["orders"], "groupId": "g1"}),
        )
        .await;
    store.insert_raw("producer:f1:c2", serde_json::json!({})).await;
    let h = harness(Arc::new(store), FakeConnector::new(), 4);
    h.lifecycle
        .open(&producer("f1", "c2"))
        .await
        .expect("pre-open producer");

    let report = h.engine.reconcile_once().await.expect("pass should run");

    assert_eq!(report.opened, vec![id("consumer:f1:c1")]);
    assert!(report.invalid.is_empty());
    assert!(report.is_clean());
    assert_eq!(h.log.connects(), vec!["consumer:f1:c1", "producer:f1:c2"]);

    let open = h.registry.snapshot().await;
    let kinds: Vec<_> = open.iter().map(|c| (c.id.to_string(), c.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            ("consumer:f1:c1".to_owned(), ConnectionKind::Consumer),
            ("producer:f1:c2".to_owned(), ConnectionKind::Producer),
        ]
    );
}

#[tokio::test]
async fn malformed_value_does_not_block_other_entries() {
    let store = MemoryStateStore::new();
    store
        .insert_raw("consumer:f1:c1", serde_json::json!({"topics": "orders"}))
        .await;
    store.insert_raw("producer:f1:c2", serde_json::json!({})).await;
    let h = harness(Arc::new(store), FakeConnector::new(), 4);

    let report = h.engine.reconcile_once().await.expect("pass should run");

    assert_eq!(report.opened, vec![id("producer:f1:c2")]);
    assert!(matches!(
        report.invalid.as_slice(),
        [(key, DescriptorError::MalformedRecord(_))] if key == "consumer:f1:c1"
    ));
    assert_eq!(h.log.connects(), vec!["producer:f1:c2"]);
}

#[tokio::test]
async fn record_ids_that_contradict_the_key_are_invalid() {
    let store = MemoryStateStore::new();
    store
        .insert_raw("producer:f1:c2", serde_json::json!({"componentId": "c3"}))
        .await;
    let h = harness(Arc::new(store), FakeConnector::new(), 4);

    let report = h.engine.reconcile_once().await.expect("pass should run");

    assert!(report.opened.is_empty());
    assert!(matches!(
        report.invalid.as_slice(),
        [(_, DescriptorError::KeyMismatch { .. })]
    ));
}

#[tokio::test]
async fn failed_close_is_retried_next_pass() {
    let connector = FakeConnector::new();
    connector.log.fail_disconnect_on("producer:f9:c9");
    let h = harness(Arc::new(MemoryStateStore::new()), connector, 4);
    h.lifecycle
        .open(&producer("f9", "c9"))
        .await
        .expect("pre-open");

    let first = h.engine.reconcile_once().await.expect("pass should run");
    assert!(first.closed.is_empty());
    assert_eq!(first.failures.len(), 1);
    assert_eq!(first.failures[0].action, Action::Close);
    assert_eq!(h.registry.len().await, 1);

    h.log.fail_disconnect.lock().expect("lock").clear();
    let second = h.engine.reconcile_once().await.expect("retry pass");
    assert_eq!(second.closed, vec![id("producer:f9:c9")]);
    assert!(second.is_clean());
    assert_eq!(h.log.disconnects(), vec!["producer:f9:c9", "producer:f9:c9"]);
    assert!(h.registry.is_empty().await);
}

#[tokio::test]
async fn failed_open_does_not_stop_a_close_in_the_same_pass() {
    let store = MemoryStateStore::new();
    store.register(&producer("f1", "new")).await;
    let connector = FakeConnector::new();
    connector.log.fail_on("producer:f1:new");
    let h = harness(Arc::new(store), connector, 4);
    h.lifecycle
        .open(&producer("f1", "old"))
        .await
        .expect("pre-open");

    let report = h.engine.reconcile_once().await.expect("pass should run");

    assert!(report.opened.is_empty());
    assert_eq!(report.closed, vec![id("producer:f1:old")]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].action, Action::Open);
    assert_eq!(h.log.disconnects(), vec!["producer:f1:old"]);
    assert!(h.registry.is_empty().await);
}
