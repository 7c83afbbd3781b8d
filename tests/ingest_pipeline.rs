//! End-to-end tests for the ingestion loop against scripted feeds.

use certstore::core::{CertificateEvent, CertificateStore};
use certstore::error::SourceError;
use certstore::ingest::{IngestState, Ingester};
use certstore::store::{MemoryStore, SqliteStore};
use certstore::test_utils::{ConnectAttempt, FlakyStore, ScriptedSource, SessionStep};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

mod helpers;
use helpers::{fast_backoff, test_metrics, wait_until};

#[tokio::test(start_paused = true)]
async fn test_ingester_survives_connect_failures_and_disconnects() {
    let source = Arc::new(ScriptedSource::new(vec![
        ConnectAttempt::Fail("connection refused".to_string()),
        ConnectAttempt::Session(vec![
            SessionStep::Event(CertificateEvent::from_domains(&["a.com"])),
            SessionStep::Event(CertificateEvent::from_domains(&["b.com"])),
            SessionStep::Error(SourceError::Stream("reset by peer".to_string())),
        ]),
        ConnectAttempt::events_then_close(&[&["c.com"]]),
    ]));
    let store = Arc::new(MemoryStore::new());
    let ingester = Ingester::new(source.clone(), store.clone(), fast_backoff(), test_metrics());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(ingester.run(shutdown_rx));

    wait_until("all three domains", || async { store.count().await.unwrap() == 3 }).await;
    // The script is exhausted, so the fourth connect hangs until shutdown.
    wait_until("the fourth connect", || async { source.connect_count() == 4 }).await;

    shutdown_tx.send(true).unwrap();
    let summary = handle.await.unwrap();
    assert_eq!(summary.sessions, 2);
    assert_eq!(summary.events, 3);
    assert_eq!(summary.upserted, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(source.close_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_domain_does_not_block_the_rest_of_the_event() {
    let source = Arc::new(ScriptedSource::new(vec![ConnectAttempt::Session(vec![
        SessionStep::Event(CertificateEvent::from_domains(&["good.com", "bad.com", "other.com"])),
        SessionStep::Event(CertificateEvent::from_domains(&["later.com"])),
    ])]));
    let store = Arc::new(FlakyStore::new());
    store.fail_domain("bad.com");

    let ingester = Ingester::new(source.clone(), store.clone(), fast_backoff(), test_metrics());
    let mut state = ingester.subscribe_state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(ingester.run(shutdown_rx));

    wait_until("the second event", || async { store.count().await.unwrap() == 3 }).await;
    assert_eq!(*state.borrow_and_update(), IngestState::Streaming);
    assert!(store.get("bad.com").await.unwrap().is_none());
    let good = store.get("good.com").await.unwrap().unwrap();
    assert_eq!(good.created_at, good.updated_at);
    assert!(store.get("other.com").await.unwrap().is_some());

    shutdown_tx.send(true).unwrap();
    let summary = handle.await.unwrap();
    assert_eq!(summary.sessions, 1);
    assert_eq!(summary.events, 2);
    assert_eq!(summary.upserted, 3);
    assert_eq!(summary.failed, 1);
    // The session was never interrupted by the store failure.
    assert_eq!(source.connect_count(), 1);
}

#[tokio::test]
async fn test_event_fans_out_once_per_distinct_domain() {
    let store = Arc::new(FlakyStore::new());
    let ingester = Ingester::new(
        Arc::new(ScriptedSource::default()),
        store.clone(),
        fast_backoff(),
        test_metrics(),
    );

    let event = CertificateEvent::from_domains(&["a.com", "b.com", "a.com", "", "b.com"]);
    let outcome = ingester.process_event(&event).await;

    assert_eq!(outcome.upserted, 2);
    assert_eq!(outcome.failed, 0);
    assert_eq!(store.upsert_calls(), vec!["a.com", "b.com"]);

    let a = store.get("a.com").await.unwrap().unwrap();
    let b = store.get("b.com").await.unwrap().unwrap();
    assert_eq!(a.data, b.data);
    assert_eq!(a.payload().unwrap(), event.raw);
}

#[tokio::test]
async fn test_event_without_domains_writes_nothing() {
    let store = Arc::new(FlakyStore::new());
    let ingester = Ingester::new(
        Arc::new(ScriptedSource::default()),
        store.clone(),
        fast_backoff(),
        test_metrics(),
    );

    let outcome = ingester
        .process_event(&CertificateEvent::from_domains::<&str>(&[]))
        .await;
    assert_eq!(outcome.upserted, 0);
    assert!(store.upsert_calls().is_empty());
}

async fn assert_reobservation_updates_record(store: Arc<dyn CertificateStore>) {
    let ingester = Ingester::new(
        Arc::new(ScriptedSource::default()),
        store.clone(),
        fast_backoff(),
        test_metrics(),
    );

    let first = CertificateEvent::from_domains(&["example.com"]);
    let second = CertificateEvent::new(
        vec!["example.com".to_string(), "www.example.com".to_string()],
        serde_json::json!({"domains": ["example.com", "www.example.com"], "source": {"name": "Argon"}}),
    );

    ingester.process_event(&first).await;
    let before = store.get("example.com").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    ingester.process_event(&second).await;
    let after = store.get("example.com").await.unwrap().unwrap();

    assert_eq!(after.created_at, before.created_at);
    assert!(after.updated_at > before.updated_at);
    assert_eq!(after.payload().unwrap(), second.raw);
    assert_eq!(store.count().await.unwrap(), 2);

    let recent = store.list_recent(10).await.unwrap();
    let order: Vec<&str> = recent.iter().map(|r| r.domain.as_str()).collect();
    // Both were written by the same event; ties fall back to domain order.
    assert!(order == ["example.com", "www.example.com"] || order == ["www.example.com", "example.com"]);
}

#[tokio::test]
async fn test_reobservation_on_memory_store() {
    assert_reobservation_updates_record(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_reobservation_on_sqlite_store() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(dir.path().join("certs.db"), Duration::from_secs(5)).unwrap();
    assert_reobservation_updates_record(Arc::new(store)).await;
}

#[tokio::test]
async fn test_sqlite_ingestion_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("certs.db");
    let source = Arc::new(ScriptedSource::new(vec![ConnectAttempt::events_then_close(&[
        &["one.example.com", "two.example.com"],
        &["three.example.com"],
    ])]));

    {
        let store = Arc::new(SqliteStore::open(&path, Duration::from_secs(5)).unwrap());
        let ingester = Ingester::new(source.clone(), store.clone(), fast_backoff(), test_metrics());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(ingester.run(shutdown_rx));
        wait_until("three rows", || async { store.count().await.unwrap() == 3 }).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    let reopened = SqliteStore::open_read_only(&path, Duration::from_secs(5)).unwrap();
    assert_eq!(reopened.count().await.unwrap(), 3);
    assert!(reopened.get("two.example.com").await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_backoff_exits_promptly() {
    let source = Arc::new(ScriptedSource::new(vec![ConnectAttempt::Fail(
        "unreachable".to_string(),
    )]));
    let backoff = certstore::backoff::ExponentialBackoff::new(
        Duration::from_secs(60),
        Duration::from_secs(60),
        2.0,
    );
    let ingester = Ingester::new(source.clone(), Arc::new(MemoryStore::new()), backoff, test_metrics());
    let mut state = ingester.subscribe_state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(ingester.run(shutdown_rx));

    state.wait_for(|s| *s == IngestState::Backoff).await.unwrap();
    let started = tokio::time::Instant::now();
    shutdown_tx.send(true).unwrap();
    let summary = handle.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(summary.sessions, 0);
    assert_eq!(source.connect_count(), 1);
    assert_eq!(*state.borrow(), IngestState::ShutDown);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_streaming_closes_the_session() {
    let source = Arc::new(ScriptedSource::new(vec![ConnectAttempt::Session(vec![
        SessionStep::Event(CertificateEvent::from_domains(&["a.com"])),
    ])]));
    let store = Arc::new(MemoryStore::new());
    let ingester = Ingester::new(source.clone(), store.clone(), fast_backoff(), test_metrics());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(ingester.run(shutdown_rx));

    wait_until("the first event", || async { store.count().await.unwrap() == 1 }).await;
    assert_eq!(source.close_count(), 0);

    shutdown_tx.send(true).unwrap();
    let summary = handle.await.unwrap();
    assert_eq!(summary.events, 1);
    assert_eq!(source.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_the_shutdown_sender_stops_the_ingester() {
    let source = Arc::new(ScriptedSource::default());
    let ingester = Ingester::new(source.clone(), Arc::new(MemoryStore::new()), fast_backoff(), test_metrics());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(ingester.run(shutdown_rx));

    wait_until("a connect attempt", || async { source.connect_count() == 1 }).await;
    drop(shutdown_tx);

    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("ingester did not stop")
        .unwrap();
    assert_eq!(summary.sessions, 0);
}

/// Delays between consecutive connect attempts.
fn connect_gaps(source: &ScriptedSource) -> Vec<Duration> {
    source
        .connect_times()
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .collect()
}

fn assert_gaps(gaps: &[Duration], expected_secs: &[u64]) {
    assert_eq!(gaps.len(), expected_secs.len(), "gaps: {gaps:?}");
    for (gap, secs) in gaps.iter().zip(expected_secs) {
        let expected = Duration::from_secs(*secs);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(50),
            "expected ~{expected:?}, got {gaps:?}"
        );
    }
}

fn one_second_backoff() -> certstore::backoff::ExponentialBackoff {
    certstore::backoff::ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
}

#[tokio::test(start_paused = true)]
async fn test_backoff_resets_after_a_productive_session() {
    let source = Arc::new(ScriptedSource::new(vec![
        ConnectAttempt::Fail("refused".to_string()),
        ConnectAttempt::Fail("refused".to_string()),
        ConnectAttempt::events_then_close(&[&["a.com"]]),
    ]));
    source.push(ConnectAttempt::Fail("refused".to_string()));

    let ingester = Ingester::new(source.clone(), Arc::new(MemoryStore::new()), one_second_backoff(), test_metrics());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(ingester.run(shutdown_rx));

    wait_until("the fifth connect", || async { source.connect_count() == 5 }).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    // 1s, 2s, then back to 1s after the session that stored an event.
    assert_gaps(&connect_gaps(&source), &[1, 2, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_keeps_growing_after_an_empty_session() {
    let source = Arc::new(ScriptedSource::new(vec![
        ConnectAttempt::Fail("refused".to_string()),
        ConnectAttempt::Session(vec![SessionStep::Close]),
    ]));
    source.push(ConnectAttempt::Fail("refused".to_string()));

    let ingester = Ingester::new(source.clone(), Arc::new(MemoryStore::new()), one_second_backoff(), test_metrics());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(ingester.run(shutdown_rx));

    wait_until("the fourth connect", || async { source.connect_count() == 4 }).await;
    shutdown_tx.send(true).unwrap();
    let summary = handle.await.unwrap();

    assert_eq!(summary.sessions, 1);
    assert_eq!(summary.events, 0);
    assert_gaps(&connect_gaps(&source), &[1, 2, 4]);
}

#[tokio::test]
async fn test_domain_recovers_once_store_heals() {
    let store = Arc::new(FlakyStore::new());
    let ingester = Ingester::new(
        Arc::new(ScriptedSource::default()),
        store.clone(),
        fast_backoff(),
        test_metrics(),
    );
    store.fail_domain("bad.com");

    let event = CertificateEvent::from_domains(&["bad.com", "good.com"]);
    let first = ingester.process_event(&event).await;
    assert_eq!((first.upserted, first.failed), (1, 1));
    assert!(store.get("bad.com").await.unwrap().is_none());

    store.heal_domain("bad.com");
    let second = ingester.process_event(&event).await;
    assert_eq!((second.upserted, second.failed), (2, 0));

    let healed = store.get("bad.com").await.unwrap().unwrap();
    assert_eq!(healed.payload().unwrap(), event.raw);
    assert_eq!(store.upsert_calls(), vec!["bad.com", "good.com", "bad.com", "good.com"]);
}
