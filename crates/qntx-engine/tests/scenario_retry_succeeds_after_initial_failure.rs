//! Scenario: retry succeeds after initial failure
//!
//! # Invariant under test
//! A transport failure on the first dispatch attempt records an error and
//! enqueues a retry rather than giving up; once the retry becomes due and
//! the endpoint accepts the request, the watcher's fire counter advances
//! and the retry queue empties.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use qntx_dispatch::DispatchConfig;
use qntx_model::{ActionData, Attestation, Filter, Watcher, WatcherCounters};
use qntx_testkit::{FakeAttestationStore, FakeDispatchTransport, FakeWatcherStore, ScriptedResponse};
use tokio_util::sync::CancellationToken;

type TestEngine = qntx_engine::WatcherEngine<FakeWatcherStore, FakeAttestationStore, FakeDispatchTransport>;

fn webhook_watcher(id: &str, max_fires_per_minute: u32) -> Watcher {
    Watcher {
        id: id.to_string(),
        enabled: true,
        raw_query: None,
        filter: Some(Filter::new(
            BTreeSet::from(["alice".to_string()]),
            BTreeSet::from(["is".to_string()]),
            BTreeSet::new(),
            BTreeSet::new(),
            None,
            None,
        )),
        semantic_query: None,
        semantic_threshold: 0.0,
        action_data: ActionData::Webhook {
            url: "http://sink/x".to_string(),
        },
        max_fires_per_minute,
        counters: WatcherCounters::default(),
    }
}

fn attestation_a1() -> Attestation {
    Attestation::new(
        "a1",
        chrono::Utc::now(),
        "test",
        vec!["Alice".into(), "Bob".into()],
        vec!["is".into()],
        vec![],
        vec![],
        std::collections::BTreeMap::new(),
    )
}

async fn spawn_test_engine(
    watcher_store: Arc<FakeWatcherStore>,
    transport: FakeDispatchTransport,
) -> Arc<TestEngine> {
    let attestation_store = Arc::new(FakeAttestationStore::new());
    let dispatch_config = DispatchConfig::new("http://code", "http://prompt");
    let (broadcast, _handle) = qntx_broadcast::BroadcastFabric::spawn(64, CancellationToken::new());
    let engine = TestEngine::spawn(
        watcher_store,
        attestation_store,
        transport,
        dispatch_config,
        broadcast,
        None,
        None,
        CancellationToken::new(),
    );
    engine.load().await.unwrap();
    engine
}

#[tokio::test]
async fn retry_succeeds_after_initial_transport_failure() {
    let store = Arc::new(FakeWatcherStore::new());
    store.seed(webhook_watcher("w1", 6));
    let transport = FakeDispatchTransport::new();
    transport.script(vec![
        ScriptedResponse::Err(qntx_dispatch::TransportError::Transport("connection reset".to_string())),
        ScriptedResponse::ok(200, "ok"),
    ]);

    let engine = spawn_test_engine(store.clone(), transport).await;
    engine.handle_attestation(attestation_a1()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let watcher = store.get("w1").await.unwrap().unwrap();
    assert_eq!(watcher.counters.fire_count, 0);
    assert_eq!(watcher.counters.error_count, 1);
    assert_eq!(engine.retry_queue_len(), 1);

    // The retry loop ticks every second and INITIAL_BACKOFF is 1s, so the
    // queued retry becomes due shortly after 1s elapses.
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let watcher = store.get("w1").await.unwrap().unwrap();
    assert_eq!(watcher.counters.fire_count, 1);
    assert_eq!(engine.retry_queue_len(), 0);
}
