//! Scenario: semantic threshold gates dispatch
//!
//! # Invariant under test
//! A semantic-only watcher dispatches only once the cosine similarity
//! between its query embedding and the attestation's embedding clears its
//! effective threshold; text below the threshold matches nothing, text
//! above it fires the action.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use qntx_dispatch::DispatchConfig;
use qntx_embedding::{Embedding, EmbeddingError, EmbeddingProvider};
use qntx_model::{ActionData, Attestation, Filter, Value, Watcher, WatcherCounters};
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

struct KeywordProvider;

#[async_trait]
impl EmbeddingProvider for KeywordProvider {
    async fn generate(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.contains("rocket") {
            Ok(Embedding(vec![1.0, 0.0]))
        } else {
            Ok(Embedding(vec![0.0, 1.0]))
        }
    }
}

#[tokio::test]
async fn semantic_threshold_gates_dispatch() {
    let store = Arc::new(FakeWatcherStore::new());
    store.seed(Watcher {
        filter: None,
        semantic_query: Some("rocket launch".to_string()),
        semantic_threshold: 0.9,
        ..webhook_watcher("w1", 6)
    });
    let transport = FakeDispatchTransport::new();
    transport.script(vec![ScriptedResponse::ok(200, "ok")]);

    let attestation_store = Arc::new(FakeAttestationStore::new());
    let dispatch_config = DispatchConfig::new("http://code", "http://prompt");
    let (broadcast, _handle) = qntx_broadcast::BroadcastFabric::spawn(64, CancellationToken::new());
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(KeywordProvider);
    let engine = TestEngine::spawn(
        store.clone(),
        attestation_store,
        transport,
        dispatch_config,
        broadcast,
        Some(provider),
        None,
        CancellationToken::new(),
    );
    engine.load().await.unwrap();

    let below_threshold = Attestation::new(
        "a-miss",
        chrono::Utc::now(),
        "test",
        vec![],
        vec![],
        vec![],
        vec![],
        std::collections::BTreeMap::from([("note".to_string(), Value::Text("weather report".to_string()))]),
    );
    engine.handle_attestation(below_threshold).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.get("w1").await.unwrap().unwrap().counters.fire_count, 0);

    let above_threshold = Attestation::new(
        "a-hit",
        chrono::Utc::now(),
        "test",
        vec![],
        vec![],
        vec![],
        vec![],
        std::collections::BTreeMap::from([("note".to_string(), Value::Text("rocket telemetry".to_string()))]),
    );
    engine.handle_attestation(above_threshold).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.get("w1").await.unwrap().unwrap().counters.fire_count, 1);
}
