//! Scenario: edge cursor blocks replay after reload
//!
//! # Invariant under test
//! A successful dispatch on an edge-cursor watcher advances its watermark;
//! after a reload, an attestation timestamped before that watermark no
//! longer matches, even though its structural shape is identical to the one
//! that just fired.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use qntx_dispatch::DispatchConfig;
use qntx_model::{ActionData, Attestation, CompositionEdge, Filter, Watcher, WatcherCounters};
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
async fn edge_cursor_blocks_replay_of_stale_attestations_after_reload() {
    let store = Arc::new(FakeWatcherStore::new());
    store.seed(Watcher {
        action_data: ActionData::Code {
            content: "print(1)".to_string(),
            glyph_id: Some("g1".to_string()),
            composition: Some(CompositionEdge {
                composition_id: "c1".to_string(),
                source_glyph_id: "src".to_string(),
                target_glyph_id: "tgt".to_string(),
                target_glyph_type: "code".to_string(),
            }),
        },
        ..webhook_watcher("w1", 6)
    });
    let transport = FakeDispatchTransport::new();
    transport.script(vec![ScriptedResponse::ok(200, "ok")]);

    let engine = spawn_test_engine(store.clone(), transport).await;

    let watermark = attestation_a1();
    engine.handle_attestation(watermark.clone()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.get("w1").await.unwrap().unwrap().counters.fire_count, 1);

    let stale = Attestation::new(
        "a0",
        watermark.timestamp - chrono::Duration::seconds(1),
        "test",
        vec!["Alice".into(), "Bob".into()],
        vec!["is".into()],
        vec![],
        vec![],
        std::collections::BTreeMap::new(),
    );

    engine.load().await.unwrap();
    engine.handle_attestation(stale).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.get("w1").await.unwrap().unwrap().counters.fire_count, 1);
}
