//! qntx-broadcast
//!
//! The fan-out core (§4.C10). A single worker task owns every write to a
//! subscriber's queues; everyone else only ever enqueues a *request* onto a
//! bounded channel the worker drains. This makes "teardown must not race a
//! send" true by construction — the worker never holds two ends of the same
//! pipe concurrently with another writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use qntx_dispatch::DispatchObserver;
use qntx_model::CompositionEdge;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// Payload carried on a subscriber's `msg` queue. `Message` covers both the
/// generic event case and the execution lifecycle events a composition-edge
/// dispatch emits; the three typed kinds get their own variant because
/// they're a distinct wire shape, not because they travel a different queue.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "reqType", rename_all = "snake_case")]
pub enum BroadcastEvent {
    Message { payload: serde_json::Value },
    WatcherMatch {
        watcher_id: String,
        attestation_id: String,
        similarity: f32,
    },
    WatcherError {
        watcher_id: String,
        error: String,
    },
    GlyphFired {
        watcher_id: String,
        glyph_id: String,
    },
}

enum BroadcastRequest {
    Message {
        client_id: Option<String>,
        event: BroadcastEvent,
    },
    Graph {
        client_id: Option<String>,
        graph: serde_json::Value,
    },
    Log {
        client_id: String,
        batch: Vec<String>,
    },
    Close {
        client_id: String,
    },
}

#[derive(Clone)]
struct SubscriberQueues {
    msg_tx: mpsc::Sender<BroadcastEvent>,
    log_tx: mpsc::Sender<Vec<String>>,
    graph_tx: mpsc::Sender<serde_json::Value>,
}

/// The three queues handed to whatever adapts a subscriber onto the wire
/// (an SSE stream, a websocket writer, ...).
pub struct SubscriberReceivers {
    pub msg_rx: mpsc::Receiver<BroadcastEvent>,
    pub log_rx: mpsc::Receiver<Vec<String>>,
    pub graph_rx: mpsc::Receiver<serde_json::Value>,
}

struct FabricState {
    subscribers: RwLock<HashMap<String, SubscriberQueues>>,
    drops: AtomicU64,
}

/// Handle held by everything that needs to publish or register a
/// subscriber. Cheap to clone; the actual worker task runs independently.
#[derive(Clone)]
pub struct BroadcastFabric {
    request_tx: mpsc::Sender<BroadcastRequest>,
    state: Arc<FabricState>,
}

impl BroadcastFabric {
    /// Start the worker task and return a handle plus its join handle. The
    /// worker exits once `cancel` fires and the request channel is drained,
    /// or once every `BroadcastFabric` handle (and the channel with it) is
    /// dropped.
    pub fn spawn(
        request_capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (request_tx, request_rx) = mpsc::channel(request_capacity);
        let state = Arc::new(FabricState {
            subscribers: RwLock::new(HashMap::new()),
            drops: AtomicU64::new(0),
        });
        let worker_state = state.clone();
        let handle = tokio::spawn(run_worker(worker_state, request_rx, cancel));
        (Self { request_tx, state }, handle)
    }

    /// Register a new subscriber with per-queue capacity `queue_capacity`.
    /// Registration mutates the subscriber map directly rather than going
    /// through the request channel: it never sends to or closes an existing
    /// queue, so it cannot race the single-writer invariant the worker
    /// exists to uphold.
    pub async fn register(&self, client_id: impl Into<String>, queue_capacity: usize) -> SubscriberReceivers {
        let queue_capacity = queue_capacity.max(1);
        let (msg_tx, msg_rx) = mpsc::channel(queue_capacity);
        let (log_tx, log_rx) = mpsc::channel(queue_capacity);
        let (graph_tx, graph_rx) = mpsc::channel(queue_capacity);

        self.state.subscribers.write().await.insert(
            client_id.into(),
            SubscriberQueues {
                msg_tx,
                log_tx,
                graph_tx,
            },
        );

        SubscriberReceivers {
            msg_rx,
            log_rx,
            graph_rx,
        }
    }

    pub fn subscriber_count_blocking(&self) -> usize {
        self.state.subscribers.blocking_read().len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.subscribers.read().await.len()
    }

    pub fn broadcast_drops(&self) -> u64 {
        self.state.drops.load(Ordering::Relaxed)
    }

    /// Enqueue a generic message, optionally targeted at one subscriber
    /// (`client_id = None` means all). Returns `false` if the request
    /// channel itself is full or closed (§5 "Backpressure").
    pub fn post_message(&self, client_id: Option<String>, payload: serde_json::Value) -> bool {
        self.try_post(BroadcastRequest::Message {
            client_id,
            event: BroadcastEvent::Message { payload },
        })
    }

    pub fn post_watcher_match(
        &self,
        client_id: Option<String>,
        watcher_id: impl Into<String>,
        attestation_id: impl Into<String>,
        similarity: f32,
    ) -> bool {
        self.try_post(BroadcastRequest::Message {
            client_id,
            event: BroadcastEvent::WatcherMatch {
                watcher_id: watcher_id.into(),
                attestation_id: attestation_id.into(),
                similarity,
            },
        })
    }

    pub fn post_watcher_error(
        &self,
        client_id: Option<String>,
        watcher_id: impl Into<String>,
        error: impl Into<String>,
    ) -> bool {
        self.try_post(BroadcastRequest::Message {
            client_id,
            event: BroadcastEvent::WatcherError {
                watcher_id: watcher_id.into(),
                error: error.into(),
            },
        })
    }

    pub fn post_glyph_fired(
        &self,
        client_id: Option<String>,
        watcher_id: impl Into<String>,
        glyph_id: impl Into<String>,
    ) -> bool {
        self.try_post(BroadcastRequest::Message {
            client_id,
            event: BroadcastEvent::GlyphFired {
                watcher_id: watcher_id.into(),
                glyph_id: glyph_id.into(),
            },
        })
    }

    pub fn post_graph(&self, client_id: Option<String>, graph: serde_json::Value) -> bool {
        self.try_post(BroadcastRequest::Graph { client_id, graph })
    }

    pub fn post_log(&self, client_id: impl Into<String>, batch: Vec<String>) -> bool {
        self.try_post(BroadcastRequest::Log {
            client_id: client_id.into(),
            batch,
        })
    }

    pub fn post_close(&self, client_id: impl Into<String>) -> bool {
        self.try_post(BroadcastRequest::Close {
            client_id: client_id.into(),
        })
    }

    fn try_post(&self, request: BroadcastRequest) -> bool {
        self.request_tx.try_send(request).is_ok()
    }
}

/// Bridges a composition-edge dispatch's lifecycle events onto the fabric
/// (§4.C6's `execution_started` / `execution_success` / `execution_error`).
/// Implemented here, not in qntx-dispatch, so the dependency stays one-way:
/// qntx-dispatch never depends on qntx-broadcast.
impl DispatchObserver for BroadcastFabric {
    fn execution_started(&self, watcher_id: &str, composition: &CompositionEdge) {
        self.post_message(
            None,
            serde_json::json!({
                "event": "execution_started",
                "watcher_id": watcher_id,
                "composition_id": composition.composition_id,
            }),
        );
    }

    fn execution_success(&self, watcher_id: &str, composition: &CompositionEdge, body: &[u8]) {
        self.post_message(
            None,
            serde_json::json!({
                "event": "execution_success",
                "watcher_id": watcher_id,
                "composition_id": composition.composition_id,
                "response": String::from_utf8_lossy(body),
            }),
        );
    }

    fn execution_error(&self, watcher_id: &str, composition: &CompositionEdge, error: &str) {
        self.post_message(
            None,
            serde_json::json!({
                "event": "execution_error",
                "watcher_id": watcher_id,
                "composition_id": composition.composition_id,
                "error": error,
            }),
        );
    }
}

async fn run_worker(state: Arc<FabricState>, mut rx: mpsc::Receiver<BroadcastRequest>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            maybe_request = rx.recv() => {
                match maybe_request {
                    Some(request) => handle_request(&state, request).await,
                    None => return,
                }
            }
        }
    }

    // Drain whatever is already buffered before exiting (§5 "broadcast
    // worker drains its request channel then exits"); close requests sort
    // last naturally since callers enqueue them only after their other
    // sends for that subscriber.
    rx.close();
    while let Ok(request) = rx.try_recv() {
        handle_request(&state, request).await;
    }
}

async fn handle_request(state: &FabricState, request: BroadcastRequest) {
    match request {
        BroadcastRequest::Message { client_id, event } => handle_message(state, client_id, event).await,
        BroadcastRequest::Graph { client_id, graph } => handle_graph(state, client_id, graph).await,
        BroadcastRequest::Log { client_id, batch } => handle_log(state, client_id, batch).await,
        BroadcastRequest::Close { client_id } => evict(state, &client_id).await,
    }
}

async fn snapshot_targets(state: &FabricState, client_id: Option<&str>) -> Vec<(String, SubscriberQueues)> {
    let subscribers = state.subscribers.read().await;
    match client_id {
        Some(id) => subscribers
            .get(id)
            .map(|q| vec![(id.to_string(), q.clone())])
            .unwrap_or_default(),
        None => subscribers
            .iter()
            .map(|(id, q)| (id.clone(), q.clone()))
            .collect(),
    }
}

async fn handle_message(state: &FabricState, client_id: Option<String>, event: BroadcastEvent) {
    let targets = snapshot_targets(state, client_id.as_deref()).await;
    let mut to_evict = Vec::new();
    for (id, queues) in targets {
        if queues.msg_tx.try_send(event.clone()).is_err() {
            to_evict.push(id);
        }
    }
    for id in to_evict {
        tracing::debug!(client_id = %id, "evicting slow subscriber: msg queue full");
        evict(state, &id).await;
    }
}

async fn handle_graph(state: &FabricState, client_id: Option<String>, graph: serde_json::Value) {
    let targets = snapshot_targets(state, client_id.as_deref()).await;
    let mut to_evict = Vec::new();
    for (id, queues) in targets {
        if queues.graph_tx.try_send(graph.clone()).is_err() {
            state.drops.fetch_add(1, Ordering::Relaxed);
            to_evict.push(id);
        }
    }
    for id in to_evict {
        tracing::debug!(client_id = %id, "evicting slow subscriber: graph queue full");
        evict(state, &id).await;
    }
}

async fn handle_log(state: &FabricState, client_id: String, batch: Vec<String>) {
    let subscribers = state.subscribers.read().await;
    let Some(queues) = subscribers.get(&client_id).cloned() else {
        return;
    };
    drop(subscribers);

    if queues.log_tx.try_send(batch).is_err() {
        tracing::warn!(client_id = %client_id, "log queue full, dropping batch (best effort, no eviction)");
    }
}

/// Idempotent: a missing `id` (already evicted, or never registered) is a
/// no-op.
async fn evict(state: &FabricState, id: &str) {
    let removed = state.subscribers.write().await.remove(id);
    if let Some(queues) = removed {
        close_in_fixed_order(queues);
    }
}

/// Drops `msg`, then `log`, then `graph`, in that order (§4.C10).
fn close_in_fixed_order(queues: SubscriberQueues) {
    let SubscriberQueues {
        msg_tx,
        log_tx,
        graph_tx,
    } = queues;
    drop(msg_tx);
    drop(log_tx);
    drop(graph_tx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn message_fans_out_to_all_subscribers() {
        let (fabric, _handle) = BroadcastFabric::spawn(16, CancellationToken::new());
        let mut a = fabric.register("a", 4).await;
        let mut b = fabric.register("b", 4).await;

        assert!(fabric.post_message(None, serde_json::json!({"x": 1})));

        let got_a = tokio::time::timeout(Duration::from_secs(1), a.msg_rx.recv())
            .await
            .unwrap();
        let got_b = tokio::time::timeout(Duration::from_secs(1), b.msg_rx.recv())
            .await
            .unwrap();
        assert!(got_a.is_some());
        assert!(got_b.is_some());
    }

    #[tokio::test]
    async fn targeted_message_only_reaches_named_subscriber() {
        let (fabric, _handle) = BroadcastFabric::spawn(16, CancellationToken::new());
        let mut a = fabric.register("a", 4).await;
        let mut b = fabric.register("b", 4).await;

        assert!(fabric.post_message(Some("a".to_string()), serde_json::json!({})));

        let got_a = tokio::time::timeout(Duration::from_secs(1), a.msg_rx.recv())
            .await
            .unwrap();
        assert!(got_a.is_some());
        assert!(b.msg_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_msg_queue_evicts_slow_subscriber() {
        let (fabric, _handle) = BroadcastFabric::spawn(16, CancellationToken::new());
        let receivers = fabric.register("slow", 1).await;
        // Hold the receiver but never drain it.
        let _keep_alive = receivers;

        fabric.post_message(None, serde_json::json!({"n": 1}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        fabric.post_message(None, serde_json::json!({"n": 2}));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(fabric.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn graph_drop_increments_counter_and_evicts() {
        let (fabric, _handle) = BroadcastFabric::spawn(16, CancellationToken::new());
        let receivers = fabric.register("slow", 1).await;
        let _keep_alive = receivers;

        fabric.post_graph(None, serde_json::json!({"nodes": []}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        fabric.post_graph(None, serde_json::json!({"nodes": []}));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(fabric.broadcast_drops() >= 1);
        assert_eq!(fabric.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn full_log_queue_does_not_evict() {
        let (fabric, _handle) = BroadcastFabric::spawn(16, CancellationToken::new());
        let receivers = fabric.register("a", 1).await;
        let _keep_alive = receivers;

        fabric.post_log("a", vec!["one".to_string()]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        fabric.post_log("a", vec!["two".to_string()]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(fabric.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn close_tears_down_all_three_queues_exactly_once() {
        let (fabric, _handle) = BroadcastFabric::spawn(16, CancellationToken::new());
        let mut receivers = fabric.register("a", 4).await;

        fabric.post_close("a");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(fabric.subscriber_count().await, 0);
        assert!(receivers.msg_rx.recv().await.is_none());
        assert!(receivers.log_rx.recv().await.is_none());
        assert!(receivers.graph_rx.recv().await.is_none());

        // Idempotent: closing an already-gone subscriber is a no-op, not a panic.
        assert!(fabric.post_close("a"));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn dispatch_observer_posts_lifecycle_events() {
        let (fabric, _handle) = BroadcastFabric::spawn(16, CancellationToken::new());
        let mut receivers = fabric.register("a", 4).await;
        let edge = CompositionEdge {
            composition_id: "c1".into(),
            source_glyph_id: "src".into(),
            target_glyph_id: "tgt".into(),
            target_glyph_type: "code".into(),
        };

        fabric.execution_started("w1", &edge);
        let event = tokio::time::timeout(Duration::from_secs(1), receivers.msg_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            BroadcastEvent::Message { payload } => {
                assert_eq!(payload["event"], "execution_started");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
