//! qntx-engine
//!
//! The main orchestrator (§4.C9): owns the watcher map, rate limiters,
//! parse-error map, and query-embedding cache behind one lock, and drives
//! the evaluate → broadcast → rate-limit → dispatch → retry pipeline for
//! every new attestation. See `historical` for the back-query path.

mod historical;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use qntx_broadcast::BroadcastFabric;
use qntx_cursor::EdgeCursorStore;
use qntx_dispatch::{DispatchConfig, DispatchError, DispatchObserver, Dispatcher, HttpTransport};
use qntx_embedding::{Embedding, EmbeddingProvider, VectorSearcher};
use qntx_model::{ActionData, Attestation, Watcher};
use qntx_ratelimit::RateLimiterRegistry;
use qntx_retry::{PendingExecution, RetryQueue};
use qntx_store::{AttestationStore, WatcherStore};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub use historical::historical_query;

/// §4.C9 "States: fresh → running → stopped".
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Fresh,
    Running,
    Stopped,
}

/// The watchers map, parse-error map, and query-embedding cache: reloaded
/// atomically together under the write lock (§9 "Global mutable state").
/// Rate limiters are kept in their own `Mutex` rather than nested in here —
/// admission checks mutate a token bucket on every matching attestation,
/// which the evaluation path's read-lock-only contract (§5) can't honor if
/// the bucket lived behind the same `RwLock`.
struct EngineState {
    watchers: BTreeMap<String, Watcher>,
    parse_errors: HashMap<String, String>,
    embedding_cache: HashMap<String, Embedding>,
}

impl EngineState {
    fn empty() -> Self {
        Self {
            watchers: BTreeMap::new(),
            parse_errors: HashMap::new(),
            embedding_cache: HashMap::new(),
        }
    }
}

/// Bound on the structural/newest-first historical scan (§4.C9's semantic
/// path has an explicit `limit=50`; the structural path doesn't name one,
/// so this crate picks a pragmatic default — see DESIGN.md).
pub const HISTORICAL_SCAN_LIMIT: i64 = 500;

pub struct WatcherEngine<WS, AS, T>
where
    WS: WatcherStore + EdgeCursorStore + 'static,
    AS: AttestationStore + 'static,
    T: HttpTransport + 'static,
{
    watcher_store: Arc<WS>,
    attestation_store: Arc<AS>,
    dispatcher: Dispatcher<T>,
    broadcast: BroadcastFabric,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    vector_searcher: Option<Arc<dyn VectorSearcher>>,
    retry_queue: RetryQueue,
    limiters: Mutex<RateLimiterRegistry>,
    state: RwLock<EngineState>,
    status: RwLock<EngineStatus>,
    cancel: CancellationToken,
}

impl<WS, AS, T> WatcherEngine<WS, AS, T>
where
    WS: WatcherStore + EdgeCursorStore + 'static,
    AS: AttestationStore + 'static,
    T: HttpTransport + 'static,
{
    /// Build the engine and start its retry scheduler. `load()` must be
    /// called afterwards to move it from `fresh` to `running`.
    pub fn spawn(
        watcher_store: Arc<WS>,
        attestation_store: Arc<AS>,
        transport: T,
        dispatch_config: DispatchConfig,
        broadcast: BroadcastFabric,
        embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
        vector_searcher: Option<Arc<dyn VectorSearcher>>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let observer: Arc<dyn DispatchObserver> = Arc::new(broadcast.clone());
        let dispatcher = Dispatcher::new(transport, dispatch_config).with_observer(observer);

        let engine = Arc::new(Self {
            watcher_store,
            attestation_store,
            dispatcher,
            broadcast,
            embedding_provider,
            vector_searcher,
            retry_queue: RetryQueue::new(),
            limiters: Mutex::new(RateLimiterRegistry::new()),
            state: RwLock::new(EngineState::empty()),
            status: RwLock::new(EngineStatus::Fresh),
            cancel,
        });

        let retry_engine = Arc::clone(&engine);
        tokio::spawn(async move { retry_engine.run_retry_loop().await });

        engine
    }

    pub async fn status(&self) -> EngineStatus {
        *self.status.read().await
    }

    pub async fn watcher_count(&self) -> usize {
        self.state.read().await.watchers.len()
    }

    pub fn retry_queue_len(&self) -> usize {
        self.retry_queue.len()
    }

    pub fn broadcast(&self) -> &BroadcastFabric {
        &self.broadcast
    }

    pub async fn parse_error(&self, watcher_id: &str) -> Option<String> {
        self.state.read().await.parse_errors.get(watcher_id).cloned()
    }

    /// Request cooperative shutdown (§5 "Cancellation and shutdown"). Does
    /// not block; the retry loop and any in-flight dispatch observe the
    /// cancellation at their next check.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Load (or reload) every enabled watcher from storage: parse raw
    /// queries that have no materialised filter yet, lift edge-cursor
    /// watermarks, rebuild rate limiters wholesale, and swap the whole
    /// watcher/parse-error/embedding-cache state under the write lock
    /// (§9 "Global mutable state").
    pub async fn load(self: &Arc<Self>) -> Result<()> {
        let raw_watchers = self.watcher_store.list(true).await.context("loading enabled watchers")?;

        let mut kept = Vec::with_capacity(raw_watchers.len());
        let mut parse_errors = HashMap::new();

        for mut watcher in raw_watchers {
            if let Err(message) = materialise_filter(&mut watcher) {
                let _ = self.watcher_store.set_parse_error(&watcher.id, &message).await;
                parse_errors.insert(watcher.id.clone(), message);
                continue;
            }
            kept.push(watcher);
        }

        qntx_cursor::apply_cursors_on_load(self.watcher_store.as_ref(), &mut kept).await;

        let limiters = RateLimiterRegistry::build(kept.iter().map(|w| (w.id.as_str(), w.max_fires_per_minute)));

        let new_watchers: BTreeMap<String, Watcher> = kept.into_iter().map(|w| (w.id.clone(), w)).collect();

        {
            let mut state = self.state.write().await;
            let removed: Vec<String> = state
                .watchers
                .keys()
                .filter(|id| !new_watchers.contains_key(*id))
                .cloned()
                .collect();
            for id in removed {
                self.retry_queue.discard_for_watcher(&id);
            }

            state.watchers = new_watchers;
            state.parse_errors = parse_errors;
            state.embedding_cache = HashMap::new();
        }

        *self.limiters.lock().unwrap() = limiters;
        *self.status.write().await = EngineStatus::Running;
        Ok(())
    }

    /// The single entry point from the storage layer (§4.C9 step 1-5).
    pub async fn handle_attestation(self: &Arc<Self>, attestation: Attestation) {
        let watchers: Vec<Watcher> = {
            let state = self.state.read().await;
            state.watchers.values().filter(|w| w.enabled).cloned().collect()
        };

        for watcher in &watchers {
            self.evaluate_and_maybe_dispatch(watcher, &attestation).await;
        }
    }

    async fn evaluate_and_maybe_dispatch(self: &Arc<Self>, watcher: &Watcher, attestation: &Attestation) {
        let cached_embedding = {
            let state = self.state.read().await;
            state.embedding_cache.get(&watcher.id).cloned()
        };

        let provider = self.embedding_provider.as_deref();
        let outcome = qntx_match::evaluate(attestation, watcher, cached_embedding.as_ref(), provider).await;

        // §9 "Concurrent cache insertion": scheduled as an independent task
        // so the write-lock insert never happens while this read lock
        // (taken above, already released by now) was held.
        if let Some(embedding) = outcome.computed_embedding {
            let engine = Arc::clone(self);
            let watcher_id = watcher.id.clone();
            tokio::spawn(async move {
                let mut state = engine.state.write().await;
                state.embedding_cache.insert(watcher_id, embedding);
            });
        }

        if !outcome.matched {
            return;
        }

        // Step 3: broadcast happens regardless of rate-limit state.
        self.broadcast
            .post_watcher_match(None, &watcher.id, &attestation.id, outcome.similarity);

        if watcher.max_fires_per_minute == 0 {
            return;
        }
        let admitted = self.limiters.lock().unwrap().try_acquire(&watcher.id);
        if !admitted {
            return;
        }

        let engine = Arc::clone(self);
        let watcher_snapshot = watcher.clone();
        let attestation_snapshot = attestation.deep_clone();
        tokio::spawn(async move {
            engine.dispatch_initial(watcher_snapshot, attestation_snapshot).await;
        });
    }

    async fn dispatch_initial(&self, watcher: Watcher, attestation: Attestation) {
        match self.dispatcher.dispatch(&watcher, &attestation, &self.cancel).await {
            Ok(_body) => self.on_dispatch_success(&watcher, &attestation).await,
            Err(DispatchError::Shutdown) => {
                tracing::debug!(watcher_id = %watcher.id, "initial dispatch dropped: shutdown in progress");
            }
            Err(error) => {
                self.on_dispatch_failure(&watcher, &error).await;
                self.retry_queue
                    .enqueue_first_failure(&watcher.id, attestation, error.to_string(), Instant::now());
            }
        }
    }

    async fn run_retry_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.process_due_retries(Instant::now()).await;
                }
            }
        }
        *self.status.write().await = EngineStatus::Stopped;
    }

    async fn process_due_retries(self: &Arc<Self>, now: Instant) {
        for item in self.retry_queue.partition_due(now) {
            let engine = Arc::clone(self);
            tokio::spawn(async move { engine.retry_dispatch(item).await });
        }
    }

    async fn retry_dispatch(&self, item: PendingExecution) {
        let watcher = {
            let state = self.state.read().await;
            state.watchers.get(&item.watcher_id).cloned()
        };
        let Some(watcher) = watcher else {
            tracing::debug!(watcher_id = %item.watcher_id, "retry skipped: watcher no longer registered");
            return;
        };

        match self.dispatcher.dispatch(&watcher, &item.attestation, &self.cancel).await {
            Ok(_body) => self.on_dispatch_success(&watcher, &item.attestation).await,
            Err(DispatchError::Shutdown) => {
                tracing::debug!(watcher_id = %watcher.id, "retry dropped: shutdown in progress");
            }
            Err(error) => {
                self.on_dispatch_failure(&watcher, &error).await;
                let now = Instant::now();
                if self
                    .retry_queue
                    .requeue_after_failure(item, error.to_string(), now)
                    .is_none()
                {
                    tracing::warn!(watcher_id = %watcher.id, "retry attempts exhausted, dropping pending execution");
                }
            }
        }
    }

    async fn on_dispatch_success(&self, watcher: &Watcher, attestation: &Attestation) {
        let _ = self.watcher_store.record_fire(&watcher.id).await;
        if qntx_cursor::is_edge_cursor_watcher(watcher) {
            qntx_cursor::record_dispatch_success(self.watcher_store.as_ref(), watcher, attestation).await;
        }
        if let Some(glyph_id) = glyph_id_of(watcher) {
            self.broadcast.post_glyph_fired(None, &watcher.id, glyph_id);
        }
    }

    async fn on_dispatch_failure(&self, watcher: &Watcher, error: &DispatchError) {
        let _ = self.watcher_store.record_error(&watcher.id, &error.to_string()).await;
        self.broadcast.post_watcher_error(None, &watcher.id, error.to_string());
    }
}

fn glyph_id_of(watcher: &Watcher) -> Option<&str> {
    match &watcher.action_data {
        ActionData::Code { glyph_id, .. } => glyph_id.as_deref(),
        ActionData::Prompt { glyph_id, .. } => Some(glyph_id.as_str()),
        _ => None,
    }
}

/// Ensure `watcher.filter` is materialised from `raw_query` when absent,
/// and enforce the load-time invariant that at least one of `filter` /
/// `semantic_query` is set (§3). Returns the parse-error message on
/// failure; the caller is responsible for recording and excluding the
/// watcher (§7 ParseError).
fn materialise_filter(watcher: &mut Watcher) -> std::result::Result<(), String> {
    if watcher.filter.is_none() {
        if let Some(raw) = watcher.raw_query.clone() {
            match qntx_model::query::parse(&raw) {
                Ok(filter) => watcher.filter = Some(filter),
                Err(error) => return Err(error.to_string()),
            }
        }
    }

    if watcher.filter.is_none() && !watcher.has_semantic_query() {
        return Err("watcher has neither a filter nor a semantic query".to_string());
    }

    Ok(())
}
