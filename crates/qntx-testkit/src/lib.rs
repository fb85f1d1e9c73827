//! qntx-testkit
//!
//! Deterministic fakes for the engine's collaborators: an in-memory
//! `WatcherStore`, a scripted HTTP transport, and a scripted embedding
//! provider/searcher pair. No randomness, no wall-clock reads; tests that
//! need time control pass `now` in rather than sleeping. Mirrors this
//! codebase's existing `FakeBroker` style: minimal, script-driven, used
//! only from tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qntx_dispatch::{HttpResponse, HttpTransport, TransportError};
use qntx_embedding::{Embedding, EmbeddingError, EmbeddingProvider, SearchHit, VectorSearcher};
use qntx_model::{Attestation, Watcher};
use qntx_store::{AttestationStore, WatcherStore};

/// In-memory `WatcherStore`. Also implements `qntx_cursor::EdgeCursorStore`
/// so a single fake can stand in for `PgWatcherStore` in engine tests.
#[derive(Default)]
pub struct FakeWatcherStore {
    watchers: Mutex<HashMap<String, Watcher>>,
    parse_errors: Mutex<HashMap<String, String>>,
    cursors: Mutex<HashMap<(String, String, String), qntx_cursor::EdgeCursorRecord>>,
}

impl FakeWatcherStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, watcher: Watcher) {
        self.watchers.lock().unwrap().insert(watcher.id.clone(), watcher);
    }
}

#[async_trait]
impl WatcherStore for FakeWatcherStore {
    async fn list(&self, enabled_only: bool) -> Result<Vec<Watcher>> {
        let mut out: Vec<Watcher> = self
            .watchers
            .lock()
            .unwrap()
            .values()
            .filter(|w| !enabled_only || w.enabled)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn get(&self, id: &str) -> Result<Option<Watcher>> {
        Ok(self.watchers.lock().unwrap().get(id).cloned())
    }

    async fn upsert(&self, watcher: &Watcher) -> Result<()> {
        self.watchers
            .lock()
            .unwrap()
            .insert(watcher.id.clone(), watcher.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.watchers.lock().unwrap().remove(id);
        Ok(())
    }

    async fn record_fire(&self, id: &str) -> Result<()> {
        if let Some(w) = self.watchers.lock().unwrap().get_mut(id) {
            w.counters.fire_count += 1;
            w.counters.last_fired_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_error(&self, id: &str, message: &str) -> Result<()> {
        if let Some(w) = self.watchers.lock().unwrap().get_mut(id) {
            w.counters.error_count += 1;
            w.counters.last_error = Some(message.to_string());
            w.counters.last_errored_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_parse_error(&self, id: &str, message: &str) -> Result<()> {
        self.parse_errors.lock().unwrap().insert(id.to_string(), message.to_string());
        Ok(())
    }

    async fn parse_error(&self, id: &str) -> Result<Option<String>> {
        Ok(self.parse_errors.lock().unwrap().get(id).cloned())
    }
}

#[async_trait]
impl qntx_cursor::EdgeCursorStore for FakeWatcherStore {
    async fn get_edge_cursor(&self, key: (String, String, String)) -> Result<Option<qntx_cursor::EdgeCursorRecord>> {
        Ok(self.cursors.lock().unwrap().get(&key).cloned())
    }

    async fn upsert_edge_cursor(&self, key: (String, String, String), record: qntx_cursor::EdgeCursorRecord) -> Result<()> {
        self.cursors.lock().unwrap().insert(key, record);
        Ok(())
    }
}

/// In-memory `AttestationStore` backed by a plain `Vec`, scanned
/// newest-first on every call (fine at test scale).
#[derive(Default)]
pub struct FakeAttestationStore {
    attestations: Mutex<Vec<Attestation>>,
}

impl FakeAttestationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, attestation: Attestation) {
        self.attestations.lock().unwrap().push(attestation);
    }
}

#[async_trait]
impl AttestationStore for FakeAttestationStore {
    async fn get(&self, id: &str) -> Result<Option<Attestation>> {
        Ok(self
            .attestations
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn scan_newest_first(&self, since: Option<DateTime<Utc>>, limit: i64) -> Result<Vec<Attestation>> {
        let mut items: Vec<Attestation> = self
            .attestations
            .lock()
            .unwrap()
            .iter()
            .filter(|a| since.map(|s| a.timestamp >= s).unwrap_or(true))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }
}

/// One scripted HTTP response, or a transport-level failure.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Ok { status: u16, body: Vec<u8> },
    Err(TransportError),
}

impl ScriptedResponse {
    pub fn ok(status: u16, body: impl Into<Vec<u8>>) -> Self {
        ScriptedResponse::Ok { status, body: body.into() }
    }
}

/// One recorded call, for assertions on what the dispatcher actually sent.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub url: String,
    pub body: serde_json::Value,
}

/// Scripted `HttpTransport`: each call pops the next queued response (or
/// repeats the last one forever once the queue is drained, so tests don't
/// need to pre-script an exact call count).
#[derive(Default)]
pub struct FakeDispatchTransport {
    responses: Mutex<Vec<ScriptedResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeDispatchTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, responses: Vec<ScriptedResponse>) {
        *self.responses.lock().unwrap() = responses;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for FakeDispatchTransport {
    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
        _deadline: std::time::Duration,
    ) -> Result<HttpResponse, TransportError> {
        self.calls.lock().unwrap().push(RecordedCall {
            url: url.to_string(),
            body,
        });

        let mut responses = self.responses.lock().unwrap();
        let next = if responses.len() > 1 {
            responses.remove(0)
        } else {
            responses.first().cloned().unwrap_or(ScriptedResponse::Ok { status: 200, body: Vec::new() })
        };

        match next {
            ScriptedResponse::Ok { status, body } => Ok(HttpResponse { status, body }),
            ScriptedResponse::Err(e) => Err(e),
        }
    }
}

/// Scripted `EmbeddingProvider` + `VectorSearcher`: returns a fixed
/// embedding for any text, and a fixed list of hits for any search,
/// regardless of input. Good enough for engine-level tests that only care
/// about how a similarity score routes, not how it was computed.
pub struct FixedEmbeddingProvider {
    embedding: Embedding,
    hits: Vec<SearchHit>,
}

impl FixedEmbeddingProvider {
    pub fn new(embedding: Embedding, hits: Vec<SearchHit>) -> Self {
        Self { embedding, hits }
    }
}

#[async_trait]
impl EmbeddingProvider for FixedEmbeddingProvider {
    async fn generate(&self, _text: &str) -> Result<Embedding, EmbeddingError> {
        Ok(self.embedding.clone())
    }
}

#[async_trait]
impl VectorSearcher for FixedEmbeddingProvider {
    async fn search(&self, _query_blob: &[u8], limit: usize, threshold: f32) -> Result<Vec<SearchHit>, EmbeddingError> {
        Ok(self
            .hits
            .iter()
            .filter(|h| h.similarity >= threshold)
            .take(limit)
            .cloned()
            .collect())
    }
}
