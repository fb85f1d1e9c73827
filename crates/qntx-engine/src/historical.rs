//! Historical back-query (§4.C9 "Historical query"): run one watcher
//! against attestations that already exist, rather than waiting for new
//! ones. Two paths depending on whether the watcher has a semantic query
//! and a vector searcher is attached; results are broadcast the same way a
//! live match is, just never dispatched.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use qntx_cursor::EdgeCursorStore;
use qntx_dispatch::HttpTransport;
use qntx_model::Watcher;
use qntx_store::{AttestationStore, WatcherStore};

use crate::{WatcherEngine, HISTORICAL_SCAN_LIMIT};

/// `(attestation_id, similarity)` pairs for every match found, ordered by
/// descending similarity on the semantic path and by descending recency on
/// the structural path. Also broadcasts a `watcher_match` event per hit, the
/// same as the live evaluation path does.
pub async fn historical_query<WS, AS, T>(
    engine: &Arc<WatcherEngine<WS, AS, T>>,
    watcher_id: &str,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<(String, f32)>>
where
    WS: WatcherStore + EdgeCursorStore + 'static,
    AS: AttestationStore + 'static,
    T: HttpTransport + 'static,
{
    let watcher = {
        let state = engine.state.read().await;
        state.watchers.get(watcher_id).cloned()
    }
    .with_context(|| format!("unknown watcher: {watcher_id}"))?;

    if watcher.has_semantic_query() && engine.embedding_provider.is_some() {
        if let Some(searcher) = &engine.vector_searcher {
            return semantic_scan(engine, &watcher, searcher.as_ref()).await;
        }
    }

    structural_scan(engine, &watcher, since).await
}

async fn semantic_scan<WS, AS, T>(
    engine: &Arc<WatcherEngine<WS, AS, T>>,
    watcher: &Watcher,
    searcher: &dyn qntx_embedding::VectorSearcher,
) -> Result<Vec<(String, f32)>>
where
    WS: WatcherStore + EdgeCursorStore + 'static,
    AS: AttestationStore + 'static,
    T: HttpTransport + 'static,
{
    let cached = {
        let state = engine.state.read().await;
        state.embedding_cache.get(&watcher.id).cloned()
    };

    let embedding = match cached {
        Some(embedding) => embedding,
        None => {
            let provider = engine
                .embedding_provider
                .as_deref()
                .context("no embedding provider attached to generate the watcher's query embedding")?;
            let query_text = watcher.semantic_query.as_deref().unwrap_or_default();
            let embedding = provider
                .generate(query_text)
                .await
                .map_err(|e| anyhow::anyhow!("embedding generation failed: {e}"))?;
            let mut state = engine.state.write().await;
            state.embedding_cache.insert(watcher.id.clone(), embedding.clone());
            embedding
        }
    };

    let hits = searcher
        .search(&embedding.serialize(), 50, watcher.effective_threshold())
        .await
        .map_err(|e| anyhow::anyhow!("vector search failed: {e}"))?;

    let mut results = Vec::with_capacity(hits.len());
    for hit in &hits {
        engine
            .broadcast
            .post_watcher_match(None, &watcher.id, &hit.source_id, hit.similarity);
        results.push((hit.source_id.clone(), hit.similarity));
    }
    Ok(results)
}

/// No vector searcher attached, or the provider is missing, or the watcher
/// has no semantic query at all: scan stored attestations newest-first and
/// re-run the full §4.C5 match evaluation over each, bounded to
/// [`HISTORICAL_SCAN_LIMIT`] rows. A watcher with a semantic query but no
/// searcher still gets scored semantically here, same as the live path —
/// it's only the vector-index lookup that's unavailable, not scoring itself.
async fn structural_scan<WS, AS, T>(
    engine: &Arc<WatcherEngine<WS, AS, T>>,
    watcher: &Watcher,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<(String, f32)>>
where
    WS: WatcherStore + EdgeCursorStore + 'static,
    AS: AttestationStore + 'static,
    T: HttpTransport + 'static,
{
    let attestations = engine
        .attestation_store
        .scan_newest_first(since, HISTORICAL_SCAN_LIMIT)
        .await
        .context("scanning attestations for historical query")?;

    let mut cached_embedding = {
        let state = engine.state.read().await;
        state.embedding_cache.get(&watcher.id).cloned()
    };
    let provider = engine.embedding_provider.as_deref();

    let mut results = Vec::new();
    for attestation in &attestations {
        let outcome = qntx_match::evaluate(attestation, watcher, cached_embedding.as_ref(), provider).await;

        if let Some(embedding) = outcome.computed_embedding {
            cached_embedding = Some(embedding.clone());
            let state_engine = Arc::clone(engine);
            let watcher_id = watcher.id.clone();
            tokio::spawn(async move {
                let mut state = state_engine.state.write().await;
                state.embedding_cache.insert(watcher_id, embedding);
            });
        }

        if !outcome.matched {
            continue;
        }
        engine
            .broadcast
            .post_watcher_match(None, &watcher.id, &attestation.id, outcome.similarity);
        results.push((attestation.id.clone(), outcome.similarity));
    }
    Ok(results)
}
