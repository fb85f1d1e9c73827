//! qntx-cursor
//!
//! Idempotent replay for composition-edge watchers (§4.C8). Only code-kind
//! watchers carrying a composition descriptor participate; everything here
//! is a no-op for any other watcher.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qntx_model::{Attestation, CompositionEdge, Watcher};

/// `(last_processed_attestation_id, last_processed_timestamp)` for one
/// composition edge, keyed by [`CompositionEdge::cursor_key`].
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeCursorRecord {
    pub last_processed_id: String,
    pub last_processed_at: DateTime<Utc>,
}

/// The durable half of the cursor (§6 "Edge-cursor table"), implemented by
/// the watcher store. Kept as a trait here, mirroring this codebase's
/// existing adapter-plus-fake pattern, so the load-time lift and
/// post-dispatch upsert logic can be tested without a database.
#[async_trait]
pub trait EdgeCursorStore: Send + Sync {
    async fn get_edge_cursor(&self, key: (String, String, String)) -> anyhow::Result<Option<EdgeCursorRecord>>;
    async fn upsert_edge_cursor(
        &self,
        key: (String, String, String),
        record: EdgeCursorRecord,
    ) -> anyhow::Result<()>;
}

/// `true` if `watcher` is a composition-edge watcher and therefore
/// participates in cursor tracking at all.
pub fn is_edge_cursor_watcher(watcher: &Watcher) -> bool {
    watcher.action_data.composition_edge().is_some()
}

/// On load, lift the watcher's effective `time_start` to at least the
/// cursor's `last_processed_timestamp` (§3 EdgeCursor invariant, §8 S6).
/// A watcher with a composition descriptor but no filter at all gets a
/// wildcard filter created so the lift has somewhere to land.
pub fn apply_cursor_on_load(watcher: &mut Watcher, cursor: Option<&EdgeCursorRecord>) {
    if watcher.action_data.composition_edge().is_none() {
        return;
    }
    let Some(cursor) = cursor else {
        return;
    };
    let filter = watcher
        .filter
        .get_or_insert_with(qntx_model::Filter::wildcard);
    filter.lift_time_start(cursor.last_processed_at);
}

/// Load every registered edge-cursor watcher's cursor from `store` and lift
/// its filter accordingly. Best-effort per watcher: a read failure is
/// logged and that watcher is left unmodified rather than failing the
/// whole load.
pub async fn apply_cursors_on_load<S: EdgeCursorStore>(store: &S, watchers: &mut [Watcher]) {
    for watcher in watchers.iter_mut() {
        let Some(edge) = watcher.action_data.composition_edge().cloned() else {
            continue;
        };
        match store.get_edge_cursor(edge.cursor_key()).await {
            Ok(cursor) => apply_cursor_on_load(watcher, cursor.as_ref()),
            Err(error) => {
                tracing::warn!(watcher_id = %watcher.id, %error, "failed to read edge cursor at load");
            }
        }
    }
}

/// After a successful dispatch, upsert the cursor to the just-dispatched
/// attestation's id/timestamp (§4.C8). Fire-and-forget: a write failure is
/// logged at `warn!` and never rolls back the dispatch's success state.
pub async fn record_dispatch_success<S: EdgeCursorStore>(
    store: &S,
    watcher: &Watcher,
    attestation: &Attestation,
) {
    let Some(edge) = watcher.action_data.composition_edge() else {
        return;
    };
    let record = EdgeCursorRecord {
        last_processed_id: attestation.id.clone(),
        last_processed_at: attestation.timestamp,
    };
    if let Err(error) = store.upsert_edge_cursor(edge.cursor_key(), record).await {
        tracing::warn!(
            watcher_id = %watcher.id,
            %error,
            "failed to persist edge cursor after successful dispatch"
        );
    }
}
