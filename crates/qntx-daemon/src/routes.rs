//! Axum router and all HTTP handlers for qntx-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so router-level tests
//! can compose the router directly.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{stream, Stream, StreamExt};
use qntx_model::Watcher;
use qntx_store::WatcherStore;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use uuid::Uuid;

use crate::{
    api_types::{
        ErrorResponse, HealthResponse, HistoricalMatch, HistoricalQueryParams,
        HistoricalQueryResponse, ParseErrorResponse, StatusResponse, WatcherUpsertRequest,
    },
    state::AppState,
};

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/events", get(events))
        .route("/v1/watchers", get(list_watchers).post(create_watcher))
        .route(
            "/v1/watchers/:id",
            get(get_watcher).put(update_watcher).delete(delete_watcher),
        )
        .route("/v1/watchers/:id/enable", post(enable_watcher))
        .route("/v1/watchers/:id/disable", post(disable_watcher))
        .route("/v1/watchers/:id/parse-error", get(parse_error))
        .route("/v1/watchers/:id/historical-query", get(historical_query))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let engine_ready = st.engine.status().await == qntx_engine::EngineStatus::Running;
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: engine_ready,
            engine_ready,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = StatusResponse {
        uptime_secs: st.uptime_secs(),
        engine_status: st.engine.status().await,
        watcher_count: st.engine.watcher_count().await,
        retry_queue_len: st.engine.retry_queue_len(),
        subscriber_count: st.broadcast.subscriber_count().await,
        broadcast_drops: st.broadcast.broadcast_drops(),
        config_hash: st.config_hash.clone(),
    };
    (StatusCode::OK, Json(snapshot))
}

// ---------------------------------------------------------------------------
// GET /v1/events  (SSE fan-out, §4.C10)
// ---------------------------------------------------------------------------

pub(crate) async fn events(State(st): State<Arc<AppState>>) -> Response {
    let client_id = Uuid::new_v4().to_string();
    let receivers = st.broadcast.register(client_id, 256).await;

    let msg_stream = ReceiverStream::new(receivers.msg_rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().event("message").data(data))
    });
    let log_stream = ReceiverStream::new(receivers.log_rx).map(|batch| {
        let data = serde_json::to_string(&batch).unwrap_or_default();
        Ok(Event::default().event("log").data(data))
    });
    let graph_stream = ReceiverStream::new(receivers.graph_rx).map(|graph| {
        let data = serde_json::to_string(&graph).unwrap_or_default();
        Ok(Event::default().event("graph").data(data))
    });

    type BoxedEventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

    let merged: BoxedEventStream = Box::pin(stream::select_all([
        Box::pin(msg_stream) as BoxedEventStream,
        Box::pin(log_stream) as BoxedEventStream,
        Box::pin(graph_stream) as BoxedEventStream,
    ]));

    Sse::new(merged).keep_alive(KeepAlive::new()).into_response()
}

// ---------------------------------------------------------------------------
// Watcher CRUD (§4.C2)
// ---------------------------------------------------------------------------

pub(crate) async fn list_watchers(State(st): State<Arc<AppState>>) -> Response {
    match st.watcher_store.list(false).await {
        Ok(watchers) => (StatusCode::OK, Json(watchers)).into_response(),
        Err(error) => internal_error(error),
    }
}

pub(crate) async fn get_watcher(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match st.watcher_store.get(&id).await {
        Ok(Some(watcher)) => (StatusCode::OK, Json(watcher)).into_response(),
        Ok(None) => not_found(&id),
        Err(error) => internal_error(error),
    }
}

pub(crate) async fn create_watcher(
    State(st): State<Arc<AppState>>,
    Json(body): Json<WatcherUpsertRequest>,
) -> Response {
    let watcher = body.into_watcher(None);
    upsert_and_reload(&st, watcher).await
}

pub(crate) async fn update_watcher(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<WatcherUpsertRequest>,
) -> Response {
    if body.id != id {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "watcher id in body must match the path".to_string(),
            }),
        )
            .into_response();
    }

    let existing_counters = match st.watcher_store.get(&id).await {
        Ok(existing) => existing.map(|w| w.counters),
        Err(error) => return internal_error(error),
    };

    let watcher = body.into_watcher(existing_counters);
    upsert_and_reload(&st, watcher).await
}

pub(crate) async fn delete_watcher(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if let Err(error) = st.watcher_store.delete(&id).await {
        return internal_error(error);
    }
    reload_or_500(&st).await;
    StatusCode::NO_CONTENT.into_response()
}

pub(crate) async fn enable_watcher(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    set_enabled(&st, &id, true).await
}

pub(crate) async fn disable_watcher(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    set_enabled(&st, &id, false).await
}

async fn set_enabled(st: &Arc<AppState>, id: &str, enabled: bool) -> Response {
    let mut watcher = match st.watcher_store.get(id).await {
        Ok(Some(watcher)) => watcher,
        Ok(None) => return not_found(id),
        Err(error) => return internal_error(error),
    };
    watcher.enabled = enabled;
    upsert_and_reload(st, watcher).await
}

async fn upsert_and_reload(st: &Arc<AppState>, watcher: Watcher) -> Response {
    if let Err(error) = st.watcher_store.upsert(&watcher).await {
        return internal_error(error);
    }
    reload_or_500(st).await;
    (StatusCode::OK, Json(watcher)).into_response()
}

async fn reload_or_500(st: &Arc<AppState>) {
    if let Err(error) = st.engine.load().await {
        tracing::error!(%error, "watcher reload failed after CRUD mutation");
    } else {
        info!("watchers reloaded");
    }
}

pub(crate) async fn parse_error(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    let parse_error = st.engine.parse_error(&id).await;
    Json(ParseErrorResponse {
        watcher_id: id,
        parse_error,
    })
}

// ---------------------------------------------------------------------------
// GET /v1/watchers/:id/historical-query  (§4.C9 historical back-query)
// ---------------------------------------------------------------------------

pub(crate) async fn historical_query(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<HistoricalQueryParams>,
) -> Response {
    match qntx_engine::historical_query(&st.engine, &id, params.since).await {
        Ok(matches) => (
            StatusCode::OK,
            Json(HistoricalQueryResponse {
                watcher_id: id,
                matches: matches
                    .into_iter()
                    .map(|(attestation_id, similarity)| HistoricalMatch {
                        attestation_id,
                        similarity,
                    })
                    .collect(),
            }),
        )
            .into_response(),
        Err(error) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: error.to_string(),
            }),
        )
            .into_response(),
    }
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("no watcher with id {id}"),
        }),
    )
        .into_response()
}

fn internal_error(error: anyhow::Error) -> Response {
    tracing::error!(%error, "watcher store operation failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}
