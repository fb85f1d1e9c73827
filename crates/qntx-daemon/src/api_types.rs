//! Request and response types for all qntx-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded by
//! Axum and decoded by tests. No business logic lives here.

use qntx_model::{ActionData, Filter, Watcher, WatcherCounters};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub engine_ready: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub engine_status: qntx_engine::EngineStatus,
    pub watcher_count: usize,
    pub retry_queue_len: usize,
    pub subscriber_count: usize,
    pub broadcast_drops: u64,
    pub config_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Body for `POST /v1/watchers` and `PUT /v1/watchers/:id`. `raw_query` and
/// `filter` are mutually optional; at least one of `raw_query`/`filter`/
/// `semantic_query` must end up set or load will record a parse error for
/// this watcher (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherUpsertRequest {
    pub id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub raw_query: Option<String>,
    #[serde(default)]
    pub filter: Option<Filter>,
    #[serde(default)]
    pub semantic_query: Option<String>,
    #[serde(default)]
    pub semantic_threshold: f32,
    pub action_data: ActionData,
    #[serde(default)]
    pub max_fires_per_minute: u32,
}

impl WatcherUpsertRequest {
    pub fn into_watcher(self, existing_counters: Option<WatcherCounters>) -> Watcher {
        Watcher {
            id: self.id,
            enabled: self.enabled,
            raw_query: self.raw_query,
            filter: self.filter,
            semantic_query: self.semantic_query,
            semantic_threshold: self.semantic_threshold,
            action_data: self.action_data,
            max_fires_per_minute: self.max_fires_per_minute,
            counters: existing_counters.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseErrorResponse {
    pub watcher_id: String,
    pub parse_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoricalQueryParams {
    #[serde(default)]
    pub since: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoricalQueryResponse {
    pub watcher_id: String,
    pub matches: Vec<HistoricalMatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoricalMatch {
    pub attestation_id: String,
    pub similarity: f32,
}
