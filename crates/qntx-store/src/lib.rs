//! qntx-store
//!
//! Durable CRUD for watchers and edge cursors, plus the read-only
//! attestation projection the historical back-query scans (§4.C2, §6).
//! Postgres-backed, following this codebase's existing `sqlx` + `anyhow`
//! plumbing idiom.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qntx_cursor::{EdgeCursorRecord, EdgeCursorStore};
use qntx_model::{Attestation, Value, Watcher};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

pub const ENV_DB_URL: &str = "QNTX_DATABASE_URL";

/// Connect to Postgres using `QNTX_DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[async_trait]
pub trait WatcherStore: Send + Sync {
    async fn list(&self, enabled_only: bool) -> Result<Vec<Watcher>>;
    async fn get(&self, id: &str) -> Result<Option<Watcher>>;
    async fn upsert(&self, watcher: &Watcher) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn record_fire(&self, id: &str) -> Result<()>;
    async fn record_error(&self, id: &str, message: &str) -> Result<()>;
    async fn set_parse_error(&self, id: &str, message: &str) -> Result<()>;
    async fn parse_error(&self, id: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait AttestationStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Attestation>>;
    /// Newest-first by timestamp, at or after `since` when given, bounded to
    /// `limit` rows (§4.C9 "Historical back-query", structural path).
    async fn scan_newest_first(&self, since: Option<DateTime<Utc>>, limit: i64) -> Result<Vec<Attestation>>;
}

pub struct PgWatcherStore {
    pool: PgPool,
}

impl PgWatcherStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_watcher(row: &sqlx::postgres::PgRow) -> Result<Watcher> {
    let filter_json: Option<serde_json::Value> = row.try_get("filter_json")?;
    let action_data_json: serde_json::Value = row.try_get("action_data")?;

    Ok(Watcher {
        id: row.try_get("id")?,
        enabled: row.try_get("enabled")?,
        raw_query: row.try_get("raw_query")?,
        filter: filter_json
            .map(serde_json::from_value)
            .transpose()
            .context("decoding watcher filter_json")?,
        semantic_query: row.try_get("semantic_query")?,
        semantic_threshold: row.try_get("semantic_threshold")?,
        action_data: serde_json::from_value(action_data_json).context("decoding watcher action_data")?,
        max_fires_per_minute: {
            let raw: i32 = row.try_get("max_fires_per_minute")?;
            raw.max(0) as u32
        },
        counters: qntx_model::WatcherCounters {
            fire_count: {
                let raw: i64 = row.try_get("fire_count")?;
                raw.max(0) as u64
            },
            error_count: {
                let raw: i64 = row.try_get("error_count")?;
                raw.max(0) as u64
            },
            last_fired_at: row.try_get("last_fired_at")?,
            last_error: row.try_get("last_error")?,
            last_errored_at: row.try_get("last_errored_at")?,
        },
    })
}

#[async_trait]
impl WatcherStore for PgWatcherStore {
    async fn list(&self, enabled_only: bool) -> Result<Vec<Watcher>> {
        let rows = if enabled_only {
            sqlx::query("select * from watchers where enabled order by id asc")
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query("select * from watchers order by id asc")
                .fetch_all(&self.pool)
                .await
        }
        .context("watchers list failed")?;

        rows.iter().map(row_to_watcher).collect()
    }

    async fn get(&self, id: &str) -> Result<Option<Watcher>> {
        let row = sqlx::query("select * from watchers where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("watchers get failed")?;

        row.as_ref().map(row_to_watcher).transpose()
    }

    async fn upsert(&self, watcher: &Watcher) -> Result<()> {
        let filter_json = watcher
            .filter
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .context("encoding watcher filter_json")?;
        let action_data_json =
            serde_json::to_value(&watcher.action_data).context("encoding watcher action_data")?;

        sqlx::query(
            r#"
            insert into watchers (
                id, enabled, raw_query, filter_json, semantic_query, semantic_threshold,
                action_data, max_fires_per_minute, fire_count, error_count,
                last_fired_at, last_error, last_errored_at, updated_at
            ) values (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now()
            )
            on conflict (id) do update set
                enabled = excluded.enabled,
                raw_query = excluded.raw_query,
                filter_json = excluded.filter_json,
                semantic_query = excluded.semantic_query,
                semantic_threshold = excluded.semantic_threshold,
                action_data = excluded.action_data,
                max_fires_per_minute = excluded.max_fires_per_minute,
                fire_count = excluded.fire_count,
                error_count = excluded.error_count,
                last_fired_at = excluded.last_fired_at,
                last_error = excluded.last_error,
                last_errored_at = excluded.last_errored_at,
                updated_at = now()
            "#,
        )
        .bind(&watcher.id)
        .bind(watcher.enabled)
        .bind(&watcher.raw_query)
        .bind(filter_json)
        .bind(&watcher.semantic_query)
        .bind(watcher.semantic_threshold)
        .bind(action_data_json)
        .bind(watcher.max_fires_per_minute as i32)
        .bind(watcher.counters.fire_count as i64)
        .bind(watcher.counters.error_count as i64)
        .bind(watcher.counters.last_fired_at)
        .bind(&watcher.counters.last_error)
        .bind(watcher.counters.last_errored_at)
        .execute(&self.pool)
        .await
        .context("watchers upsert failed")?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("delete from watchers where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("watchers delete failed")?;
        Ok(())
    }

    async fn record_fire(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            update watchers
            set fire_count = fire_count + 1,
                last_fired_at = now(),
                updated_at = now()
            where id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("watchers record_fire failed")?;
        Ok(())
    }

    async fn record_error(&self, id: &str, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            update watchers
            set error_count = error_count + 1,
                last_error = $2,
                last_errored_at = now(),
                updated_at = now()
            where id = $1
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(&self.pool)
        .await
        .context("watchers record_error failed")?;
        Ok(())
    }

    async fn set_parse_error(&self, id: &str, message: &str) -> Result<()> {
        sqlx::query("update watchers set last_parse_error = $2, updated_at = now() where id = $1")
            .bind(id)
            .bind(message)
            .execute(&self.pool)
            .await
            .context("watchers set_parse_error failed")?;
        Ok(())
    }

    async fn parse_error(&self, id: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("select last_parse_error from watchers where id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("watchers parse_error failed")?;
        Ok(row.and_then(|(v,)| v))
    }
}

#[async_trait]
impl EdgeCursorStore for PgWatcherStore {
    async fn get_edge_cursor(&self, key: (String, String, String)) -> Result<Option<EdgeCursorRecord>> {
        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            select last_processed_id, last_processed_at
            from edge_cursors
            where composition_id = $1 and from_glyph_id = $2 and to_glyph_id = $3
            "#,
        )
        .bind(&key.0)
        .bind(&key.1)
        .bind(&key.2)
        .fetch_optional(&self.pool)
        .await
        .context("edge_cursors get failed")?;

        Ok(row.map(|(last_processed_id, last_processed_at)| EdgeCursorRecord {
            last_processed_id,
            last_processed_at,
        }))
    }

    async fn upsert_edge_cursor(
        &self,
        key: (String, String, String),
        record: EdgeCursorRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            insert into edge_cursors (composition_id, from_glyph_id, to_glyph_id, last_processed_id, last_processed_at)
            values ($1, $2, $3, $4, $5)
            on conflict (composition_id, from_glyph_id, to_glyph_id) do update set
                last_processed_id = excluded.last_processed_id,
                last_processed_at = excluded.last_processed_at
            "#,
        )
        .bind(&key.0)
        .bind(&key.1)
        .bind(&key.2)
        .bind(&record.last_processed_id)
        .bind(record.last_processed_at)
        .execute(&self.pool)
        .await
        .context("edge_cursors upsert failed")?;

        Ok(())
    }
}

pub struct PgAttestationStore {
    pool: PgPool,
}

impl PgAttestationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn string_vec(value: serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn row_to_attestation(row: &sqlx::postgres::PgRow) -> Result<Attestation> {
    let subjects: serde_json::Value = row.try_get("subjects")?;
    let predicates: serde_json::Value = row.try_get("predicates")?;
    let contexts: serde_json::Value = row.try_get("contexts")?;
    let actors: serde_json::Value = row.try_get("actors")?;
    let attributes: Option<serde_json::Value> = row.try_get("attributes")?;

    let attributes = match attributes {
        Some(serde_json::Value::Object(map)) => {
            map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()
        }
        _ => std::collections::BTreeMap::new(),
    };

    Ok(Attestation::new(
        row.try_get::<String, _>("id")?,
        row.try_get("timestamp")?,
        row.try_get::<String, _>("source")?,
        string_vec(subjects),
        string_vec(predicates),
        string_vec(contexts),
        string_vec(actors),
        attributes,
    ))
}

#[async_trait]
impl AttestationStore for PgAttestationStore {
    async fn get(&self, id: &str) -> Result<Option<Attestation>> {
        let row = sqlx::query("select * from attestations where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("attestations get failed")?;

        row.as_ref().map(row_to_attestation).transpose()
    }

    async fn scan_newest_first(&self, since: Option<DateTime<Utc>>, limit: i64) -> Result<Vec<Attestation>> {
        let rows = match since {
            Some(since) => {
                sqlx::query(
                    "select * from attestations where timestamp >= $1 order by timestamp desc limit $2",
                )
                .bind(since)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("select * from attestations order by timestamp desc limit $1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("attestations scan_newest_first failed")?;

        rows.iter().map(row_to_attestation).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_vec_ignores_non_array_json() {
        assert_eq!(string_vec(serde_json::json!(["a", "b", 1])), vec!["a", "b"]);
        assert_eq!(string_vec(serde_json::Value::Null), Vec::<String>::new());
    }
}
