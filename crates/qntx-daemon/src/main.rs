//! qntx-daemon entry point.
//!
//! This file is intentionally thin: it loads configuration, connects to
//! Postgres, builds the engine and broadcast fabric, wires middleware, and
//! starts the HTTP server. All route handlers live in `routes.rs`; all
//! shared state types live in `state.rs`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use qntx_daemon::{routes, state};
use qntx_dispatch::{DispatchConfig, ReqwestTransport};
use qntx_store::{PgAttestationStore, PgWatcherStore};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config_paths = config_paths_from_env();
    let path_refs: Vec<&str> = config_paths.iter().map(String::as_str).collect();
    let loaded = qntx_config::load_layered_yaml(&path_refs)
        .with_context(|| format!("loading layered config from {config_paths:?}"))?;
    let config = loaded.parse().context("config document failed validation")?;
    info!(config_hash = %loaded.config_hash, "configuration loaded");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;
    qntx_store::migrate(&pool).await?;

    let watcher_store = Arc::new(PgWatcherStore::new(pool.clone()));
    let attestation_store = Arc::new(PgAttestationStore::new(pool));

    let cancel = CancellationToken::new();
    let (broadcast, _broadcast_handle) =
        qntx_broadcast::BroadcastFabric::spawn(config.broadcast_request_capacity, cancel.clone());

    let dispatch_config = DispatchConfig {
        code_runner_base_url: config.code_runner_base_url.clone(),
        prompt_runner_base_url: config.prompt_runner_base_url.clone(),
        deadline: std::time::Duration::from_secs(config.http_deadline_secs),
    };

    let engine = qntx_engine::WatcherEngine::spawn(
        watcher_store.clone(),
        attestation_store,
        ReqwestTransport::new(),
        dispatch_config,
        broadcast.clone(),
        None,
        None,
        cancel.clone(),
    );
    engine.load().await.context("initial watcher load failed")?;

    let shared = Arc::new(state::AppState::new(
        engine,
        watcher_store,
        broadcast,
        loaded.config_hash,
        cancel.clone(),
    ));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!("qntx-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("QNTX_DAEMON_ADDR").ok()?.parse().ok()
}

fn config_paths_from_env() -> Vec<String> {
    std::env::var("QNTX_CONFIG_PATHS")
        .ok()
        .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|| vec!["config/base.yaml".to_string()])
}

/// Cooperative shutdown (§5): SIGINT/SIGTERM cancel the shared token, which
/// the retry loop and any in-flight dispatch observe, then Axum stops
/// accepting new connections and drains in-flight ones.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
    cancel.cancel();
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
