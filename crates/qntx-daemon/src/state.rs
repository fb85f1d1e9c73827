//! Shared runtime state for qntx-daemon.
//!
//! All types here are `Clone`-able (via `Arc`). Handlers receive
//! `State<Arc<AppState>>` from Axum; this module owns nothing async itself.

use std::sync::Arc;
use std::time::Instant;

use qntx_broadcast::BroadcastFabric;
use qntx_dispatch::ReqwestTransport;
use qntx_store::{PgAttestationStore, PgWatcherStore};
use tokio_util::sync::CancellationToken;

/// Concrete engine type this binary wires up: Postgres-backed stores plus a
/// real `reqwest` transport. Tests substitute `qntx-testkit`'s fakes instead
/// of reaching for this alias.
pub type Engine = qntx_engine::WatcherEngine<PgWatcherStore, PgAttestationStore, ReqwestTransport>;

#[derive(Clone)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub watcher_store: Arc<PgWatcherStore>,
    pub broadcast: BroadcastFabric,
    pub build: BuildInfo,
    pub config_hash: String,
    pub cancel: CancellationToken,
    started_at: Arc<Instant>,
}

impl AppState {
    pub fn new(
        engine: Arc<Engine>,
        watcher_store: Arc<PgWatcherStore>,
        broadcast: BroadcastFabric,
        config_hash: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            watcher_store,
            broadcast,
            build: BuildInfo {
                service: "qntx-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            config_hash,
            cancel,
            started_at: Arc::new(Instant::now()),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
