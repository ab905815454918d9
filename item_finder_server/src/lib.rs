//! HTTP front end for the `item_finder` engine.
//!
//! Exposes the submission endpoint (`POST /api/search`), the live progress feed
//! (`GET /ws/progress`) and a health check, plus the HTTP adapters that connect
//! the engine to its model, storage and search services.

use std::net::SocketAddr;

use anyhow::{Context, Result};

pub mod config;
pub mod providers;
pub mod routes;

pub use config::ServerConfig;
pub use routes::{AppState, SearchResponse, router};

/// A server task bound to `addr`.
pub struct RunningServer {
    pub addr: SocketAddr,
    pub handle: tokio::task::JoinHandle<()>,
}

/// Binds `cfg.bind_addr` and serves the API on a background task.
pub async fn start_server(state: AppState, cfg: &ServerConfig) -> Result<RunningServer> {
    let app = router(state, cfg.max_upload_bytes);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind_addr))?;
    let addr = listener.local_addr().context("listener has no local address")?;

    let handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!("HTTP server error: {err}");
        }
    });

    Ok(RunningServer { addr, handle })
}
