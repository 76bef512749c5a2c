//! Liveness and readiness probes.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

pub fn router(ready: watch::Receiver<bool>) -> Router {
    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/readiness", get(readiness))
        .with_state(ready)
}

async fn readiness(State(ready): State<watch::Receiver<bool>>) -> StatusCode {
    if *ready.borrow() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Serve the probes until `stop` turns true.
pub async fn serve(addr: SocketAddr, ready: watch::Receiver<bool>, mut stop: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding health server to {}", addr))?;
    info!(addr = %addr, "health server listening");
    axum::serve(listener, router(ready))
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|s| *s).await;
        })
        .await
        .context("health server")
}
