use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, TextEncoder};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::metrics::REGISTRY;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/* ============================= SERVER ============================= */

/// Health endpoint for the engine: liveness, readiness (all clusters synced)
/// and prometheus metrics. Anything else is a 404.
pub struct HealthzServer {
    addr: SocketAddr,
    ready: Arc<AtomicBool>,
}

impl HealthzServer {
    pub fn new(addr: SocketAddr, ready: Arc<AtomicBool>) -> Self {
        Self { addr, ready }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let app = build_router(self.ready);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("Failed to bind health server on {}", self.addr))?;

        info!(addr = %self.addr, "health_server_started");

        let mut force_shutdown = shutdown.resubscribe();

        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        });

        // Bound the graceful drain so a hung connection cannot block shutdown.
        tokio::select! {
            result = serve => result.context("health server error")?,
            _ = async {
                let _ = force_shutdown.recv().await;
                tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
            } => {
                warn!("health server did not drain within the shutdown timeout");
            }
        }

        info!("health_server_stopped");
        Ok(())
    }
}

/* ============================= ROUTER ============================= */

pub(crate) fn build_router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let ready = ready.clone();
                move || ready_handler(ready.clone())
            }),
        )
        .route("/metrics", get(metrics_handler))
}

async fn ready_handler(ready: Arc<AtomicBool>) -> impl IntoResponse {
    if ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */
