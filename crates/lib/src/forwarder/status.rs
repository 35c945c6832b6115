//! Status HTTP server: health, delivery statistics and failed-permanent records, read from the store.

use crate::store::Store;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const PROTOCOL_VERSION: u32 = 1;

pub fn router(store: Arc<Store>) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/stats", get(stats_http))
        .route("/failed", get(failed_http))
        .with_state(store)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    listener: tokio::net::TcpListener,
    store: Arc<Store>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("status server listening on {}", addr);
    }
    axum::serve(listener, router(store))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    log::info!("status server stopped");
    Ok(())
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(store): State<Arc<Store>>) -> (StatusCode, Json<serde_json::Value>) {
    match store.get_checkpoint().await {
        Ok(checkpoint) => (
            StatusCode::OK,
            Json(json!({
                "runtime": "running",
                "protocol": PROTOCOL_VERSION,
                "checkpoint": checkpoint,
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "runtime": "degraded", "error": e.to_string() })),
        ),
    }
}

async fn stats_http(State(store): State<Arc<Store>>) -> (StatusCode, Json<serde_json::Value>) {
    match store.stats().await {
        Ok(stats) => (StatusCode::OK, Json(json!(stats))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn failed_http(State(store): State<Arc<Store>>) -> (StatusCode, Json<serde_json::Value>) {
    match store.list_failed().await {
        Ok(records) => (StatusCode::OK, Json(json!({ "failed": records }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}
