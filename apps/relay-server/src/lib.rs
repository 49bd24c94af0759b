//! PartSync relay: the coherence point between syncing clients.
//!
//! Owns diff history and the lock table, never authoritative content.
//! Exposed as a library so the end-to-end tests can mount the router on an
//! ephemeral port.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub mod dashboard;
pub mod locks;
pub mod state;
pub mod ws;

pub use state::RelayState;

pub fn app(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(api_status))
        .route("/ws", get(ws::ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    let uptime = state.uptime_ms();
    Json(serde_json::json!({
        "status": "ok",
        "name": "partsync-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime,
        "uptimeHuman": human_uptime(uptime),
    }))
}

async fn api_status(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "port": state.port,
    }))
}

fn human_uptime(ms: i64) -> String {
    let secs = ms / 1_000;
    let (h, m, s) = (secs / 3_600, (secs % 3_600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
