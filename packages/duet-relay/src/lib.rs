//! Duet Relay Server
//!
//! A small WebSocket relay that brokers connection setup between two
//! browsers that want to start a direct video call:
//!
//! 1. **Presence**: clients `identify` with a logical user id; every
//!    connection receives the sorted `online-list` whenever it changes.
//!
//! 2. **Signaling relay**: `call-user`, `answer-call`, `ice-candidate` and
//!    `hangup-call` are forwarded to whichever connection currently holds the
//!    target user id. Payloads are opaque and forwarded verbatim; unknown
//!    targets are dropped silently.
//!
//! 3. **User directory**: a read-only `GET /api/users` listing.
//!
//! No call state is kept server-side, and nothing is persisted: after a
//! restart every client must identify again.

pub mod directory;
pub mod handler;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod state;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::{HeaderValue, Method},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::{RelayConfig, RelayState};

/// Build the HTTP/WebSocket router for a relay instance.
pub fn app(state: RelayState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/users", get(directory::api::list_users))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = origin.as_str(), "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "duet-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "online_users": state.registry.online_count(),
        "open_connections": state.registry.connection_count(),
        "directory_size": state.directory.len(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}
