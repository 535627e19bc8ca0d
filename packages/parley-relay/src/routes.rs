//! HTTP surface: the WebSocket endpoint plus health, stats and info.

use axum::{
    extract::{State, WebSocketUpgrade},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handler;
use crate::state::RelayState;

/// Build the relay's router over `state`.
pub fn app(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/info", get(info_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// WebSocket upgrade handler for client connections.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "parley-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    match state.stored_message_count().await {
        Ok(stored) => Json(json!({
            "online_principals": state.online_count(),
            "privileged_listeners": state.privileged_listener_count(),
            "stored_messages": stored,
        }))
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read stats");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.client_message() })),
            )
                .into_response()
        }
    }
}

/// Server info endpoint. Also useful for client-side ping measurement.
async fn info_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "service": "parley-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "region": state.config.region,
        "max_content_chars": state.config.max_content_chars,
        "online_principals": state.online_count(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}
