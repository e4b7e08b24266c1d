//! HTTP frontend
//!
//! `POST /rpc` carries one length-prefixed bincode frame in the request
//! body and returns one in the response. `/metrics` serves the Prometheus
//! text exposition, `/health` a small JSON status document.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::metrics;
use crate::rpc::{decode_request, encode_response, RpcResponse, RpcService};

/// Shared HTTP state
pub struct AppState {
    pub rpc: Arc<RpcService>,
}

/// Build the HTTP router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/rpc", post(rpc))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    axum::Json(HealthResponse {
        status: "ok",
        version: tickstore_core::VERSION,
    })
}

async fn rpc(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    let response = match decode_request(&body) {
        Ok(request) => state.rpc.handle(request),
        Err(message) => RpcResponse::Error {
            kind: "invalid_format".into(),
            message,
        },
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        encode_response(&response),
    )
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}
