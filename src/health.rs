//! HTTP health endpoint.
//!
//! `GET /health` returns `200 {"status":"ok"}`; every other path is a 404.
//! The server runs for the lifetime of the process on the configured port.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn not_found() -> impl IntoResponse {
    StatusCode::NOT_FOUND
}

/// Build the health router.
pub fn router() -> Router {
    Router::new().route("/health", get(health)).fallback(not_found)
}

/// Bind and serve the health endpoint until the process exits.
pub async fn serve(port: u16) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port = port, "health endpoint listening");
    axum::serve(listener, router()).await
}
