//! `POST /webhooks/github` — inbound webhook HTTP surface.

use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use super::ingestor::WebhookIngestor;
use crate::error::OrchestratorError;

#[derive(Clone)]
pub struct WebhookState {
    pub ingestor: Arc<WebhookIngestor>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/github", post(handle_webhook))
        .route("/webhooks/github/replay/:delivery_id", post(handle_replay))
        .layer(Extension(state))
}

async fn handle_webhook(
    Extension(state): Extension<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let event_type = match headers.get("x-github-event").and_then(|v| v.to_str().ok()) {
        Some(v) => v.to_string(),
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "validationErrors": ["missing X-GitHub-Event header"] })),
            )
        }
    };

    let delivery_id = match headers.get("x-github-delivery").and_then(|v| v.to_str().ok()) {
        Some(v) => v.to_string(),
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "validationErrors": ["missing X-GitHub-Delivery header"] })),
            )
        }
    };

    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if !state.ingestor.verify_signature(&body, signature_header.as_deref()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "validationErrors": ["signature verification failed"] })),
        );
    }

    match state.ingestor.ingest(&event_type, &delivery_id, &body).await {
        Ok(result) => (
            StatusCode::OK,
            Json(json!({
                "success": result.success,
                "processed": result.processed,
                "deduplicated": result.deduplicated,
                "message": result.message,
                "processingTimeMs": result.processing_time_ms,
            })),
        ),
        Err(OrchestratorError::Validation(msg)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "validationErrors": [msg] })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": e.to_string() })),
        ),
    }
}

async fn handle_replay(
    Extension(state): Extension<WebhookState>,
    Path(delivery_id): Path<String>,
) -> impl IntoResponse {
    match state.ingestor.replay(&delivery_id).await {
        Ok(result) => (
            StatusCode::OK,
            Json(json!({
                "success": result.success,
                "processed": result.processed,
                "message": result.message,
                "processingTimeMs": result.processing_time_ms,
            })),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": e.to_string() })),
        ),
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    database: DatabaseHealth,
    connection_pool: ConnectionPoolHealth,
    event_bus: String,
}

#[derive(Serialize)]
pub struct DatabaseHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
pub struct ConnectionPoolHealth {
    size: u32,
    idle_connections: usize,
}

pub fn health_router(storage: Arc<crate::storage::StorageGateway>) -> Router {
    Router::new().route("/health", get(move || health_handler(storage.clone())))
}

async fn health_handler(storage: Arc<crate::storage::StorageGateway>) -> impl IntoResponse {
    let db_health = match storage.health_check().await {
        Ok(()) => DatabaseHealth { status: "ok".into(), error: None },
        Err(e) => DatabaseHealth { status: "error".into(), error: Some(e.to_string()) },
    };

    let is_healthy = db_health.status == "ok";
    let status_code = if is_healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status_code,
        Json(HealthResponse {
            status: if is_healthy { "healthy" } else { "unhealthy" }.to_string(),
            connection_pool: ConnectionPoolHealth {
                size: storage.pool_size(),
                idle_connections: storage.pool_idle(),
            },
            database: db_health,
            event_bus: "ok".to_string(),
        }),
    )
}
