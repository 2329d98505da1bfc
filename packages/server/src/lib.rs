// ABOUTME: HTTP routes exposing the sandbox engine's tool calls, metrics, and health
// ABOUTME: Thin protocol glue; all behavior lives in shellbox-sandbox

pub mod error;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use error::ApiError;
use serde_json::json;
use shellbox_sandbox::{SandboxEngine, ToolRequest, ToolResponse};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

pub fn create_router(engine: Arc<SandboxEngine>) -> Router {
    Router::new()
        .route("/tools/call", post(call_tool))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn call_tool(
    State(engine): State<Arc<SandboxEngine>>,
    Json(request): Json<ToolRequest>,
) -> Result<Json<ToolResponse>, ApiError> {
    Ok(Json(engine.handle(request).await?))
}

async fn metrics(State(engine): State<Arc<SandboxEngine>>) -> impl IntoResponse {
    match engine.metrics().render() {
        Ok(text) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health(State(engine): State<Arc<SandboxEngine>>) -> impl IntoResponse {
    let container = engine.lifecycle().status();
    let status = if container.permanently_unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "ok" } else { "unhealthy" },
            "version": env!("CARGO_PKG_VERSION"),
            "container": container,
        })),
    )
}
