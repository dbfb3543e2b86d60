use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;

use crate::AppState;

/// GET /api/capabilities
pub async fn get_capabilities(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.controller.capabilities().await {
        Some(caps) => Json(serde_json::json!(caps)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Device capabilities not measured yet" })),
        )
            .into_response(),
    }
}

/// DELETE /api/capabilities
pub async fn delete_capabilities(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.controller.clear_capabilities().await {
        Ok(removed) => Json(serde_json::json!({ "ok": true, "removed": removed })).into_response(),
        Err(e) => {
            tracing::error!("Failed to clear device capabilities: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Failed to clear capabilities" })),
            )
                .into_response()
        }
    }
}
