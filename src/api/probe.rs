use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use std::sync::Arc;

use crate::{
    units::{byte_count_to_gb, format_byte_count},
    worker::ProbeError,
    AppState,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProbeRequest {
    pub max_attempt_size: Option<u64>,
}

/// GET /api/probe/ceiling
pub async fn get_ceiling(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ceiling = state.controller.safe_ceiling().await;
    Json(serde_json::json!({
        "maxAttemptSize": ceiling,
        "gigabytes": byte_count_to_gb(ceiling, 2),
        "formatted": format_byte_count(ceiling),
    }))
}

/// POST /api/probe/start
pub async fn start_probe(
    State(state): State<Arc<AppState>>,
    body: Option<Json<StartProbeRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(req)| req).unwrap_or_default();

    match state.controller.start(req.max_attempt_size).await {
        Ok(started) => (StatusCode::ACCEPTED, Json(serde_json::json!(started))).into_response(),
        Err(e) => probe_error_response(e).into_response(),
    }
}

/// POST /api/probe/cancel
pub async fn cancel_probe(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let was_running = state.controller.cancel().await;
    Json(serde_json::json!({ "ok": was_running }))
}

/// GET /api/probe/status
pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.controller.latest_status().await {
        Some(status) => Json(serde_json::json!(status)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "No probe has run yet" })),
        )
            .into_response(),
    }
}

pub fn probe_error_response(e: ProbeError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        ProbeError::AlreadyRunning => StatusCode::CONFLICT,
        ProbeError::NoSafeCeiling => StatusCode::UNPROCESSABLE_ENTITY,
        ProbeError::WorkerStopped => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}
