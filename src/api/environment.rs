use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;

use crate::AppState;

/// GET /api/environment
pub async fn get_environment(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.environment().await)
}
