mod api;
mod config;
mod controller;
mod db;
mod env;
mod gpu;
mod probe;
mod units;
mod worker;
mod ws;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::controller::ProbeController;
use crate::gpu::WgpuApi;
use crate::probe::ProbeEngine;
use crate::worker::ProbeWorker;
use crate::ws::WsEvent;

// ─── App State ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub event_tx: broadcast::Sender<WsEvent>,
    pub controller: Arc<ProbeController>,
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gpu_capacity_probe=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("=== GPU capacity probe starting ===");

    let config = AppConfig::from_env();
    tracing::debug!("Configuration: {:?}", config);

    // Database
    let pool = db::init_pool(&config.database_url).await?;
    tracing::info!("Database ready");

    // Host environment (adapter enumeration and disk stats block)
    let env = {
        let data_dir = config.data_dir.clone();
        let overrides = config.overrides.clone();
        tokio::task::spawn_blocking(move || env::detect_environment(&data_dir, overrides)).await?
    };

    match db::queries::load_capabilities(&pool).await {
        Some(caps) => tracing::info!(
            "Last probe: {} ({}, {})",
            units::format_byte_count(caps.max_gpu_allocation_size),
            caps.last_test_status_code,
            caps.last_test_timestamp
        ),
        None => tracing::info!("No device capabilities recorded yet"),
    }

    // WebSocket broadcast channel
    let (event_tx, _) = broadcast::channel::<WsEvent>(256);

    // Probe engine behind its worker
    let engine = Arc::new(ProbeEngine::new(WgpuApi::new(), env.clone(), config.engine.clone()));
    tracing::info!(
        "Probe chunk cap {}, copy timeout {:?}, storage margin {}",
        units::format_byte_count(engine.config().chunk_cap),
        engine.config().max_copy_time,
        units::format_byte_count(engine.config().storage_margin)
    );
    let worker = ProbeWorker::spawn(engine);
    let controller = Arc::new(ProbeController::new(
        worker,
        env,
        pool,
        event_tx.clone(),
    ));

    // App state
    let state = Arc::new(AppState {
        event_tx,
        controller,
    });

    // Build router
    let app = build_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // WebSocket
        .route("/ws", get(api::ws_handler::ws_handler))
        // Environment
        .route("/api/environment", get(api::environment::get_environment))
        // Probe runs
        .route("/api/probe/ceiling", get(api::probe::get_ceiling))
        .route("/api/probe/start", post(api::probe::start_probe))
        .route("/api/probe/cancel", post(api::probe::cancel_probe))
        .route("/api/probe/status", get(api::probe::get_status))
        // Stored capability record
        .route(
            "/api/capabilities",
            get(api::capabilities::get_capabilities).delete(api::capabilities::delete_capabilities),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{FixedEnvironment, HostEnvironment};
    use crate::probe::fake::{FakeGpu, FakeScript};
    use crate::probe::EngineConfig;
    use crate::units::{GIGABYTE, KILOBYTE};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use std::time::Duration;
    use tower::ServiceExt;

    pub(crate) async fn test_state(script: FakeScript, env: FixedEnvironment) -> Arc<AppState> {
        let env: Arc<dyn HostEnvironment> = Arc::new(env);
        let config = EngineConfig {
            chunk_cap: KILOBYTE,
            storage_margin: KILOBYTE,
            ..EngineConfig::default()
        };
        let engine = Arc::new(ProbeEngine::new(FakeGpu::new(script), env.clone(), config));
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let (event_tx, _) = broadcast::channel(256);
        let controller = Arc::new(ProbeController::new(
            ProbeWorker::spawn(engine),
            env,
            pool,
            event_tx.clone(),
        ));
        Arc::new(AppState {
            event_tx,
            controller,
        })
    }

    async fn default_state() -> Arc<AppState> {
        test_state(
            FakeScript::default(),
            FixedEnvironment::new(Some(8 * KILOBYTE), Some(16 * GIGABYTE)),
        )
        .await
    }

    async fn call(
        state: &Arc<AppState>,
        method: &str,
        uri: &str,
        body: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let res = build_router(state.clone())
            .oneshot(req.body(body).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_ceiling_and_environment() {
        let state = default_state().await;

        let (status, json) = call(&state, "GET", "/api/probe/ceiling", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["maxAttemptSize"], 8 * KILOBYTE);
        assert_eq!(json["formatted"], "8.0 KB");

        let (status, json) = call(&state, "GET", "/api/environment", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["storageSupport"], true);
        assert_eq!(json["availableStorage"], 8 * KILOBYTE);
        assert_eq!(json["systemMemory"], 16 * GIGABYTE);
    }

    #[tokio::test]
    async fn test_nothing_recorded_yet() {
        let state = default_state().await;

        let (status, _) = call(&state, "GET", "/api/probe/status", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&state, "GET", "/api/capabilities", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = call(&state, "POST", "/api/probe/cancel", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], false);
    }

    #[tokio::test]
    async fn test_start_run_to_completion() {
        let state = default_state().await;

        let (status, json) = call(
            &state,
            "POST",
            "/api/probe/start",
            Some(r#"{"maxAttemptSize":3072}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["maxAttemptSize"], 3072);
        assert!(json["runId"].is_string());

        state.controller.wait_for_completion().await.unwrap();

        let (status, json) = call(&state, "GET", "/api/probe/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["code"], "MAX_ATTEMPT_SIZE_REACHED");
        assert_eq!(json["totalAllocatedSize"], 3072);

        let (status, json) = call(&state, "GET", "/api/capabilities", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["maxGpuAllocationSize"], 3072);
        assert_eq!(json["lastTestStatusCode"], "MAX_ATTEMPT_SIZE_REACHED");

        let (status, json) = call(&state, "DELETE", "/api/capabilities", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["removed"], true);

        let (status, _) = call(&state, "GET", "/api/capabilities", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_without_body_uses_ceiling() {
        let state = default_state().await;
        let (status, json) = call(&state, "POST", "/api/probe/start", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["maxAttemptSize"], 8 * KILOBYTE);
        state.controller.wait_for_completion().await;
    }

    #[tokio::test]
    async fn test_overlapping_start_conflicts() {
        let script = FakeScript {
            pace: Duration::from_millis(5),
            ..Default::default()
        };
        let state = test_state(script, FixedEnvironment::new(Some(100 * GIGABYTE), None)).await;

        let body = Some(r#"{"maxAttemptSize":204800}"#);
        let (status, _) = call(&state, "POST", "/api/probe/start", body).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, json) = call(&state, "POST", "/api/probe/start", body).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].is_string());

        let (_, json) = call(&state, "POST", "/api/probe/cancel", None).await;
        assert_eq!(json["ok"], true);
        let last = state.controller.wait_for_completion().await.unwrap();
        assert_eq!(last.code, crate::probe::ProbeStatusCode::UserCanceled);
    }

    #[tokio::test]
    async fn test_start_without_ceiling_is_unprocessable() {
        let state = test_state(FakeScript::default(), FixedEnvironment::new(None, None)).await;
        let (status, _) = call(&state, "POST", "/api/probe/start", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
