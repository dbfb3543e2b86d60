use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::db::{models::DeviceCapabilities, queries};
use crate::env::{EnvironmentReport, HostEnvironment};
use crate::probe::{compute_safe_ceiling, ProbeStatus, ProbeStatusCode};
use crate::units::{bytes_per_ms_to_gb_per_sec, format_byte_count};
use crate::worker::{ProbeCanceler, ProbeError, ProbeSession, ProbeWorker};
use crate::ws::WsEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedRun {
    pub run_id: Uuid,
    pub max_attempt_size: u64,
}

#[derive(Default)]
struct ControllerState {
    active: Option<ProbeCanceler>,
    /// Run whose snapshots are published; older relays are ignored.
    current: Option<Uuid>,
    latest: Option<ProbeStatus>,
    relay: Option<JoinHandle<()>>,
}

// ─── Controller ──────────────────────────────────────────────────────────────

/// Starts probe runs, fans their snapshots out to WebSocket clients and
/// records what a finished run learned.
pub struct ProbeController {
    worker: ProbeWorker,
    env: Arc<dyn HostEnvironment>,
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
    state: Arc<Mutex<ControllerState>>,
}

impl ProbeController {
    pub fn new(
        worker: ProbeWorker,
        env: Arc<dyn HostEnvironment>,
        pool: SqlitePool,
        event_tx: broadcast::Sender<WsEvent>,
    ) -> Self {
        ProbeController {
            worker,
            env,
            pool,
            event_tx,
            state: Arc::new(Mutex::new(ControllerState::default())),
        }
    }

    /// Largest allocation total a run may attempt on this host right now.
    pub async fn safe_ceiling(&self) -> u64 {
        let env = self.env.clone();
        match tokio::task::spawn_blocking(move || compute_safe_ceiling(env.as_ref())).await {
            Ok(ceiling) => ceiling,
            Err(e) => {
                tracing::error!("Safe ceiling computation failed: {}", e);
                0
            }
        }
    }

    pub async fn environment(&self) -> EnvironmentReport {
        let env = self.env.clone();
        match tokio::task::spawn_blocking(move || EnvironmentReport::collect(env.as_ref())).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Environment query failed: {}", e);
                EnvironmentReport {
                    gpu_support: false,
                    compute_support: false,
                    storage_support: false,
                    available_storage: None,
                    system_memory: None,
                }
            }
        }
    }

    /// Starts a run. An explicit size is clamped to the safe ceiling; without
    /// one the ceiling itself is used.
    pub async fn start(&self, requested: Option<u64>) -> Result<StartedRun, ProbeError> {
        let ceiling = self.safe_ceiling().await;
        if ceiling == 0 {
            tracing::warn!("Refusing to start probe: no storage or memory estimate");
            return Err(ProbeError::NoSafeCeiling);
        }

        let max_attempt_size = match requested.filter(|&size| size > 0) {
            Some(size) if size > ceiling => {
                tracing::info!("Requested {} bytes, clamped to safe ceiling {}", size, ceiling);
                ceiling
            }
            Some(size) => size,
            None => ceiling,
        };

        let mut state = self.state.lock().await;
        if state.active.is_some() {
            return Err(ProbeError::AlreadyRunning);
        }

        // The previous run's relay may still be publishing its terminal
        // snapshot; let it finish before a new run takes over.
        if let Some(previous) = state.relay.take() {
            drop(state);
            if let Err(e) = previous.await {
                tracing::error!("Probe relay task failed: {}", e);
            }
            state = self.state.lock().await;
            if state.active.is_some() {
                return Err(ProbeError::AlreadyRunning);
            }
        }

        let session = self.worker.start(max_attempt_size).await?;
        let started = StartedRun {
            run_id: session.id(),
            max_attempt_size: session.max_attempt_size(),
        };

        state.active = Some(session.canceler());
        state.current = Some(started.run_id);
        state.latest = None;
        state.relay = Some(tokio::spawn(relay(
            session,
            self.state.clone(),
            self.event_tx.clone(),
            self.pool.clone(),
        )));

        Ok(started)
    }

    /// Returns whether a run was active to cancel.
    pub async fn cancel(&self) -> bool {
        let state = self.state.lock().await;
        match &state.active {
            Some(canceler) => {
                canceler.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.active.is_some()
    }

    pub async fn latest_status(&self) -> Option<ProbeStatus> {
        self.state.lock().await.latest.clone()
    }

    pub async fn capabilities(&self) -> Option<DeviceCapabilities> {
        queries::load_capabilities(&self.pool).await
    }

    pub async fn clear_capabilities(&self) -> anyhow::Result<bool> {
        queries::clear_capabilities(&self.pool).await
    }

    /// Waits until the current run's relay has finished (snapshots broadcast,
    /// capabilities persisted) and returns the final snapshot.
    pub async fn wait_for_completion(&self) -> Option<ProbeStatus> {
        let relay = self.state.lock().await.relay.take();
        if let Some(handle) = relay {
            if let Err(e) = handle.await {
                tracing::error!("Probe relay task failed: {}", e);
            }
        }
        self.latest_status().await
    }
}

async fn relay(
    mut session: ProbeSession,
    state: Arc<Mutex<ControllerState>>,
    event_tx: broadcast::Sender<WsEvent>,
    pool: SqlitePool,
) {
    let run_id = session.id();

    while let Some(status) = session.next_status().await {
        let mut state = state.lock().await;
        if state.current != Some(run_id) {
            tracing::debug!("Dropping snapshot from superseded run {}", run_id);
            continue;
        }

        state.latest = Some(status.clone());
        // No subscribers is fine.
        let _ = event_tx.send(WsEvent::Status {
            status: status.clone(),
        });

        if status.is_terminal() {
            if state.active.as_ref().is_some_and(|c| c.run_id() == run_id) {
                state.active = None;
            }
            // Still under the lock, so no newer run can start before this is stored.
            persist_outcome(&pool, &status).await;
        }
    }

    tracing::debug!("Relay for probe run {} finished", run_id);
}

async fn persist_outcome(pool: &SqlitePool, status: &ProbeStatus) {
    if status.code == ProbeStatusCode::UserCanceled {
        tracing::info!("Probe canceled, capabilities left unchanged");
        return;
    }

    let caps = DeviceCapabilities::from_status(status);
    match queries::save_capabilities(pool, &caps).await {
        Ok(()) => tracing::info!(
            "Saved device capabilities: {}, {} GB/s ({})",
            format_byte_count(caps.max_gpu_allocation_size),
            bytes_per_ms_to_gb_per_sec(caps.memory_copy_rate, 2),
            caps.last_test_status_code
        ),
        Err(e) => tracing::error!("Failed to save device capabilities: {}", e),
    }
}
