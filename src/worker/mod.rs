//! Runs the probe engine away from the async runtime and relays commands and
//! status snapshots to and from it over channels.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::gpu::GpuApi;
use crate::probe::{ProbeEngine, ProbeStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("a probe run is already active")]
    AlreadyRunning,
    #[error("no safe allocation ceiling could be determined")]
    NoSafeCeiling,
    #[error("probe worker has stopped")]
    WorkerStopped,
}

enum WorkerCommand {
    Start {
        run_id: Uuid,
        max_attempt_size: u64,
        updates: mpsc::UnboundedSender<ProbeStatus>,
        reply: oneshot::Sender<Result<(), ProbeError>>,
    },
    Cancel {
        run_id: Uuid,
    },
    Finished {
        run_id: Uuid,
    },
}

// ─── Worker ──────────────────────────────────────────────────────────────────

/// Handle to the dispatcher task that owns the engine. At most one run is
/// active at a time; the dispatcher is the only place that knows which.
#[derive(Clone)]
pub struct ProbeWorker {
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

impl ProbeWorker {
    /// Must be called inside a tokio runtime.
    pub fn spawn<G>(engine: Arc<ProbeEngine<G>>) -> Self
    where
        G: GpuApi + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(engine, rx, tx.downgrade()));
        ProbeWorker { commands: tx }
    }

    /// Starts a run. Fails with `AlreadyRunning` while another run has not
    /// yet delivered its terminal status.
    pub async fn start(&self, max_attempt_size: u64) -> Result<ProbeSession, ProbeError> {
        let run_id = Uuid::new_v4();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.commands
            .send(WorkerCommand::Start {
                run_id,
                max_attempt_size,
                updates: updates_tx,
                reply: reply_tx,
            })
            .map_err(|_| ProbeError::WorkerStopped)?;

        reply_rx.await.map_err(|_| ProbeError::WorkerStopped)??;

        Ok(ProbeSession {
            id: run_id,
            max_attempt_size,
            updates: updates_rx,
            canceler: ProbeCanceler {
                run_id,
                commands: self.commands.clone(),
            },
        })
    }
}

struct ActiveRun {
    id: Uuid,
    cancel: CancellationToken,
}

/// Sends `Finished` when dropped, so the dispatcher frees the slot even if
/// the blocking task dies.
struct FinishGuard {
    run_id: Uuid,
    commands: mpsc::WeakUnboundedSender<WorkerCommand>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(WorkerCommand::Finished {
                run_id: self.run_id,
            });
        }
    }
}

async fn dispatch<G>(
    engine: Arc<ProbeEngine<G>>,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    self_tx: mpsc::WeakUnboundedSender<WorkerCommand>,
) where
    G: GpuApi + 'static,
{
    let mut active: Option<ActiveRun> = None;

    while let Some(command) = commands.recv().await {
        match command {
            WorkerCommand::Start {
                run_id,
                max_attempt_size,
                updates,
                reply,
            } => {
                if let Some(run) = &active {
                    tracing::warn!("Rejecting probe start: run {} is still active", run.id);
                    let _ = reply.send(Err(ProbeError::AlreadyRunning));
                    continue;
                }

                tracing::info!("Starting probe run {} (max {} bytes)", run_id, max_attempt_size);
                let cancel = CancellationToken::new();
                let token = cancel.clone();
                let engine = engine.clone();
                let guard = FinishGuard {
                    run_id,
                    commands: self_tx.clone(),
                };

                tokio::task::spawn_blocking(move || {
                    let final_status = engine.run(
                        max_attempt_size,
                        &mut |status: ProbeStatus| {
                            if !status.is_terminal() {
                                let _ = updates.send(status);
                            }
                        },
                        &token,
                    );
                    // Free the slot before the caller can observe the end of the run.
                    drop(guard);
                    let _ = updates.send(final_status);
                });

                active = Some(ActiveRun { id: run_id, cancel });
                let _ = reply.send(Ok(()));
            }
            WorkerCommand::Cancel { run_id } => match &active {
                Some(run) if run.id == run_id => {
                    tracing::info!("Cancel requested for probe run {}", run_id);
                    run.cancel.cancel();
                }
                _ => tracing::debug!("Ignoring cancel for inactive run {}", run_id),
            },
            WorkerCommand::Finished { run_id } => {
                if active.as_ref().is_some_and(|run| run.id == run_id) {
                    active = None;
                }
            }
        }
    }

    tracing::debug!("Probe worker shutting down");
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// One run, as seen by whoever started it.
pub struct ProbeSession {
    id: Uuid,
    max_attempt_size: u64,
    updates: mpsc::UnboundedReceiver<ProbeStatus>,
    canceler: ProbeCanceler,
}

impl ProbeSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn max_attempt_size(&self) -> u64 {
        self.max_attempt_size
    }

    /// Next snapshot in report order; `None` once the terminal one was delivered.
    pub async fn next_status(&mut self) -> Option<ProbeStatus> {
        self.updates.recv().await
    }

    /// Asks the run to stop at its next chunk boundary.
    pub fn cancel(&self) {
        self.canceler.cancel();
    }

    pub fn canceler(&self) -> ProbeCanceler {
        self.canceler.clone()
    }

    /// Drains the session and returns the terminal snapshot.
    pub async fn finish(mut self) -> Option<ProbeStatus> {
        let mut last = None;
        while let Some(status) = self.next_status().await {
            last = Some(status);
        }
        last
    }
}

/// Cancels one specific run; stale cancelers do nothing to later runs.
#[derive(Clone)]
pub struct ProbeCanceler {
    run_id: Uuid,
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

impl ProbeCanceler {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn cancel(&self) {
        let _ = self.commands.send(WorkerCommand::Cancel {
            run_id: self.run_id,
        });
    }
}
