use serde::{Deserialize, Serialize};

use crate::probe::ProbeStatus;

/// Events pushed to connected WebSocket clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    /// Full snapshot of the active probe run
    Status { status: ProbeStatus },
    /// A client request could not be honoured
    Error { message: String },
}

/// Commands accepted from WebSocket clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ProbeCommand {
    Start {
        #[serde(rename = "maxAttemptSize")]
        max_attempt_size: u64,
    },
    Cancel,
}
