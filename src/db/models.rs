use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::probe::{ProbeStatus, ProbeStatusCode};

// ─── Device capabilities ─────────────────────────────────────────────────────

/// What the last completed probe learned about this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    /// Average copy rate, bytes/ms.
    pub memory_copy_rate: f64,
    pub max_gpu_allocation_size: u64,
    pub last_test_status_code: ProbeStatusCode,
    /// Epoch milliseconds.
    pub last_test_timestamp: i64,
}

impl DeviceCapabilities {
    pub fn from_status(status: &ProbeStatus) -> Self {
        DeviceCapabilities {
            memory_copy_rate: status.average_copy_rate,
            max_gpu_allocation_size: status.total_allocated_size,
            last_test_status_code: status.code,
            last_test_timestamp: Utc::now().timestamp_millis(),
        }
    }
}

// ─── Setting ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Setting {
    pub key: String,
    pub value: String,
}
