use serde::{Deserialize, Serialize};

/// Where a probe run stands. Everything except `Initializing` and
/// `TestInProgress` is terminal: no further updates follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeStatusCode {
    Initializing,
    TestInProgress,
    MaxAttemptSizeReached,
    GpuNotSupported,
    AdapterNotAvailable,
    DeviceNotAvailable,
    AllocationFailed,
    CopyFailed,
    CopyTooSlow,
    ValidationError,
    InternalError,
    OomError,
    LowStorageAvailability,
    GpuDriverFailure,
    UserCanceled,
    UnexpectedError,
}

impl ProbeStatusCode {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ProbeStatusCode::Initializing | ProbeStatusCode::TestInProgress
        )
    }

    /// The run ended on a failure rather than success, a policy stop or the user.
    pub fn is_failure(&self) -> bool {
        self.is_terminal()
            && !matches!(
                self,
                ProbeStatusCode::MaxAttemptSizeReached
                    | ProbeStatusCode::CopyTooSlow
                    | ProbeStatusCode::LowStorageAvailability
                    | ProbeStatusCode::UserCanceled
            )
    }

    pub fn description(&self) -> &'static str {
        match self {
            ProbeStatusCode::Initializing => "Initializing",
            ProbeStatusCode::TestInProgress => "Memory test in progress",
            ProbeStatusCode::MaxAttemptSizeReached => "Reached maximum attempt size",
            ProbeStatusCode::GpuNotSupported => "GPU not supported on this host",
            ProbeStatusCode::AdapterNotAvailable => "Adapter not available",
            ProbeStatusCode::DeviceNotAvailable => "Device not available",
            ProbeStatusCode::AllocationFailed => "Allocation failed",
            ProbeStatusCode::CopyFailed => "Copy failed",
            ProbeStatusCode::CopyTooSlow => "Copy too slow",
            ProbeStatusCode::ValidationError => "Validation error",
            ProbeStatusCode::InternalError => "Internal error",
            ProbeStatusCode::OomError => "Out-of-memory error",
            ProbeStatusCode::LowStorageAvailability => "Low storage availability",
            ProbeStatusCode::GpuDriverFailure => "GPU driver failure",
            ProbeStatusCode::UserCanceled => "Allocation canceled by user",
            ProbeStatusCode::UnexpectedError => "Unexpected error",
        }
    }
}

impl std::fmt::Display for ProbeStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Progress of one probe run. Consumers always receive clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeStatus {
    pub total_allocated_size: u64,
    pub max_attempt_size: u64,
    /// Copy rates in bytes/ms, -1 until the first sample.
    pub slowest_copy_rate: f64,
    pub fastest_copy_rate: f64,
    pub average_copy_rate: f64,
    pub available_storage: u64,
    pub code: ProbeStatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<String>,
}

impl ProbeStatus {
    pub fn new(max_attempt_size: u64, available_storage: u64) -> Self {
        ProbeStatus {
            total_allocated_size: 0,
            max_attempt_size,
            slowest_copy_rate: -1.0,
            fastest_copy_rate: -1.0,
            average_copy_rate: -1.0,
            available_storage,
            code: ProbeStatusCode::Initializing,
            error_info: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.code.is_terminal()
    }

    /// Moves to a terminal code with a diagnostic.
    pub fn fail(&mut self, code: ProbeStatusCode, info: impl Into<String>) {
        self.code = code;
        self.error_info = Some(info.into());
    }
}

/// Running copy-throughput statistics for one run.
#[derive(Debug, Default)]
pub struct CopyRateStats {
    rates: Vec<f64>,
}

impl CopyRateStats {
    /// Records a rate (rounded to whole bytes/ms) and refreshes the
    /// slowest/fastest/average fields of `status`.
    pub fn record(&mut self, rate: f64, status: &mut ProbeStatus) {
        let rate = rate.round();
        self.rates.push(rate);

        if self.rates.len() == 1 {
            status.slowest_copy_rate = rate;
            status.fastest_copy_rate = rate;
        } else {
            status.slowest_copy_rate = status.slowest_copy_rate.min(rate);
            status.fastest_copy_rate = status.fastest_copy_rate.max(rate);
        }

        let mean = self.rates.iter().sum::<f64>() / self.rates.len() as f64;
        status.average_copy_rate = (mean * 100.0).round() / 100.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_progress_codes_are_non_terminal() {
        assert!(!ProbeStatusCode::Initializing.is_terminal());
        assert!(!ProbeStatusCode::TestInProgress.is_terminal());
        assert!(ProbeStatusCode::MaxAttemptSizeReached.is_terminal());
        assert!(ProbeStatusCode::UserCanceled.is_terminal());
        assert!(ProbeStatusCode::UnexpectedError.is_terminal());
    }

    #[test]
    fn test_failure_classification() {
        assert!(ProbeStatusCode::OomError.is_failure());
        assert!(ProbeStatusCode::GpuNotSupported.is_failure());
        assert!(!ProbeStatusCode::CopyTooSlow.is_failure());
        assert!(!ProbeStatusCode::UserCanceled.is_failure());
        assert!(!ProbeStatusCode::TestInProgress.is_failure());
    }

    #[test]
    fn test_new_status_has_unset_rates() {
        let status = ProbeStatus::new(1000, 50);
        assert_eq!(status.slowest_copy_rate, -1.0);
        assert_eq!(status.fastest_copy_rate, -1.0);
        assert_eq!(status.average_copy_rate, -1.0);
        assert_eq!(status.code, ProbeStatusCode::Initializing);
    }

    #[test]
    fn test_copy_rate_stats() {
        let mut status = ProbeStatus::new(0, 0);
        let mut stats = CopyRateStats::default();

        stats.record(100.4, &mut status);
        assert_eq!(status.slowest_copy_rate, 100.0);
        assert_eq!(status.fastest_copy_rate, 100.0);
        assert_eq!(status.average_copy_rate, 100.0);

        stats.record(50.0, &mut status);
        stats.record(201.0, &mut status);
        assert_eq!(stats.rates.len(), 3);
        assert_eq!(status.slowest_copy_rate, 50.0);
        assert_eq!(status.fastest_copy_rate, 201.0);
        // (100 + 50 + 201) / 3 = 117.0
        assert_eq!(status.average_copy_rate, 117.0);

        stats.record(1.0, &mut status);
        // 352 / 4 = 88.0
        assert_eq!(status.average_copy_rate, 88.0);
        stats.record(2.0, &mut status);
        // 354 / 5 = 70.8
        assert_eq!(status.average_copy_rate, 70.8);
        stats.record(3.0, &mut status);
        // 357 / 6 = 59.5
        assert_eq!(status.average_copy_rate, 59.5);
    }

    #[test]
    fn test_status_wire_shape() {
        let mut status = ProbeStatus::new(2048, 4096);
        status.code = ProbeStatusCode::TestInProgress;
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["totalAllocatedSize"], 0);
        assert_eq!(json["maxAttemptSize"], 2048);
        assert_eq!(json["code"], "TEST_IN_PROGRESS");
        assert!(json.get("errorInfo").is_none());

        status.fail(ProbeStatusCode::CopyFailed, "mismatch");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["code"], "COPY_FAILED");
        assert_eq!(json["errorInfo"], "mismatch");
    }
}
