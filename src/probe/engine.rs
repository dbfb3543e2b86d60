use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::buffers::BufferSet;
use super::status::{CopyRateStats, ProbeStatus, ProbeStatusCode};
use crate::env::HostEnvironment;
use crate::gpu::{BufferSpec, GpuAdapter, GpuApi, GpuBuffer, GpuDevice, ScopeErrors};
use crate::units::{
    byte_count_to_mb, fill_with_pattern, format_byte_count, randomish_memory_value, GIGABYTE,
    MEGABYTE,
};

/// Floor for a measured copy time, keeps the bytes/ms rate finite.
const MIN_COPY_MS: f64 = 0.001;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Upper bound on the chunk size. Smaller than a device's max buffer size
    /// so the result has useful granularity.
    pub chunk_cap: u64,
    /// A chunk copy slower than this means the memory is not real device memory.
    pub max_copy_time: Duration,
    /// Stop once free disk space drops below this.
    pub storage_margin: u64,
    /// Offsets spot-checked per chunk after the copy.
    pub verify_samples: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            chunk_cap: 128 * MEGABYTE,
            max_copy_time: Duration::from_millis(5000),
            storage_margin: 5 * GIGABYTE,
            verify_samples: 16,
        }
    }
}

/// Finds how much GPU memory can really be used by allocating, filling,
/// copying and verifying one chunk at a time until something gives.
pub struct ProbeEngine<G: GpuApi> {
    gpu: G,
    env: Arc<dyn HostEnvironment>,
    config: EngineConfig,
}

impl<G: GpuApi> ProbeEngine<G> {
    pub fn new(gpu: G, env: Arc<dyn HostEnvironment>, config: EngineConfig) -> Self {
        ProbeEngine { gpu, env, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs one probe. Blocks for the whole run.
    ///
    /// `on_status` gets a snapshot on every state change and after every
    /// verified chunk; the last snapshot carries a terminal code and equals the
    /// return value. `cancel` is checked between chunks only. Failures never
    /// escape: they end up in `code` and `error_info`.
    pub fn run(
        &self,
        max_attempt_size: u64,
        on_status: &mut dyn FnMut(ProbeStatus),
        cancel: &CancellationToken,
    ) -> ProbeStatus {
        let mut status = ProbeStatus::new(
            max_attempt_size,
            self.env.available_storage().unwrap_or(0),
        );
        on_status(status.clone());

        let mut chunk_size = 0;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.probe(&mut status, &mut chunk_size, on_status, cancel)
        }));

        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            tracing::error!("Unexpected error during GPU allocation probe: {}", message);
            // The fault may have hit the last counted chunk too.
            status.total_allocated_size = status.total_allocated_size.saturating_sub(chunk_size);
            status.fail(ProbeStatusCode::UnexpectedError, message);
        }

        if !status.is_terminal() {
            status.code = ProbeStatusCode::MaxAttemptSizeReached;
        }

        if status.code.is_failure() {
            tracing::warn!(
                "Probe failed: {} after {} ({})",
                status.code,
                format_byte_count(status.total_allocated_size),
                status.error_info.as_deref().unwrap_or("no detail")
            );
        } else {
            tracing::info!(
                "Probe finished: {} after {}",
                status.code,
                format_byte_count(status.total_allocated_size)
            );
        }

        on_status(status.clone());
        status
    }

    fn probe(
        &self,
        status: &mut ProbeStatus,
        chunk_size: &mut u64,
        on_status: &mut dyn FnMut(ProbeStatus),
        cancel: &CancellationToken,
    ) {
        if !self.env.has_gpu_support() {
            status.fail(
                ProbeStatusCode::GpuNotSupported,
                "No GPU API backend is available on this host.",
            );
            return;
        }

        let adapter = match self.gpu.request_adapter() {
            Some(adapter) => adapter,
            None => {
                status.fail(
                    ProbeStatusCode::AdapterNotAvailable,
                    "No suitable GPU adapter was found.",
                );
                return;
            }
        };

        let chunk = adapter.max_buffer_size().min(self.config.chunk_cap);
        if chunk == 0 {
            status.fail(
                ProbeStatusCode::DeviceNotAvailable,
                "Adapter reports a zero maximum buffer size.",
            );
            return;
        }
        *chunk_size = chunk;

        let device = match adapter.request_device(chunk) {
            Ok(device) => device,
            Err(e) => {
                status.fail(ProbeStatusCode::DeviceNotAvailable, e);
                return;
            }
        };

        if status.max_attempt_size < chunk {
            tracing::info!(
                "Max attempt size {} is below one chunk ({}), nothing to probe",
                status.max_attempt_size,
                chunk
            );
            status.code = ProbeStatusCode::MaxAttemptSizeReached;
            return;
        }

        let read_back = match device.create_buffer(&BufferSpec::read_back(chunk)) {
            Ok(buffer) => buffer,
            Err(e) => {
                status.fail(ProbeStatusCode::AllocationFailed, e);
                return;
            }
        };
        let mut buffers = BufferSet::new(read_back);

        status.code = ProbeStatusCode::TestInProgress;
        on_status(status.clone());

        let mut rates = CopyRateStats::default();
        let mut buffer_no = 0;

        while status.total_allocated_size + chunk <= status.max_attempt_size {
            if cancel.is_cancelled() {
                status.code = ProbeStatusCode::UserCanceled;
                return;
            }

            // Allocations spilling into swap show up as shrinking free disk space.
            if let Some(storage) = self.env.available_storage() {
                status.available_storage = storage;
                if storage < self.config.storage_margin {
                    status.fail(
                        ProbeStatusCode::LowStorageAvailability,
                        format!(
                            "Available storage is low ({}), stopping at {} bytes.",
                            format_byte_count(storage),
                            status.total_allocated_size
                        ),
                    );
                    return;
                }
            }

            buffer_no += 1;
            let test = match device.create_buffer(&BufferSpec::test(chunk, buffer_no)) {
                Ok(buffer) => buffers.push_test(buffer),
                Err(e) => {
                    status.fail(ProbeStatusCode::AllocationFailed, e);
                    return;
                }
            };

            // Touch every byte so lazily-committed pages must really exist.
            test.write_mapped(&mut |bytes| fill_with_pattern(bytes, 0));
            test.unmap();

            device.push_error_scopes();
            let copied = device.copy_and_wait(buffers.latest(), buffers.read_back(), chunk);
            let scopes = device.pop_error_scopes();

            let copy_time = match copied {
                Ok(elapsed) => elapsed,
                Err(e) => {
                    status.fail(
                        ProbeStatusCode::GpuDriverFailure,
                        format!("GPU driver failure during copy: {}", e),
                    );
                    return;
                }
            };

            if let Some((code, message)) = scope_failure(scopes) {
                status.fail(code, message);
                return;
            }

            let copy_ms = (copy_time.as_secs_f64() * 1000.0).max(MIN_COPY_MS);
            rates.record(chunk as f64 / copy_ms, status);
            tracing::debug!(
                "Copy of buffer #{} took {:.3} ms for {} MB",
                buffer_no,
                copy_ms,
                byte_count_to_mb(chunk, 1)
            );

            if copy_time > self.config.max_copy_time {
                status.fail(
                    ProbeStatusCode::CopyTooSlow,
                    format!("Copy took too long ({:.0} ms for {} bytes).", copy_ms, chunk),
                );
                return;
            }

            if let Err(e) = buffers.read_back_mut().map_read() {
                tracing::error!("Read-back mapping failed: {}", e);
                status.total_allocated_size = status.total_allocated_size.saturating_sub(chunk);
                status.fail(ProbeStatusCode::UnexpectedError, e);
                return;
            }
            let mismatch = first_mismatch(buffers.read_back(), chunk, self.config.verify_samples);
            buffers.read_back_mut().unmap();

            if let Some(offset) = mismatch {
                status.fail(
                    ProbeStatusCode::CopyFailed,
                    format!(
                        "Readback verification failed for buffer #{} at offset {}.",
                        buffer_no, offset
                    ),
                );
                return;
            }

            // A cancel that arrived during this chunk discards it.
            if cancel.is_cancelled() {
                status.code = ProbeStatusCode::UserCanceled;
                return;
            }

            status.total_allocated_size += chunk;
            on_status(status.clone());
        }
    }
}

/// Checked in order validation, internal, out-of-memory; the first one set wins.
fn scope_failure(scopes: ScopeErrors) -> Option<(ProbeStatusCode, String)> {
    if let Some(message) = scopes.validation {
        return Some((ProbeStatusCode::ValidationError, message));
    }
    if let Some(message) = scopes.internal {
        return Some((ProbeStatusCode::InternalError, message));
    }
    scopes
        .out_of_memory
        .map(|message| (ProbeStatusCode::OomError, message))
}

/// First spot-checked offset whose byte does not match the fill pattern.
fn first_mismatch<B: GpuBuffer>(buffer: &B, size: u64, samples: u64) -> Option<u64> {
    let stride = (size / samples.max(1)).max(1);
    let mut mismatch = None;
    buffer.read_mapped(&mut |bytes| {
        mismatch = (0..size).step_by(stride as usize).find(|&offset| {
            bytes.get(offset as usize).copied() != Some(randomish_memory_value(offset))
        });
    });
    mismatch
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
