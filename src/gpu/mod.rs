//! The slice of a GPU API the allocation probe needs.
//!
//! The probe engine is generic over these traits. `wgpu_backend` drives real
//! hardware; tests plug in a scripted device.

use std::time::Duration;

pub mod wgpu_backend;

pub use wgpu_backend::WgpuApi;

/// What a buffer is used for. Backends derive usage flags from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    /// Copy destination that can be mapped for reading.
    ReadBack,
    /// Storage + copy source/destination, mapped at creation for filling.
    Test,
}

#[derive(Debug, Clone)]
pub struct BufferSpec {
    pub label: String,
    pub size: u64,
    pub role: BufferRole,
}

impl BufferSpec {
    pub fn read_back(size: u64) -> Self {
        BufferSpec {
            label: "readback".to_string(),
            size,
            role: BufferRole::ReadBack,
        }
    }

    pub fn test(size: u64, buffer_no: usize) -> Self {
        BufferSpec {
            label: format!("test #{}", buffer_no),
            size,
            role: BufferRole::Test,
        }
    }

    pub fn mapped_at_creation(&self) -> bool {
        self.role == BufferRole::Test
    }
}

/// Messages captured by the validation, internal and out-of-memory error
/// scopes around one batch of GPU work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeErrors {
    pub validation: Option<String>,
    pub internal: Option<String>,
    pub out_of_memory: Option<String>,
}

pub trait GpuApi: Send + Sync {
    type Adapter: GpuAdapter;

    /// `None` when no adapter can be obtained.
    fn request_adapter(&self) -> Option<Self::Adapter>;
}

pub trait GpuAdapter {
    type Device: GpuDevice;

    fn max_buffer_size(&self) -> u64;

    /// Opens a device whose max buffer size limit is `max_buffer_size`.
    fn request_device(&self, max_buffer_size: u64) -> Result<Self::Device, String>;
}

pub trait GpuDevice {
    type Buffer: GpuBuffer;

    /// Creates a buffer. An `Err` carries the device's reason for refusing it.
    fn create_buffer(&self, spec: &BufferSpec) -> Result<Self::Buffer, String>;

    /// Starts capturing errors for the next batch of work.
    fn push_error_scopes(&self);

    /// Stops capturing and returns whatever the scopes caught.
    fn pop_error_scopes(&self) -> ScopeErrors;

    /// Submits a copy of `size` bytes from `src` to `dst` and blocks until the
    /// device reports the work as done. Returns the submit-to-completion time;
    /// an `Err` means the completion wait itself failed.
    fn copy_and_wait(
        &self,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        size: u64,
    ) -> Result<Duration, String>;
}

pub trait GpuBuffer {
    fn label(&self) -> &str;
    fn is_mapped(&self) -> bool;
    /// Hands the mapped range to `fill`. The buffer must be mapped for writing.
    fn write_mapped(&mut self, fill: &mut dyn FnMut(&mut [u8]));
    /// Maps the whole buffer for reading, blocking until it is available.
    fn map_read(&mut self) -> Result<(), String>;
    /// Hands the mapped range to `inspect`. The buffer must be mapped.
    fn read_mapped(&self, inspect: &mut dyn FnMut(&[u8]));
    fn unmap(&mut self);
    fn destroy(&mut self);
}
