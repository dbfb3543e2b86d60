use super::{BufferRole, BufferSpec, GpuAdapter, GpuApi, GpuBuffer, GpuDevice, ScopeErrors};
use futures::channel::oneshot;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Native GPU access through wgpu. Futures are driven with `pollster`, the
/// probe runs on a blocking thread anyway.
pub struct WgpuApi {
    instance: wgpu::Instance,
}

impl WgpuApi {
    pub fn new() -> Self {
        WgpuApi {
            instance: wgpu::Instance::default(),
        }
    }
}

impl Default for WgpuApi {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuApi for WgpuApi {
    type Adapter = WgpuAdapter;

    fn request_adapter(&self) -> Option<WgpuAdapter> {
        let adapter = pollster::block_on(self.instance.request_adapter(
            &wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            },
        ))?;

        let info = adapter.get_info();
        tracing::info!("Using GPU adapter: {} ({:?})", info.name, info.backend);
        Some(WgpuAdapter { adapter })
    }
}

pub struct WgpuAdapter {
    adapter: wgpu::Adapter,
}

impl GpuAdapter for WgpuAdapter {
    type Device = WgpuDevice;

    fn max_buffer_size(&self) -> u64 {
        self.adapter.limits().max_buffer_size
    }

    fn request_device(&self, max_buffer_size: u64) -> Result<WgpuDevice, String> {
        let (device, queue) = pollster::block_on(self.adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("GPU Capacity Probe Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits {
                    max_buffer_size,
                    ..self.adapter.limits()
                },
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| format!("Failed to create device: {}", e))?;

        // Errors outside a scope would otherwise panic inside wgpu.
        device.on_uncaptured_error(Box::new(|e| {
            tracing::error!("Uncaptured GPU error: {}", e);
        }));

        Ok(WgpuDevice {
            device: Arc::new(device),
            queue,
        })
    }
}

pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: wgpu::Queue,
}

impl WgpuDevice {
    fn pop_one(&self) -> Option<String> {
        pollster::block_on(self.device.pop_error_scope()).map(|e| e.to_string())
    }
}

impl GpuDevice for WgpuDevice {
    type Buffer = WgpuBuffer;

    fn create_buffer(&self, spec: &BufferSpec) -> Result<WgpuBuffer, String> {
        let usage = match spec.role {
            BufferRole::ReadBack => wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            BufferRole::Test => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST
            }
        };

        // wgpu reports creation failures through error scopes, not return values.
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&spec.label),
            size: spec.size,
            usage,
            mapped_at_creation: spec.mapped_at_creation(),
        });
        let validation = self.pop_one();
        let out_of_memory = self.pop_one();

        if let Some(reason) = validation.or(out_of_memory) {
            buffer.destroy();
            return Err(format!(
                "Failed to allocate buffer \"{}\" of size {}: {}",
                spec.label, spec.size, reason
            ));
        }

        Ok(WgpuBuffer {
            label: spec.label.clone(),
            mapped: spec.mapped_at_creation(),
            buffer,
            device: self.device.clone(),
        })
    }

    fn push_error_scopes(&self) {
        // Popped in reverse: validation, internal, out-of-memory.
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Internal);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
    }

    fn pop_error_scopes(&self) -> ScopeErrors {
        let validation = self.pop_one();
        let internal = self.pop_one();
        let out_of_memory = self.pop_one();
        ScopeErrors {
            validation,
            internal,
            out_of_memory,
        }
    }

    fn copy_and_wait(
        &self,
        src: &WgpuBuffer,
        dst: &WgpuBuffer,
        size: u64,
    ) -> Result<Duration, String> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Probe Copy Encoder"),
            });
        encoder.copy_buffer_to_buffer(&src.buffer, 0, &dst.buffer, 0, size);

        let started = Instant::now();
        self.queue.submit(Some(encoder.finish()));

        let (sender, mut receiver) = oneshot::channel();
        self.queue.on_submitted_work_done(move || {
            sender.send(()).ok();
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        let elapsed = started.elapsed();

        match receiver.try_recv() {
            Ok(Some(())) => Ok(elapsed),
            Ok(None) => Err("submitted work did not complete after waiting on the device".into()),
            Err(_) => Err("device dropped the work-done callback (device lost?)".into()),
        }
    }
}

pub struct WgpuBuffer {
    label: String,
    mapped: bool,
    buffer: wgpu::Buffer,
    device: Arc<wgpu::Device>,
}

impl GpuBuffer for WgpuBuffer {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_mapped(&self) -> bool {
        self.mapped
    }

    fn write_mapped(&mut self, fill: &mut dyn FnMut(&mut [u8])) {
        let mut view = self.buffer.slice(..).get_mapped_range_mut();
        fill(&mut view);
    }

    fn map_read(&mut self) -> Result<(), String> {
        let slice = self.buffer.slice(..);
        let (sender, receiver) = oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            sender.send(result).ok();
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);

        pollster::block_on(receiver)
            .map_err(|_| "Failed to receive mapping result".to_string())?
            .map_err(|e| format!("Buffer mapping failed: {:?}", e))?;

        self.mapped = true;
        Ok(())
    }

    fn read_mapped(&self, inspect: &mut dyn FnMut(&[u8])) {
        let view = self.buffer.slice(..).get_mapped_range();
        inspect(&view);
    }

    fn unmap(&mut self) {
        self.buffer.unmap();
        self.mapped = false;
    }

    fn destroy(&mut self) {
        self.buffer.destroy();
    }
}
