use super::HostEnvironment;
use std::path::{Path, PathBuf};
use sysinfo::{Disks, System};

/// The real host: wgpu for GPU presence, sysinfo for disks and RAM.
pub struct SystemEnvironment {
    data_dir: PathBuf,
    gpu_support: bool,
    compute_support: bool,
}

impl SystemEnvironment {
    /// Adapter enumeration happens once here; GPU presence does not change
    /// while the process runs.
    pub fn new(data_dir: &Path) -> Self {
        let data_dir = data_dir
            .canonicalize()
            .unwrap_or_else(|_| data_dir.to_path_buf());

        let instance = wgpu::Instance::default();
        let adapters = instance.enumerate_adapters(wgpu::Backends::all());
        let gpu_support = !adapters.is_empty();

        // Judge compute on the adapter a run will request.
        let compute_support = pollster::block_on(instance.request_adapter(
            &wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            },
        ))
        .map(|adapter| {
            adapter
                .get_downlevel_capabilities()
                .flags
                .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        })
        .unwrap_or(false);

        for adapter in &adapters {
            let info = adapter.get_info();
            tracing::debug!(
                "GPU adapter: {} ({:?}, {:?}), max buffer {} bytes",
                info.name,
                info.backend,
                info.device_type,
                adapter.limits().max_buffer_size
            );
        }

        SystemEnvironment {
            data_dir,
            gpu_support,
            compute_support,
        }
    }

    /// Available bytes on the disk whose mount point is the longest prefix of the data dir.
    fn data_disk_available_space(&self) -> Option<u64> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| self.data_dir.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    }
}

impl HostEnvironment for SystemEnvironment {
    fn has_gpu_support(&self) -> bool {
        self.gpu_support
    }

    fn has_compute_support(&self) -> bool {
        self.compute_support
    }

    fn has_storage_support(&self) -> bool {
        self.data_disk_available_space().is_some()
    }

    fn available_storage(&self) -> Option<u64> {
        self.data_disk_available_space()
    }

    fn system_memory(&self) -> Option<u64> {
        let mut sys = System::new();
        sys.refresh_memory();

        match sys.total_memory() {
            0 => None,
            total => Some(total),
        }
    }
}
