use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub mod system;

/// Host capabilities the probe depends on.
///
/// Every query is answered live; implementations may block (adapter
/// enumeration, disk stats), so async callers go through `spawn_blocking`.
pub trait HostEnvironment: Send + Sync {
    /// A GPU API with at least one usable backend is present.
    fn has_gpu_support(&self) -> bool;
    /// The GPU can run parallel compute work.
    fn has_compute_support(&self) -> bool;
    /// Free disk space can be estimated.
    fn has_storage_support(&self) -> bool;
    /// Free bytes on the disk backing the data directory. `None` if unknown.
    fn available_storage(&self) -> Option<u64>;
    /// Total physical memory in bytes. `None` if unknown.
    fn system_memory(&self) -> Option<u64>;
}

/// Per-query overrides, mostly for exercising the probe on hardware that
/// would otherwise never hit a given limit. `None` defers to the real host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvOverrides {
    pub gpu_support: Option<bool>,
    pub compute_support: Option<bool>,
    pub storage_support: Option<bool>,
    pub available_storage: Option<u64>,
    pub system_memory: Option<u64>,
}

impl EnvOverrides {
    pub fn is_empty(&self) -> bool {
        *self == EnvOverrides::default()
    }
}

/// Wraps another environment and answers from overrides where they are set.
pub struct OverriddenEnvironment {
    inner: Arc<dyn HostEnvironment>,
    overrides: EnvOverrides,
}

impl OverriddenEnvironment {
    pub fn new(inner: Arc<dyn HostEnvironment>, overrides: EnvOverrides) -> Self {
        OverriddenEnvironment { inner, overrides }
    }
}

impl HostEnvironment for OverriddenEnvironment {
    fn has_gpu_support(&self) -> bool {
        self.overrides
            .gpu_support
            .unwrap_or_else(|| self.inner.has_gpu_support())
    }

    fn has_compute_support(&self) -> bool {
        self.overrides
            .compute_support
            .unwrap_or_else(|| self.inner.has_compute_support())
    }

    fn has_storage_support(&self) -> bool {
        self.overrides
            .storage_support
            .unwrap_or_else(|| self.inner.has_storage_support())
    }

    fn available_storage(&self) -> Option<u64> {
        if let Some(bytes) = self.overrides.available_storage {
            return Some(bytes);
        }
        if !self.has_storage_support() {
            return None;
        }
        self.inner.available_storage()
    }

    fn system_memory(&self) -> Option<u64> {
        self.overrides
            .system_memory
            .or_else(|| self.inner.system_memory())
    }
}

/// Build the environment used at runtime (blocking, call at startup).
pub fn detect_environment(data_dir: &Path, overrides: EnvOverrides) -> Arc<dyn HostEnvironment> {
    let host: Arc<dyn HostEnvironment> = Arc::new(system::SystemEnvironment::new(data_dir));

    if overrides.is_empty() {
        return host;
    }

    tracing::warn!("Environment overrides active: {:?}", overrides);
    Arc::new(OverriddenEnvironment::new(host, overrides))
}

/// Serializable view of the environment for the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentReport {
    pub gpu_support: bool,
    pub compute_support: bool,
    pub storage_support: bool,
    pub available_storage: Option<u64>,
    pub system_memory: Option<u64>,
}

impl EnvironmentReport {
    pub fn collect(env: &dyn HostEnvironment) -> Self {
        EnvironmentReport {
            gpu_support: env.has_gpu_support(),
            compute_support: env.has_compute_support(),
            storage_support: env.has_storage_support(),
            available_storage: env.available_storage(),
            system_memory: env.system_memory(),
        }
    }
}

/// Environment answering from plain values. Storage can be scripted as a
/// sequence so consecutive `available_storage` calls see a shrinking disk.
#[cfg(test)]
pub struct FixedEnvironment {
    pub gpu_support: bool,
    pub compute_support: bool,
    pub storage: std::sync::Mutex<std::collections::VecDeque<u64>>,
    pub system_memory: Option<u64>,
}

#[cfg(test)]
impl FixedEnvironment {
    pub fn new(available_storage: Option<u64>, system_memory: Option<u64>) -> Self {
        FixedEnvironment {
            gpu_support: true,
            compute_support: true,
            storage: std::sync::Mutex::new(available_storage.into_iter().collect()),
            system_memory,
        }
    }

    /// Each call consumes one value; the last one repeats.
    pub fn with_storage_sequence(values: Vec<u64>) -> Self {
        FixedEnvironment {
            storage: std::sync::Mutex::new(values.into_iter().collect()),
            ..FixedEnvironment::new(None, None)
        }
    }
}

#[cfg(test)]
impl HostEnvironment for FixedEnvironment {
    fn has_gpu_support(&self) -> bool {
        self.gpu_support
    }

    fn has_compute_support(&self) -> bool {
        self.compute_support
    }

    fn has_storage_support(&self) -> bool {
        !self.storage.lock().unwrap().is_empty()
    }

    fn available_storage(&self) -> Option<u64> {
        let mut values = self.storage.lock().unwrap();
        if values.len() > 1 {
            values.pop_front()
        } else {
            values.front().copied()
        }
    }

    fn system_memory(&self) -> Option<u64> {
        self.system_memory
    }
}
