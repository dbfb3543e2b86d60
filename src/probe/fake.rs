//! Scripted in-memory GPU for exercising the probe engine without hardware.

use crate::gpu::{BufferRole, BufferSpec, GpuAdapter, GpuApi, GpuBuffer, GpuDevice, ScopeErrors};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Failure injection; buffer numbers are 1-based test buffer numbers.
#[derive(Debug, Clone)]
pub struct FakeScript {
    pub adapter_available: bool,
    pub max_buffer_size: u64,
    pub device_error: Option<String>,
    pub fail_read_back_alloc: bool,
    pub fail_alloc_at: Option<usize>,
    pub scope_errors_at: HashMap<usize, ScopeErrors>,
    pub driver_failure_at: Option<usize>,
    pub copy_time: Duration,
    pub copy_times_at: HashMap<usize, Duration>,
    pub corrupt_at: Option<usize>,
    pub map_failure_at: Option<usize>,
    pub panic_at: Option<usize>,
    /// Real time slept per copy, so other threads can act mid-run.
    pub pace: Duration,
}

impl Default for FakeScript {
    fn default() -> Self {
        FakeScript {
            adapter_available: true,
            max_buffer_size: 1024,
            device_error: None,
            fail_read_back_alloc: false,
            fail_alloc_at: None,
            scope_errors_at: HashMap::new(),
            driver_failure_at: None,
            copy_time: Duration::from_millis(2),
            copy_times_at: HashMap::new(),
            corrupt_at: None,
            map_failure_at: None,
            panic_at: None,
            pace: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct FakeLog {
    pub adapter_requests: usize,
    pub device_limit: Option<u64>,
    pub created: Vec<String>,
    pub destroyed: Vec<String>,
    pub destroyed_while_mapped: usize,
    pub copies: usize,
}

pub struct FakeGpu {
    script: FakeScript,
    log: Arc<Mutex<FakeLog>>,
}

impl FakeGpu {
    pub fn new(script: FakeScript) -> Self {
        FakeGpu {
            script,
            log: Arc::new(Mutex::new(FakeLog::default())),
        }
    }

    pub fn log(&self) -> FakeLog {
        self.log.lock().unwrap().clone()
    }
}

impl GpuApi for FakeGpu {
    type Adapter = FakeAdapter;

    fn request_adapter(&self) -> Option<FakeAdapter> {
        self.log.lock().unwrap().adapter_requests += 1;
        if !self.script.adapter_available {
            return None;
        }
        Some(FakeAdapter {
            script: self.script.clone(),
            log: self.log.clone(),
        })
    }
}

pub struct FakeAdapter {
    script: FakeScript,
    log: Arc<Mutex<FakeLog>>,
}

impl GpuAdapter for FakeAdapter {
    type Device = FakeDevice;

    fn max_buffer_size(&self) -> u64 {
        self.script.max_buffer_size
    }

    fn request_device(&self, max_buffer_size: u64) -> Result<FakeDevice, String> {
        if let Some(err) = &self.script.device_error {
            return Err(err.clone());
        }
        self.log.lock().unwrap().device_limit = Some(max_buffer_size);
        Ok(FakeDevice {
            script: self.script.clone(),
            log: self.log.clone(),
            tests_created: Cell::new(0),
            pending_scopes: RefCell::new(None),
        })
    }
}

pub struct FakeDevice {
    script: FakeScript,
    log: Arc<Mutex<FakeLog>>,
    tests_created: Cell<usize>,
    pending_scopes: RefCell<Option<ScopeErrors>>,
}

impl GpuDevice for FakeDevice {
    type Buffer = FakeBuffer;

    fn create_buffer(&self, spec: &BufferSpec) -> Result<FakeBuffer, String> {
        let number = match spec.role {
            BufferRole::ReadBack => {
                if self.script.fail_read_back_alloc {
                    return Err(format!("no room for {}", spec.label));
                }
                0
            }
            BufferRole::Test => {
                let n = self.tests_created.get() + 1;
                self.tests_created.set(n);
                if self.script.panic_at == Some(n) {
                    panic!("simulated driver crash on {}", spec.label);
                }
                if self.script.fail_alloc_at == Some(n) {
                    return Err(format!(
                        "Failed to allocate buffer \"{}\" of size {}",
                        spec.label, spec.size
                    ));
                }
                n
            }
        };

        self.log.lock().unwrap().created.push(spec.label.clone());
        Ok(FakeBuffer {
            label: spec.label.clone(),
            number,
            mapped: spec.mapped_at_creation(),
            data: RefCell::new(vec![0; spec.size as usize]),
            script: self.script.clone(),
            log: self.log.clone(),
        })
    }

    fn push_error_scopes(&self) {
        *self.pending_scopes.borrow_mut() = Some(ScopeErrors::default());
    }

    fn pop_error_scopes(&self) -> ScopeErrors {
        self.pending_scopes
            .borrow_mut()
            .take()
            .expect("error scopes popped without push")
    }

    fn copy_and_wait(
        &self,
        src: &FakeBuffer,
        dst: &FakeBuffer,
        size: u64,
    ) -> Result<Duration, String> {
        assert!(self.pending_scopes.borrow().is_some(), "copy outside error scopes");
        assert!(!src.mapped, "source must be unmapped before copying");
        self.log.lock().unwrap().copies += 1;

        if !self.script.pace.is_zero() {
            std::thread::sleep(self.script.pace);
        }

        let n = src.number;
        if self.script.driver_failure_at == Some(n) {
            return Err("device lost".into());
        }
        if let Some(errors) = self.script.scope_errors_at.get(&n) {
            *self.pending_scopes.borrow_mut() = Some(errors.clone());
            return Ok(self.script.copy_time);
        }

        let size = size as usize;
        let mut out = dst.data.borrow_mut();
        out[..size].copy_from_slice(&src.data.borrow()[..size]);
        if self.script.corrupt_at == Some(n) {
            out[0] = out[0].wrapping_add(1);
        }

        Ok(self
            .script
            .copy_times_at
            .get(&n)
            .copied()
            .unwrap_or(self.script.copy_time))
    }
}

pub struct FakeBuffer {
    label: String,
    number: usize,
    mapped: bool,
    data: RefCell<Vec<u8>>,
    script: FakeScript,
    log: Arc<Mutex<FakeLog>>,
}

impl GpuBuffer for FakeBuffer {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_mapped(&self) -> bool {
        self.mapped
    }

    fn write_mapped(&mut self, fill: &mut dyn FnMut(&mut [u8])) {
        assert!(self.mapped, "{} is not mapped", self.label);
        fill(&mut self.data.borrow_mut());
    }

    fn map_read(&mut self) -> Result<(), String> {
        let copies = self.log.lock().unwrap().copies;
        if self.script.map_failure_at == Some(copies) {
            return Err("Buffer mapping failed: device lost".into());
        }
        self.mapped = true;
        Ok(())
    }

    fn read_mapped(&self, inspect: &mut dyn FnMut(&[u8])) {
        assert!(self.mapped, "{} is not mapped", self.label);
        inspect(&self.data.borrow());
    }

    fn unmap(&mut self) {
        self.mapped = false;
    }

    fn destroy(&mut self) {
        let mut log = self.log.lock().unwrap();
        if self.mapped {
            log.destroyed_while_mapped += 1;
        }
        log.destroyed.push(self.label.clone());
    }
}
