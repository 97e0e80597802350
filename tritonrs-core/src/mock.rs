//! An in-memory [`Driver`] that records every call, for tests.
//!
//! A module "contains" a function when the function name occurs in the image bytes.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    thread,
    time::Duration,
};

use crate::{
    driver::{
        DeviceAttribute, Driver, FunctionAttribute, FunctionHandle, KernelParam, LaunchConfig,
        ModuleHandle, StreamHandle,
    },
    error::DriverError,
    Result,
};

pub const CUDA_ERROR_INVALID_IMAGE: i32 = 200;
pub const CUDA_ERROR_NOT_FOUND: i32 = 500;

/// A launch observed by the mock driver.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedLaunch {
    pub function: FunctionHandle,
    pub config: LaunchConfig,
    pub stream: StreamHandle,
    pub params: Vec<KernelParam>,
}

#[derive(Debug, Default)]
struct State {
    modules: HashMap<usize, (u32, Vec<u8>)>,
    functions: HashMap<usize, (usize, String)>,
    attribute_writes: Vec<(FunctionHandle, FunctionAttribute, i32)>,
    launches: Vec<RecordedLaunch>,
}

#[derive(Debug)]
pub struct MockDriver {
    optin: i32,
    static_shared: i32,
    load_delay: Duration,
    fail_loads: AtomicUsize,
    loads: AtomicUsize,
    attribute_queries: AtomicUsize,
    next_handle: AtomicUsize,
    state: Mutex<State>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            optin: 232448,
            static_shared: 0,
            load_delay: Duration::ZERO,
            fail_loads: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            attribute_queries: AtomicUsize::new(0),
            next_handle: AtomicUsize::new(1),
            state: Mutex::new(State::default()),
        }
    }

    /// Maximum opt-in shared memory per block reported for every device.
    pub fn with_optin(mut self, bytes: i32) -> Self {
        self.optin = bytes;
        self
    }

    /// Static shared memory reported for every function.
    pub fn with_static_shared(mut self, bytes: i32) -> Self {
        self.static_shared = bytes;
        self
    }

    /// Sleep inside every module load, to widen race windows.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Make the next `n` module loads fail with `CUDA_ERROR_INVALID_IMAGE`.
    pub fn fail_next_loads(&self, n: usize) {
        self.fail_loads.store(n, Ordering::SeqCst);
    }

    /// Module load attempts, including failed ones.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn attribute_queries(&self) -> usize {
        self.attribute_queries.load(Ordering::SeqCst)
    }

    pub fn attribute_writes(&self) -> Vec<(FunctionHandle, FunctionAttribute, i32)> {
        self.state.lock().unwrap().attribute_writes.clone()
    }

    pub fn launches(&self) -> Vec<RecordedLaunch> {
        self.state.lock().unwrap().launches.clone()
    }

    /// The device a function was loaded on.
    pub fn function_device(&self, function: FunctionHandle) -> Option<u32> {
        let state = self.state.lock().unwrap();
        let (module, _) = state.functions.get(&function.0)?;
        state.modules.get(module).map(|(device, _)| *device)
    }

    fn handle(&self) -> usize {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }
}

impl Driver for MockDriver {
    fn load_module(&self, device: u32, image: &[u8]) -> Result<ModuleHandle> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            thread::sleep(self.load_delay);
        }
        let failing = self
            .fail_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing || image.is_empty() {
            return Err(DriverError::new(
                CUDA_ERROR_INVALID_IMAGE,
                "CUDA_ERROR_INVALID_IMAGE",
                "device kernel image is invalid",
            )
            .into());
        }
        let handle = self.handle();
        self.state
            .lock()
            .unwrap()
            .modules
            .insert(handle, (device, image.to_vec()));
        Ok(ModuleHandle(handle))
    }

    fn get_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle> {
        let mut state = self.state.lock().unwrap();
        let found = !name.is_empty()
            && state.modules.get(&module.0).is_some_and(|(_, image)| {
                image.windows(name.len()).any(|w| w == name.as_bytes())
            });
        if !found {
            return Err(DriverError::new(
                CUDA_ERROR_NOT_FOUND,
                "CUDA_ERROR_NOT_FOUND",
                "named symbol not found",
            )
            .into());
        }
        let handle = self.handle();
        state.functions.insert(handle, (module.0, name.to_string()));
        Ok(FunctionHandle(handle))
    }

    fn device_attribute(&self, _device: u32, attr: DeviceAttribute) -> Result<i32> {
        self.attribute_queries.fetch_add(1, Ordering::SeqCst);
        Ok(match attr {
            DeviceAttribute::MaxSharedMemoryPerBlockOptin => self.optin,
        })
    }

    fn function_attribute(
        &self,
        _function: FunctionHandle,
        attr: FunctionAttribute,
    ) -> Result<i32> {
        self.attribute_queries.fetch_add(1, Ordering::SeqCst);
        Ok(match attr {
            FunctionAttribute::SharedSizeBytes => self.static_shared,
            FunctionAttribute::MaxDynamicSharedSizeBytes => 0,
        })
    }

    fn set_function_attribute(
        &self,
        function: FunctionHandle,
        attr: FunctionAttribute,
        value: i32,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .attribute_writes
            .push((function, attr, value));
        Ok(())
    }

    fn launch(
        &self,
        function: FunctionHandle,
        config: &LaunchConfig,
        stream: StreamHandle,
        params: &[KernelParam],
    ) -> Result<()> {
        self.state.lock().unwrap().launches.push(RecordedLaunch {
            function,
            config: *config,
            stream,
            params: params.to_vec(),
        });
        Ok(())
    }
}
