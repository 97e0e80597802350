use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::{
    driver::{Driver, StreamHandle},
    grid::Dim3,
    launch::{KernelLauncher, LaunchRequest},
    manifest::KernelSet,
    value::Device,
    Error, Result,
};

/// Looks up the stream kernels should be enqueued on for a device.
///
/// Called on every wrapper invocation; the result is passed through to the
/// launch and never cached.
pub trait StreamContext: Send + Sync {
    fn current_stream(&self, device: Device) -> Result<StreamHandle>;
}

/// Always returns the default stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStream;

impl StreamContext for DefaultStream {
    fn current_stream(&self, _device: Device) -> Result<StreamHandle> {
        Ok(StreamHandle::NULL)
    }
}

static GLOBAL: OnceCell<Arc<Runtime>> = OnceCell::new();

/// The state shared by all wrapper functions: the launcher with its kernel
/// cache, the stream lookup and the compiled kernels.
pub struct Runtime {
    launcher: KernelLauncher,
    streams: Arc<dyn StreamContext>,
    kernels: KernelSet,
}

impl Runtime {
    pub fn new(driver: Arc<dyn Driver>, streams: Arc<dyn StreamContext>, kernels: KernelSet) -> Self {
        Self {
            launcher: KernelLauncher::new(driver),
            streams,
            kernels,
        }
    }

    pub fn launcher(&self) -> &KernelLauncher {
        &self.launcher
    }

    pub fn kernels(&self) -> &KernelSet {
        &self.kernels
    }

    pub fn current_stream(&self, device: Device) -> Result<StreamHandle> {
        self.streams.current_stream(device)
    }

    /// Launch the kernel registered as `kernel`.
    pub fn launch(&self, kernel: &str, request: LaunchRequest) -> Result<Dim3> {
        let kernel = self.kernels.get(kernel)?;
        self.launcher.launch(&kernel, request)
    }

    /// Make `runtime` the process-wide runtime. Only the first call succeeds.
    pub fn install(runtime: Runtime) -> Result<Arc<Runtime>> {
        let runtime = Arc::new(runtime);
        GLOBAL
            .set(runtime.clone())
            .map_err(|_| Error::RuntimeAlreadyInstalled)?;
        Ok(runtime)
    }

    pub fn global() -> Result<Arc<Runtime>> {
        GLOBAL.get().cloned().ok_or(Error::RuntimeUninitialized)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("launcher", &self.launcher)
            .field("kernels", &self.kernels.len())
            .finish_non_exhaustive()
    }
}
