use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::{
    cache::KernelCache,
    driver::{Driver, LaunchConfig, StreamHandle},
    grid::{Dim3, GridSpec},
    manifest::CompiledKernel,
    meta,
    value::{Device, Value},
    Error, Result,
};

/// Threads per warp on every supported device.
pub const WARP_SIZE: u32 = 32;

/// Warps per block at the 1024-thread block limit.
pub const MAX_NUM_WARPS: u32 = 32;

const NUM_WARPS: &str = "num_warps";
const NUM_STAGES: &str = "num_stages";

/// Everything a wrapper supplies for one kernel invocation.
#[derive(Debug)]
pub struct LaunchRequest {
    pub grid: GridSpec,
    pub device: Device,
    pub stream: StreamHandle,
    pub num_warps: Option<u32>,
    pub num_stages: Option<u32>,
    pub args: Vec<Value>,
    pub kwargs: IndexMap<String, Value>,
}

impl LaunchRequest {
    pub fn new(grid: impl Into<GridSpec>, device: Device, stream: StreamHandle) -> Self {
        Self {
            grid: grid.into(),
            device,
            stream,
            num_warps: None,
            num_stages: None,
            args: Vec::new(),
            kwargs: IndexMap::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn num_warps(mut self, num_warps: u32) -> Self {
        self.num_warps = Some(num_warps);
        self
    }

    pub fn num_stages(mut self, num_stages: u32) -> Self {
        self.num_stages = Some(num_stages);
        self
    }
}

/// Resolves metadata and grid for a request, acquires the kernel for the
/// request's device and hands the launch to the driver.
///
/// `num_warps` and `num_stages` travel as keyword arguments. `num_warps`
/// sizes the block; `num_stages` is fixed when the kernel is compiled and
/// has no effect here.
#[derive(Debug)]
pub struct KernelLauncher {
    cache: KernelCache,
}

impl KernelLauncher {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            cache: KernelCache::new(driver),
        }
    }

    pub fn cache(&self) -> &KernelCache {
        &self.cache
    }

    /// Launch `kernel`, returning the grid it was launched with.
    pub fn launch(&self, kernel: &CompiledKernel, request: LaunchRequest) -> Result<Dim3> {
        let LaunchRequest {
            grid,
            device,
            stream,
            num_warps,
            num_stages,
            args,
            mut kwargs,
        } = request;

        // Explicit launch options win over keyword arguments of the same name.
        if let Some(n) = num_warps {
            kwargs.insert(NUM_WARPS.to_string(), Value::from(n));
        }
        if let Some(n) = num_stages {
            kwargs.insert(NUM_STAGES.to_string(), Value::from(n));
        }

        let declared: Vec<&str> = kernel.signature.names().collect();
        let mut metadata = meta::assemble(&declared, &args, &kwargs)?;
        metadata.fill_unbound(&kernel.constants);
        let grid = grid.resolve(&metadata)?;

        let warps = match kwargs.get(NUM_WARPS) {
            Some(v) => v.as_int().and_then(|n| u32::try_from(n).ok()),
            None => Some(kernel.num_warps),
        }
        .filter(|n| (1..=MAX_NUM_WARPS).contains(n))
        .ok_or_else(|| {
            Error::InvalidBinding(format!(
                "`{NUM_WARPS}` must be an integer in 1..={MAX_NUM_WARPS}"
            ))
        })?;

        if grid.is_empty() {
            debug!(kernel = %kernel.name, ?grid, "empty grid, skipping launch");
            return Ok(grid);
        }

        let params = kernel.signature.marshal(&metadata)?;
        let handle = self.cache.acquire(&kernel.key, device.ordinal)?;
        let config = LaunchConfig {
            grid,
            block: Dim3::new(WARP_SIZE * warps, 1, 1),
            shared_mem_bytes: handle.shared_mem,
        };
        trace!(
            kernel = %kernel.name,
            device = device.ordinal,
            ?config,
            params = params.len(),
            "launching kernel"
        );
        self.cache
            .driver()
            .launch(handle.function, &config, stream, &params)?;
        Ok(grid)
    }
}
