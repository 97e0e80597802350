//! The boundary to the accelerator driver.
//!
//! The kernel cache and launcher only talk to a [`Driver`]. The CUDA
//! implementation lives in [`crate::cuda`]; tests use [`crate::mock`].

use crate::{grid::Dim3, Result};

/// A loaded module. Raw driver handle, only meaningful to the driver that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub usize);

/// A resolved kernel entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle(pub usize);

/// An ordered queue of device work. `StreamHandle::NULL` is the default stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub usize);

impl StreamHandle {
    pub const NULL: StreamHandle = StreamHandle(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceAttribute {
    MaxSharedMemoryPerBlockOptin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionAttribute {
    /// Statically allocated shared memory of the function, in bytes.
    SharedSizeBytes,
    MaxDynamicSharedSizeBytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: u32,
}

/// A single kernel parameter in the kernel's calling convention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelParam {
    I1(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Ptr(u64),
}

pub trait Driver: Send + Sync {
    /// Load a compiled binary image into `device`'s module space.
    fn load_module(&self, device: u32, image: &[u8]) -> Result<ModuleHandle>;

    fn get_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle>;

    fn device_attribute(&self, device: u32, attr: DeviceAttribute) -> Result<i32>;

    fn function_attribute(&self, function: FunctionHandle, attr: FunctionAttribute)
        -> Result<i32>;

    fn set_function_attribute(
        &self,
        function: FunctionHandle,
        attr: FunctionAttribute,
        value: i32,
    ) -> Result<()>;

    /// Enqueue `function` on `stream`. Errors raised by the kernel itself
    /// surface later through the driver, not here.
    fn launch(
        &self,
        function: FunctionHandle,
        config: &LaunchConfig,
        stream: StreamHandle,
        params: &[KernelParam],
    ) -> Result<()>;
}
