//! Runtime for launching precompiled Triton kernels.
//!
//! Wrapper code builds a [`LaunchRequest`] from positional and keyword
//! arguments; the [`KernelLauncher`] binds them to the kernel's declared
//! parameters, resolves the launch grid, fetches the kernel for the current
//! device from the [`KernelCache`] and launches it through a [`Driver`].

pub mod cache;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod driver;
mod error;
pub mod grid;
pub mod launch;
pub mod manifest;
pub mod meta;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod runtime;
pub mod signature;
pub mod value;

pub use cache::{CompiledKernelKey, KernelCache, KernelHandle, DEFAULT_SHARED_MEMORY_LIMIT};
#[cfg(feature = "cuda")]
pub use cuda::CudaDriver;
pub use driver::{Driver, KernelParam, LaunchConfig, StreamHandle};
pub use error::{DriverError, Error, Result};
pub use grid::{cdiv, next_power_of_two, Dim3, GridSpec};
pub use launch::{KernelLauncher, LaunchRequest, MAX_NUM_WARPS};
pub use manifest::{CompiledKernel, KernelManifest, KernelSet};
pub use meta::{assemble, MetaBuilder, MetadataMapping};
pub use runtime::{DefaultStream, Runtime, StreamContext};
pub use signature::{ArgType, KernelSignature, ParamSpec};
pub use value::{DataType, Device, DeviceKind, TensorArg, Value};
