//! Candle wrappers around precompiled Triton kernels.
//!
//! Each wrapper allocates its outputs, describes the tensors for the launch
//! and hands the request to a [`tritonrs_core::Runtime`]:
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use candle_core::{Device, Tensor};
//! use tritonrs_core::CudaDriver;
//! use tritonrs_ops::{add, CandleStreams, OpsConfig};
//!
//! # fn main() -> tritonrs_ops::Result<()> {
//! let device = Device::new_cuda(0)?;
//! let streams = Arc::new(CandleStreams::new());
//! streams.register(&device)?;
//! let rt = OpsConfig::from_env()?.build_runtime(Arc::new(CudaDriver::default()), streams)?;
//!
//! let x = Tensor::randn(0f32, 1., 98432, &device)?;
//! let y = Tensor::randn(0f32, 1., 98432, &device)?;
//! let z = add(&rt, &x, &y)?;
//! # Ok(())
//! # }
//! ```

pub mod add;
pub mod attention;
pub mod config;
mod error;
pub mod host;
pub mod matmul;
pub mod registry;
pub mod softmax;

pub use add::add;
pub use attention::{attn_bwd, attn_bwd_preprocess, attn_fwd};
pub use config::{OpNames, OpsConfig};
pub use error::{Error, Result};
pub use host::{empty, empty_like, tensor_arg, CandleStreams};
pub use matmul::matmul;
pub use registry::{register_ops, HostValue, Registry};
pub use softmax::softmax;
