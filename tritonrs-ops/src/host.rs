//! Bridging candle tensors into kernel launches.

use std::sync::RwLock;

use candle_core::{CpuStorage, DType, DeviceLocation, Shape, Storage, Tensor, WithDType};
use tracing::debug;
use tritonrs_core::{DataType, Device, DeviceKind, StreamContext, StreamHandle, TensorArg};

use crate::{Error, Result};

pub fn data_type(dtype: DType) -> Result<DataType> {
    Ok(match dtype {
        DType::U8 => DataType::U8,
        DType::U32 => DataType::U32,
        DType::I64 => DataType::I64,
        DType::BF16 => DataType::BF16,
        DType::F16 => DataType::F16,
        DType::F32 => DataType::F32,
        DType::F64 => DataType::F64,
        other => return Err(Error::Unsupported(format!("dtype {other:?}"))),
    })
}

pub fn device(device: &candle_core::Device) -> Result<Device> {
    match device.location() {
        DeviceLocation::Cpu => Ok(Device::CPU),
        DeviceLocation::Cuda { gpu_id } => Ok(Device::cuda(gpu_id as u32)),
        other => Err(Error::Unsupported(format!("device {other:?}"))),
    }
}

fn cpu_ptr(storage: &CpuStorage, dtype: DType, offset: usize) -> Result<u64> {
    fn base<T: WithDType>(storage: &CpuStorage, offset: usize) -> Result<u64> {
        Ok(storage.as_slice::<T>()?[offset..].as_ptr() as u64)
    }
    match dtype {
        DType::U8 => base::<u8>(storage, offset),
        DType::U32 => base::<u32>(storage, offset),
        DType::I64 => base::<i64>(storage, offset),
        DType::BF16 => base::<half::bf16>(storage, offset),
        DType::F16 => base::<half::f16>(storage, offset),
        DType::F32 => base::<f32>(storage, offset),
        DType::F64 => base::<f64>(storage, offset),
        other => Err(Error::Unsupported(format!("dtype {other:?}"))),
    }
}

#[cfg(feature = "cuda")]
fn cuda_ptr(storage: &candle_core::CudaStorage, dtype: DType, offset: usize) -> Result<u64> {
    use candle_core::cuda_backend::{
        cudarc::driver::{DevicePtr, DeviceRepr},
        CudaDType,
    };

    fn base<T: CudaDType + DeviceRepr>(
        storage: &candle_core::CudaStorage,
        offset: usize,
    ) -> Result<u64> {
        let slice = storage.as_cuda_slice::<T>()?;
        let (ptr, _guard) = slice.slice(offset..).device_ptr(slice.stream());
        Ok(ptr)
    }
    match dtype {
        DType::U8 => base::<u8>(storage, offset),
        DType::U32 => base::<u32>(storage, offset),
        DType::I64 => base::<i64>(storage, offset),
        DType::BF16 => base::<half::bf16>(storage, offset),
        DType::F16 => base::<half::f16>(storage, offset),
        DType::F32 => base::<f32>(storage, offset),
        DType::F64 => base::<f64>(storage, offset),
        other => Err(Error::Unsupported(format!("dtype {other:?}"))),
    }
}

/// Describe `tensor` for a kernel launch.
///
/// The pointer addresses the first element of the tensor's view, i.e. the
/// storage base advanced by the layout's start offset. The tensor must
/// outlive the launch.
pub fn tensor_arg(tensor: &Tensor) -> Result<TensorArg> {
    let dtype = data_type(tensor.dtype())?;
    let device = device(tensor.device())?;
    let ptr = {
        let (storage, layout) = tensor.storage_and_layout();
        match &*storage {
            Storage::Cpu(cpu) => cpu_ptr(cpu, tensor.dtype(), layout.start_offset())?,
            #[cfg(feature = "cuda")]
            Storage::Cuda(cuda) => cuda_ptr(cuda, tensor.dtype(), layout.start_offset())?,
            _ => {
                return Err(Error::Unsupported(format!(
                    "tensor storage on {:?}",
                    tensor.device().location()
                )))
            }
        }
    };
    Ok(TensorArg {
        ptr,
        shape: tensor.dims().to_vec(),
        strides: tensor.stride().to_vec(),
        dtype,
        device,
    })
}

/// Allocate an output with the shape, dtype and device of `tensor`.
pub fn empty_like(tensor: &Tensor) -> Result<Tensor> {
    Ok(tensor.zeros_like()?)
}

pub fn empty<S: Into<Shape>>(shape: S, dtype: DType, device: &candle_core::Device) -> Result<Tensor> {
    Ok(Tensor::zeros(shape, dtype, device)?)
}

/// Narrow a computed grid extent to the launch's `u32`.
pub fn grid_extent(n: u64) -> tritonrs_core::Result<u32> {
    u32::try_from(n).map_err(|_| {
        tritonrs_core::Error::InvalidBinding(format!("grid extent {n} exceeds u32"))
    })
}

/// Streams of the candle devices a process computes on.
///
/// CPU launches use the default stream. A CUDA device has to be registered
/// before launching on it, so kernels queue behind the work candle already
/// issued on that device's stream.
#[derive(Debug, Default)]
pub struct CandleStreams {
    devices: RwLock<Vec<candle_core::Device>>,
}

impl CandleStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device: &candle_core::Device) -> tritonrs_core::Result<()> {
        let mut devices = self
            .devices
            .write()
            .map_err(|_| tritonrs_core::Error::LockPoisoned("candle devices".to_string()))?;
        if !devices.iter().any(|d| d.same_device(device)) {
            devices.push(device.clone());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.devices.read().map(|d| d.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StreamContext for CandleStreams {
    fn current_stream(&self, device: Device) -> tritonrs_core::Result<StreamHandle> {
        if device.kind == DeviceKind::Cpu {
            return Ok(StreamHandle::NULL);
        }
        #[cfg(feature = "cuda")]
        {
            let devices = self
                .devices
                .read()
                .map_err(|_| tritonrs_core::Error::LockPoisoned("candle devices".to_string()))?;
            for candidate in devices.iter() {
                if let candle_core::Device::Cuda(dev) = candidate {
                    if matches!(candidate.location(), DeviceLocation::Cuda { gpu_id } if gpu_id as u32 == device.ordinal)
                    {
                        return Ok(StreamHandle(dev.cuda_stream().cu_stream() as usize));
                    }
                }
            }
        }
        debug!(device = device.ordinal, "no registered candle device");
        Err(tritonrs_core::Error::UnregisteredDevice(device))
    }
}
