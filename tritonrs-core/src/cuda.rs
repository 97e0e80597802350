//! [`Driver`] over the raw CUDA driver API.
//!
//! cudarc's safe wrappers keep `CUmodule`/`CUfunction` private, so modules are
//! loaded and launched through `cudarc::driver::sys` directly. cudarc's
//! `CudaContext` is still used to retain and bind each device's primary context.

use std::{
    collections::HashMap,
    ffi::{c_void, CString},
    mem::MaybeUninit,
    sync::{Arc, RwLock},
};

use cudarc::driver::{sys, CudaContext};
use tracing::debug;

use crate::{
    driver::{
        DeviceAttribute, Driver, FunctionAttribute, FunctionHandle, KernelParam, LaunchConfig,
        ModuleHandle, StreamHandle,
    },
    error::DriverError,
    Error, Result,
};

/// Turn a driver status into a `DriverError` carrying the status name,
/// description and the caller's location.
#[track_caller]
fn check(status: sys::CUresult) -> Result<()> {
    if status == sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(status_error(status))
    }
}

#[track_caller]
fn status_error(status: sys::CUresult) -> Error {
    let raw = cudarc::driver::DriverError(status);
    let name = raw
        .error_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| format!("{status:?}"));
    let description = raw
        .error_string()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown error".to_string());
    DriverError::new(status as i32, name, description).into()
}

fn device_attribute(attr: DeviceAttribute) -> sys::CUdevice_attribute {
    match attr {
        DeviceAttribute::MaxSharedMemoryPerBlockOptin => {
            sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK_OPTIN
        }
    }
}

fn function_attribute(attr: FunctionAttribute) -> sys::CUfunction_attribute {
    match attr {
        FunctionAttribute::SharedSizeBytes => {
            sys::CUfunction_attribute::CU_FUNC_ATTRIBUTE_SHARED_SIZE_BYTES
        }
        FunctionAttribute::MaxDynamicSharedSizeBytes => {
            sys::CUfunction_attribute::CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES
        }
    }
}

/// Owned storage for launch parameters; `cuLaunchKernel` receives pointers into it.
/// Triton lowers `i1` parameters to 32 bit integers.
enum RawParam {
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl From<&KernelParam> for RawParam {
    fn from(p: &KernelParam) -> Self {
        match *p {
            KernelParam::I1(v) => Self::I32(v as i32),
            KernelParam::I32(v) => Self::I32(v),
            KernelParam::I64(v) => Self::I64(v),
            KernelParam::U32(v) => Self::U32(v),
            KernelParam::U64(v) | KernelParam::Ptr(v) => Self::U64(v),
            KernelParam::F32(v) => Self::F32(v),
            KernelParam::F64(v) => Self::F64(v),
        }
    }
}

impl RawParam {
    fn as_void_ptr(&mut self) -> *mut c_void {
        match self {
            Self::I32(v) => v as *mut i32 as *mut c_void,
            Self::I64(v) => v as *mut i64 as *mut c_void,
            Self::U32(v) => v as *mut u32 as *mut c_void,
            Self::U64(v) => v as *mut u64 as *mut c_void,
            Self::F32(v) => v as *mut f32 as *mut c_void,
            Self::F64(v) => v as *mut f64 as *mut c_void,
        }
    }
}

/// The CUDA driver. Primary contexts are retained on first use of a device.
#[derive(Default)]
pub struct CudaDriver {
    contexts: RwLock<HashMap<u32, Arc<CudaContext>>>,
}

impl CudaDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn context(&self, device: u32) -> Result<Arc<CudaContext>> {
        if let Some(ctx) = self.contexts.read().map_err(poisoned)?.get(&device) {
            return Ok(ctx.clone());
        }
        let mut contexts = self.contexts.write().map_err(poisoned)?;
        if let Some(ctx) = contexts.get(&device) {
            return Ok(ctx.clone());
        }
        let ctx = CudaContext::new(device as usize).map_err(|e| status_error(e.0))?;
        debug!(device, "retained CUDA primary context");
        contexts.insert(device, ctx.clone());
        Ok(ctx)
    }

    /// Make `device`'s primary context current; modules load into the current context.
    fn bind(&self, device: u32) -> Result<()> {
        self.context(device)?
            .bind_to_thread()
            .map_err(|e| status_error(e.0))
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> Error {
    Error::LockPoisoned(e.to_string())
}

impl Driver for CudaDriver {
    fn load_module(&self, device: u32, image: &[u8]) -> Result<ModuleHandle> {
        self.bind(device)?;
        let mut data = Vec::with_capacity(image.len() + 1);
        data.extend_from_slice(image);
        if !image.ends_with(&[0]) {
            data.push(0);
        }
        let mut module = MaybeUninit::uninit();
        // SAFETY: `data` outlives the call and the device context is bound.
        let module = unsafe {
            check(sys::cuModuleLoadData(
                module.as_mut_ptr(),
                data.as_ptr() as *const c_void,
            ))?;
            module.assume_init()
        };
        Ok(ModuleHandle(module as usize))
    }

    fn get_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle> {
        let name = CString::new(name).map_err(|_| {
            Error::InvalidBinding(format!("kernel name `{name}` contains a NUL byte"))
        })?;
        let mut func = MaybeUninit::uninit();
        // SAFETY: `module` came from `cuModuleLoadData` and is never unloaded.
        let func = unsafe {
            check(sys::cuModuleGetFunction(
                func.as_mut_ptr(),
                module.0 as sys::CUmodule,
                name.as_ptr(),
            ))?;
            func.assume_init()
        };
        Ok(FunctionHandle(func as usize))
    }

    fn device_attribute(&self, device: u32, attr: DeviceAttribute) -> Result<i32> {
        let mut dev = MaybeUninit::uninit();
        let mut value = 0i32;
        // SAFETY: out-pointers are valid for writes.
        unsafe {
            check(sys::cuDeviceGet(dev.as_mut_ptr(), device as i32))?;
            check(sys::cuDeviceGetAttribute(
                &mut value,
                device_attribute(attr),
                dev.assume_init(),
            ))?;
        }
        Ok(value)
    }

    fn function_attribute(
        &self,
        function: FunctionHandle,
        attr: FunctionAttribute,
    ) -> Result<i32> {
        let mut value = 0i32;
        // SAFETY: `function` is a live function handle.
        unsafe {
            check(sys::cuFuncGetAttribute(
                &mut value,
                function_attribute(attr),
                function.0 as sys::CUfunction,
            ))?;
        }
        Ok(value)
    }

    fn set_function_attribute(
        &self,
        function: FunctionHandle,
        attr: FunctionAttribute,
        value: i32,
    ) -> Result<()> {
        // SAFETY: `function` is a live function handle.
        unsafe {
            check(sys::cuFuncSetAttribute(
                function.0 as sys::CUfunction,
                function_attribute(attr),
                value,
            ))
        }
    }

    fn launch(
        &self,
        function: FunctionHandle,
        config: &LaunchConfig,
        stream: StreamHandle,
        params: &[KernelParam],
    ) -> Result<()> {
        let mut storage: Vec<RawParam> = params.iter().map(RawParam::from).collect();
        let mut ptrs: Vec<*mut c_void> = storage.iter_mut().map(RawParam::as_void_ptr).collect();
        // SAFETY: every pointer in `ptrs` refers into `storage`, which outlives
        // the call; the argument order is the kernel's calling convention.
        unsafe {
            check(sys::cuLaunchKernel(
                function.0 as sys::CUfunction,
                config.grid.x,
                config.grid.y,
                config.grid.z,
                config.block.x,
                config.block.y,
                config.block.z,
                config.shared_mem_bytes,
                stream.0 as sys::CUstream,
                ptrs.as_mut_ptr(),
                std::ptr::null_mut(),
            ))
        }
    }
}
