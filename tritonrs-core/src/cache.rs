use std::{
    collections::HashMap,
    fmt,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{Arc, RwLock},
};

use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{
    driver::{DeviceAttribute, Driver, FunctionAttribute, FunctionHandle, ModuleHandle},
    Error, Result,
};

/// Static shared memory available to a block without opting in, in bytes.
pub const DEFAULT_SHARED_MEMORY_LIMIT: u32 = 49152;

/// Identifies a compiled kernel: entry point, binary image and declared shared memory.
///
/// Two keys are equal when the name, the image contents and the shared memory
/// size match. The image digest is computed once at construction.
#[derive(Clone)]
pub struct CompiledKernelKey {
    name: Arc<str>,
    image: Arc<[u8]>,
    shared_mem: u32,
    digest: u64,
}

impl CompiledKernelKey {
    pub fn new(name: impl Into<Arc<str>>, image: impl Into<Arc<[u8]>>, shared_mem: u32) -> Self {
        let image = image.into();
        let mut hasher = DefaultHasher::new();
        image.hash(&mut hasher);
        Self {
            name: name.into(),
            image,
            shared_mem,
            digest: hasher.finish(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn shared_mem(&self) -> u32 {
        self.shared_mem
    }
}

impl PartialEq for CompiledKernelKey {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.shared_mem == other.shared_mem
            && self.digest == other.digest
            && (Arc::ptr_eq(&self.image, &other.image) || self.image == other.image)
    }
}

impl Eq for CompiledKernelKey {}

impl Hash for CompiledKernelKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.shared_mem.hash(state);
        self.digest.hash(state);
    }
}

impl fmt::Debug for CompiledKernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledKernelKey")
            .field("name", &self.name)
            .field("image_len", &self.image.len())
            .field("shared_mem", &self.shared_mem)
            .field("digest", &format_args!("{:016x}", self.digest))
            .finish()
    }
}

/// A kernel loaded on one device and ready to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelHandle {
    pub module: ModuleHandle,
    pub function: FunctionHandle,
    pub device: u32,
    /// Declared shared memory of the kernel, passed as dynamic shared memory at launch.
    pub shared_mem: u32,
    /// The raised dynamic shared memory limit, when the kernel needed to opt in.
    pub dynamic_shared_limit: Option<i32>,
}

type Slot = Arc<OnceCell<KernelHandle>>;

/// Per-device cache of loaded kernels.
///
/// Each `(key, device)` pair is loaded and configured at most once, also when
/// first requested from several threads at the same time. A failed load
/// leaves nothing behind, so the next request tries again.
pub struct KernelCache {
    driver: Arc<dyn Driver>,
    slots: RwLock<HashMap<(CompiledKernelKey, u32), Slot>>,
}

impl KernelCache {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Number of successfully loaded `(kernel, device)` pairs.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .map(|slots| slots.values().filter(|s| s.get().is_some()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn acquire(&self, key: &CompiledKernelKey, device: u32) -> Result<KernelHandle> {
        let slot = self.slot(key, device)?;
        if let Some(handle) = slot.get() {
            return Ok(*handle);
        }
        slot.get_or_try_init(|| self.load(key, device)).copied()
    }

    fn slot(&self, key: &CompiledKernelKey, device: u32) -> Result<Slot> {
        let lookup = (key.clone(), device);
        if let Some(slot) = self.slots.read().map_err(poisoned)?.get(&lookup) {
            return Ok(slot.clone());
        }
        let mut slots = self.slots.write().map_err(poisoned)?;
        Ok(slots.entry(lookup).or_default().clone())
    }

    fn load(&self, key: &CompiledKernelKey, device: u32) -> Result<KernelHandle> {
        debug!(
            kernel = key.name(),
            device,
            image_bytes = key.image().len(),
            "loading kernel module"
        );
        let module = self.driver.load_module(device, key.image())?;
        let function = self.driver.get_function(module, key.name())?;

        let mut dynamic_shared_limit = None;
        if key.shared_mem() > DEFAULT_SHARED_MEMORY_LIMIT {
            let optin = self
                .driver
                .device_attribute(device, DeviceAttribute::MaxSharedMemoryPerBlockOptin)?;
            if i64::from(optin) >= i64::from(key.shared_mem()) {
                let shared_static = self
                    .driver
                    .function_attribute(function, FunctionAttribute::SharedSizeBytes)?;
                let limit = optin - shared_static;
                self.driver.set_function_attribute(
                    function,
                    FunctionAttribute::MaxDynamicSharedSizeBytes,
                    limit,
                )?;
                info!(
                    kernel = key.name(),
                    device,
                    limit,
                    "raised dynamic shared memory limit"
                );
                dynamic_shared_limit = Some(limit);
            } else {
                warn!(
                    kernel = key.name(),
                    device,
                    required = key.shared_mem(),
                    available = optin,
                    "device cannot opt in to the declared shared memory"
                );
            }
        }

        Ok(KernelHandle {
            module,
            function,
            device,
            shared_mem: key.shared_mem(),
            dynamic_shared_limit,
        })
    }
}

impl fmt::Debug for KernelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCache")
            .field("loaded", &self.len())
            .finish_non_exhaustive()
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> Error {
    Error::LockPoisoned(format!("kernel cache: {e}"))
}
