//! Compiled kernels and the JSON manifest describing them.
//!
//! The kernel compiler writes one binary per kernel together with a manifest
//! entry recording its entry point, shared memory use, warp count and
//! parameter signature:
//!
//! ```json
//! {
//!   "kernels": [
//!     {
//!       "name": "add_kernel",
//!       "binary": "add_kernel.cubin",
//!       "shared_mem": 0,
//!       "num_warps": 4,
//!       "num_stages": 3,
//!       "constants": {"BLOCK_SIZE": 1024},
//!       "signature": [
//!         {"name": "x_ptr", "type": "*fp32"},
//!         {"name": "y_ptr", "type": "*fp32"},
//!         {"name": "output_ptr", "type": "*fp32"},
//!         {"name": "n_elements", "type": "i32"},
//!         {"name": "BLOCK_SIZE", "type": null}
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    cache::CompiledKernelKey, launch::MAX_NUM_WARPS, signature::KernelSignature, value::Value,
    Error, Result,
};

/// A kernel produced by the kernel compiler, ready to hand to the launcher.
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    pub name: String,
    pub key: CompiledKernelKey,
    pub signature: KernelSignature,
    pub num_warps: u32,
    pub num_stages: Option<u32>,
    /// Constexpr values the kernel was compiled with. Used for declared
    /// names a launch leaves unbound.
    pub constants: IndexMap<String, Value>,
}

impl CompiledKernel {
    pub fn new(
        name: impl Into<String>,
        entry: &str,
        image: impl Into<Arc<[u8]>>,
        shared_mem: u32,
        num_warps: u32,
        signature: KernelSignature,
    ) -> Self {
        Self {
            name: name.into(),
            key: CompiledKernelKey::new(entry, image, shared_mem),
            signature,
            num_warps,
            num_stages: None,
            constants: IndexMap::new(),
        }
    }

    pub fn with_num_stages(mut self, num_stages: u32) -> Self {
        self.num_stages = Some(num_stages);
        self
    }

    pub fn with_constant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constants.insert(name.into(), value.into());
        self
    }
}

fn constant_value(value: &serde_json::Value) -> Option<Value> {
    match value {
        serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .or_else(|| n.as_f64().map(Value::Float)),
        serde_json::Value::String(s) => Some(Value::Str(s.clone())),
        _ => None,
    }
}

fn default_num_warps() -> u32 {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelEntry {
    pub name: String,
    /// Symbol inside the binary; defaults to `name`.
    #[serde(default)]
    pub entry: Option<String>,
    pub binary: PathBuf,
    #[serde(default)]
    pub shared_mem: u32,
    #[serde(default = "default_num_warps")]
    pub num_warps: u32,
    #[serde(default)]
    pub num_stages: Option<u32>,
    #[serde(default)]
    pub constants: IndexMap<String, serde_json::Value>,
    pub signature: KernelSignature,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelManifest {
    pub kernels: Vec<KernelEntry>,
    /// Directory binaries are resolved against; the manifest's own directory when loaded from disk.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl KernelManifest {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut manifest: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        manifest.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_json(json: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut manifest: Self = serde_json::from_str(json)?;
        manifest.base_dir = base_dir.into();
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for entry in &self.kernels {
            if !seen.insert(entry.name.as_str()) {
                return Err(Error::Manifest(format!(
                    "kernel `{}` is listed more than once",
                    entry.name
                )));
            }
            if !(1..=MAX_NUM_WARPS).contains(&entry.num_warps) {
                return Err(Error::Manifest(format!(
                    "kernel `{}` declares {} warps, expected 1..={MAX_NUM_WARPS}",
                    entry.name, entry.num_warps
                )));
            }
            if let Some((name, _)) = entry
                .constants
                .iter()
                .find(|(_, v)| constant_value(v).is_none())
            {
                return Err(Error::Manifest(format!(
                    "constant `{name}` of kernel `{}` is not a scalar",
                    entry.name
                )));
            }
        }
        Ok(())
    }

    /// Read every binary and build the kernel set.
    pub fn load_kernels(&self) -> Result<KernelSet> {
        let mut set = KernelSet::default();
        for entry in &self.kernels {
            let path = self.base_dir.join(&entry.binary);
            let image = fs::read(&path).map_err(|e| {
                Error::Manifest(format!(
                    "cannot read binary `{}` of kernel `{}`: {e}",
                    path.display(),
                    entry.name
                ))
            })?;
            debug!(kernel = %entry.name, path = %path.display(), bytes = image.len(), "read kernel binary");
            let mut kernel = CompiledKernel::new(
                entry.name.clone(),
                entry.entry.as_deref().unwrap_or(&entry.name),
                image,
                entry.shared_mem,
                entry.num_warps,
                entry.signature.clone(),
            );
            kernel.num_stages = entry.num_stages;
            kernel.constants = entry
                .constants
                .iter()
                .filter_map(|(k, v)| Some((k.clone(), constant_value(v)?)))
                .collect();
            set.insert(kernel);
        }
        Ok(set)
    }
}

/// Compiled kernels by name.
#[derive(Debug, Clone, Default)]
pub struct KernelSet {
    kernels: HashMap<String, Arc<CompiledKernel>>,
}

impl KernelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kernel: CompiledKernel) -> Option<Arc<CompiledKernel>> {
        self.kernels.insert(kernel.name.clone(), Arc::new(kernel))
    }

    pub fn get(&self, name: &str) -> Result<Arc<CompiledKernel>> {
        self.kernels
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownKernel(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kernels.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

impl FromIterator<CompiledKernel> for KernelSet {
    fn from_iter<I: IntoIterator<Item = CompiledKernel>>(iter: I) -> Self {
        let mut set = Self::new();
        for kernel in iter {
            set.insert(kernel);
        }
        set
    }
}
