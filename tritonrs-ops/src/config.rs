use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::info;
use tritonrs_core::{Driver, KernelManifest, Runtime, StreamContext};

use crate::{Error, Result};

pub const MANIFEST_ENV: &str = "TRITONRS_MANIFEST";
pub const NAME_PREFIX_ENV: &str = "TRITONRS_NAME_PREFIX";

const DEFAULT_PREFIX: &str = "triton";

/// Names the wrappers are registered under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpNames {
    pub add: String,
    pub softmax: String,
    pub matmul: String,
    pub attn_fwd: String,
    pub attn_bwd_preprocess: String,
    pub attn_bwd: String,
}

impl OpNames {
    /// `{prefix}.add`, `{prefix}.softmax`, ...
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            add: format!("{prefix}.add"),
            softmax: format!("{prefix}.softmax"),
            matmul: format!("{prefix}.matmul"),
            attn_fwd: format!("{prefix}.attn_fwd"),
            attn_bwd_preprocess: format!("{prefix}.attn_bwd_preprocess"),
            attn_bwd: format!("{prefix}.attn_bwd"),
        }
    }
}

impl Default for OpNames {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsConfig {
    /// Kernel manifest; relative paths are resolved against the config file.
    pub manifest: PathBuf,
    #[serde(default)]
    pub names: OpNames,
}

impl OpsConfig {
    pub fn new(manifest: impl Into<PathBuf>) -> Self {
        Self {
            manifest: manifest.into(),
            names: OpNames::default(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        if config.manifest.is_relative() {
            if let Some(dir) = path.parent() {
                config.manifest = dir.join(&config.manifest);
            }
        }
        Ok(config)
    }

    /// Read `TRITONRS_MANIFEST` and, if set, `TRITONRS_NAME_PREFIX`.
    pub fn from_env() -> Result<Self> {
        let manifest = env::var_os(MANIFEST_ENV)
            .ok_or_else(|| Error::Config(format!("`{MANIFEST_ENV}` is not set")))?;
        let names = match env::var(NAME_PREFIX_ENV) {
            Ok(prefix) if !prefix.is_empty() => OpNames::with_prefix(&prefix),
            _ => OpNames::default(),
        };
        Ok(Self {
            manifest: manifest.into(),
            names,
        })
    }

    /// Load the manifest's kernels into a new runtime.
    pub fn build_runtime(
        &self,
        driver: Arc<dyn Driver>,
        streams: Arc<dyn StreamContext>,
    ) -> Result<Runtime> {
        let kernels = KernelManifest::from_path(&self.manifest)?.load_kernels()?;
        info!(
            manifest = %self.manifest.display(),
            kernels = kernels.len(),
            "loaded kernel manifest"
        );
        Ok(Runtime::new(driver, streams, kernels))
    }
}
