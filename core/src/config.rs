//! Materialization configuration.
//!
//! Loaded from YAML or JSON and overridable from the command line.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FoldError, Result};

/// Deepest supported layer prefetch pipeline.
pub const MAX_PREFETCH_DEPTH: usize = 2;

/// What to do with device nodes, fifos and other special archive entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecialFilePolicy {
    /// Skip the entry and record a warning (default).
    #[default]
    Skip,
    /// Fail the materialization.
    Fail,
}

impl std::fmt::Display for SpecialFilePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skip => write!(f, "skip"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

impl std::str::FromStr for SpecialFilePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "fail" => Ok(Self::Fail),
            _ => Err(format!(
                "unknown special file policy: '{}' (supported: skip, fail)",
                s
            )),
        }
    }
}

/// Materialization configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializeConfig {
    /// Number of layers fetched ahead of the one being applied (0-2)
    pub prefetch_depth: usize,

    /// Concurrent blob fetches when writing a bundle
    pub bundle_concurrency: usize,

    /// Largest single archive entry accepted, in bytes
    pub max_entry_size: u64,

    /// Largest total unpacked size accepted for one layer, in bytes
    pub max_layer_unpacked_size: u64,

    /// Handling of special files (devices, fifos, sockets)
    pub special_files: SpecialFilePolicy,

    /// Process `.wh.` whiteout markers instead of writing them out
    pub apply_whiteouts: bool,

    /// Apply entry permission bits to created files and directories
    pub preserve_permissions: bool,

    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,
}

impl Default for MaterializeConfig {
    fn default() -> Self {
        Self {
            prefetch_depth: 1,
            bundle_concurrency: 4,
            max_entry_size: 4 * 1024 * 1024 * 1024,
            max_layer_unpacked_size: 32 * 1024 * 1024 * 1024,
            special_files: SpecialFilePolicy::Skip,
            apply_whiteouts: true,
            preserve_permissions: true,
            insecure_registries: Vec::new(),
        }
    }
}

impl MaterializeConfig {
    /// Load configuration from a YAML or JSON file.
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as YAML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FoldError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };

        config.validate()?;

        tracing::debug!(path = %path.display(), "Loaded materialize config");
        Ok(config)
    }

    /// Check that every setting is within its supported range.
    pub fn validate(&self) -> Result<()> {
        if self.prefetch_depth > MAX_PREFETCH_DEPTH {
            return Err(FoldError::ConfigError(format!(
                "prefetch_depth must be between 0 and {}, got {}",
                MAX_PREFETCH_DEPTH, self.prefetch_depth
            )));
        }
        if self.bundle_concurrency == 0 {
            return Err(FoldError::ConfigError(
                "bundle_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_entry_size == 0 || self.max_layer_unpacked_size == 0 {
            return Err(FoldError::ConfigError(
                "size limits must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
