use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;
use crate::error::PipelineError;
use crate::tiling::{StitchStrategy, DEFAULT_PAD_MULTIPLE};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "GLACIER_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub output_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    /// Only complete windows are run, so with `overlap = 0` a `tile_size`
    /// that does not divide the padded extent leaves an uncovered strip.
    /// The default equals `pad_multiple`, which always divides it.
    pub tile_size: usize,
    pub overlap: usize,
    pub pad_multiple: usize,
    pub stitch: StitchStrategy,
    pub workers: usize,
    pub backend: InferenceBackend,
    pub device_id: i32,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            output_dir: PathBuf::from("outputs"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_PAD_MULTIPLE,
            overlap: 0,
            pad_multiple: DEFAULT_PAD_MULTIPLE,
            stitch: StitchStrategy::Overwrite,
            workers: 1,
            backend: InferenceBackend::Cuda,
            device_id: 0,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = toml::from_str(&raw).map_err(|e| {
            PipelineError::config(format!(
                "failed to parse config TOML {}: {e}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let inference = &self.inference;
        if inference.tile_size == 0 || inference.pad_multiple == 0 {
            return Err(PipelineError::config(
                "inference.tile_size and inference.pad_multiple must be positive",
            )
            .into());
        }
        if inference.overlap >= inference.tile_size {
            return Err(PipelineError::config(format!(
                "inference.overlap ({}) must be smaller than inference.tile_size ({})",
                inference.overlap, inference.tile_size
            ))
            .into());
        }
        Ok(())
    }
}

/// Parse a structured document, JSON when the extension says so, TOML otherwise.
/// Any parse failure is a [`PipelineError::Configuration`].
pub fn parse_document<T: DeserializeOwned>(path: &Path, raw: &str) -> Result<T> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let parsed = if is_json {
        serde_json::from_str(raw).map_err(|e| e.to_string())
    } else {
        toml::from_str(raw).map_err(|e| e.to_string())
    };

    parsed.map_err(|e| {
        PipelineError::config(format!("failed to parse {}: {e}", path.display())).into()
    })
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. GLACIER_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml, leaving an existing
/// config untouched.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
