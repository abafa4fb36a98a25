//! Per-tile channel preprocessing.
//!
//! A process config (TOML or JSON) describes, under `process_funs`, how a raw
//! tile becomes model input:
//!
//! ```toml
//! [process_funs]
//! fill_nan = 0.0
//!
//! [[process_funs.add_index]]
//! name = "ndsi"
//! a = 1
//! b = 4
//!
//! [process_funs.extract_channel]
//! img_channels = [0, 1, 2, 3, 4, 15]
//!
//! [process_funs.normalize]
//! stats_path = "stats.json"
//! ```
//!
//! Steps run in the order fill → derived indices → channel extraction →
//! normalization. Everything that can be checked without pixel data is
//! checked when the config is loaded.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{parse_document, resolve_relative_to};
use crate::error::PipelineError;

/// Opaque tile transform between windowing and the model.
pub trait TilePreprocessor: Send + Sync {
    /// Channel count `C'` of every processed tile.
    fn output_channels(&self) -> usize;

    /// `(T, T, C)` raw tile → `(T, T, C')` model input.
    fn process(&self, tile: ArrayView3<f32>) -> Result<Array3<f32>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessConfig {
    pub process_funs: ProcessFuns,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessFuns {
    #[serde(default)]
    pub fill_nan: Option<f32>,
    #[serde(default)]
    pub add_index: Vec<SpectralIndex>,
    pub extract_channel: ExtractChannel,
    #[serde(default)]
    pub normalize: Option<Normalize>,
}

/// Normalized difference `(x_a - x_b) / (x_a + x_b)` of two raw bands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpectralIndex {
    pub name: String,
    pub a: usize,
    pub b: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractChannel {
    pub img_channels: Vec<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Normalize {
    #[serde(default)]
    pub means: Option<Vec<f32>>,
    #[serde(default)]
    pub stds: Option<Vec<f32>>,
    /// JSON file with `means` and `stds`; relative paths resolve against the
    /// process config's directory.
    #[serde(default)]
    pub stats_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ChannelStats {
    means: Vec<f32>,
    stds: Vec<f32>,
}

impl ProcessConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!(
                "failed to read process config {}: {e}",
                path.display()
            ))
        })?;
        parse_document(path, &raw)
    }

    pub fn img_channels(&self) -> &[usize] {
        &self.process_funs.extract_channel.img_channels
    }
}

/// Ready-to-run preprocessing: fill, derive, extract, normalize.
#[derive(Debug, Clone)]
pub struct ChannelPipeline {
    fill_nan: Option<f32>,
    indices: Vec<SpectralIndex>,
    channels: Vec<usize>,
    means: Option<Vec<f32>>,
    stds: Option<Vec<f32>>,
}

impl ChannelPipeline {
    /// Validate `config` and resolve normalization statistics. `base_dir` is
    /// where relative `stats_path`s are looked up.
    pub fn from_config(config: &ProcessConfig, base_dir: &Path) -> Result<Self> {
        let funs = &config.process_funs;
        let channels = funs.extract_channel.img_channels.clone();
        if channels.is_empty() {
            bail!(PipelineError::config(
                "process_funs.extract_channel.img_channels must not be empty"
            ));
        }

        for index in &funs.add_index {
            if index.a == index.b {
                bail!(PipelineError::config(format!(
                    "index '{}' uses band {} twice",
                    index.name, index.a
                )));
            }
        }

        let (means, stds) = match &funs.normalize {
            None => (None, None),
            Some(norm) => {
                let (means, stds) = resolve_stats(norm, base_dir)?;
                if means.len() != channels.len() || stds.len() != channels.len() {
                    bail!(PipelineError::config(format!(
                        "normalize expects {} means/stds (one per img_channel), got {}/{}",
                        channels.len(),
                        means.len(),
                        stds.len()
                    )));
                }
                if let Some(pos) = stds.iter().position(|s| *s == 0.0 || !s.is_finite()) {
                    bail!(PipelineError::config(format!(
                        "normalize std for channel {} must be finite and non-zero",
                        channels[pos]
                    )));
                }
                (Some(means), Some(stds))
            }
        };

        Ok(Self {
            fill_nan: funs.fill_nan,
            indices: funs.add_index.clone(),
            channels,
            means,
            stds,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let config = ProcessConfig::load_from_path(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_config(&config, base_dir)
            .with_context(|| format!("invalid process config: {}", path.display()))
    }

    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    fn available_bands(&self, raw_bands: usize) -> usize {
        raw_bands + self.indices.len()
    }
}

fn resolve_stats(norm: &Normalize, base_dir: &Path) -> Result<(Vec<f32>, Vec<f32>)> {
    if let (Some(means), Some(stds)) = (&norm.means, &norm.stds) {
        return Ok((means.clone(), stds.clone()));
    }

    let Some(stats_path) = &norm.stats_path else {
        bail!(PipelineError::config(
            "normalize needs either means+stds or stats_path"
        ));
    };

    let stats_path = resolve_relative_to(base_dir, stats_path);
    let raw = fs::read_to_string(&stats_path).map_err(|e| {
        PipelineError::config(format!(
            "failed to read normalization stats {}: {e}",
            stats_path.display()
        ))
    })?;
    let stats: ChannelStats = serde_json::from_str(&raw).map_err(|e| {
        PipelineError::config(format!(
            "failed to parse normalization stats {}: {e}",
            stats_path.display()
        ))
    })?;
    debug!(path = %stats_path.display(), "Loaded normalization stats");
    Ok((stats.means, stats.stds))
}

fn normalized_difference(a: f32, b: f32) -> f32 {
    let sum = a + b;
    if sum == 0.0 {
        0.0
    } else {
        (a - b) / sum
    }
}

impl TilePreprocessor for ChannelPipeline {
    fn output_channels(&self) -> usize {
        self.channels.len()
    }

    fn process(&self, tile: ArrayView3<f32>) -> Result<Array3<f32>> {
        let (h, w, raw_bands) = tile.dim();

        for index in &self.indices {
            if index.a >= raw_bands || index.b >= raw_bands {
                bail!(PipelineError::shape(
                    format!("index '{}' bands", index.name),
                    format!("band < {raw_bands}"),
                    (index.a, index.b)
                ));
            }
        }
        let available = self.available_bands(raw_bands);
        if let Some(bad) = self.channels.iter().find(|c| **c >= available) {
            bail!(PipelineError::shape(
                "img_channels",
                format!("channel < {available}"),
                bad
            ));
        }

        let band = |c: usize| -> Array2<f32> {
            let mut out = tile.index_axis(Axis(2), c).to_owned();
            if let Some(fill) = self.fill_nan {
                out.mapv_inplace(|v| if v.is_nan() { fill } else { v });
            }
            out
        };

        let mut out = Array3::<f32>::zeros((h, w, self.channels.len()));
        for (k, &c) in self.channels.iter().enumerate() {
            let source = if c < raw_bands {
                band(c)
            } else {
                let index = &self.indices[c - raw_bands];
                let mut derived = band(index.a);
                Zip::from(&mut derived)
                    .and(&band(index.b))
                    .for_each(|a, &b| *a = normalized_difference(*a, b));
                derived
            };
            out.index_axis_mut(Axis(2), k).assign(&source);
        }

        if let (Some(means), Some(stds)) = (&self.means, &self.stds) {
            for (k, mut plane) in out.axis_iter_mut(Axis(2)).enumerate() {
                let (mean, std) = (means[k], stds[k]);
                plane.mapv_inplace(|v| (v - mean) / std);
            }
        }

        Ok(out)
    }
}
