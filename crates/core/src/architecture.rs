use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::parse_document;
use crate::error::PipelineError;

/// Segmentation network families a checkpoint can be exported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    Unet,
    UnetDropout,
}

#[derive(Debug, Clone, Copy)]
pub struct ArchitectureEntry {
    pub architecture: Architecture,
    pub name: &'static str,
    pub description: &'static str,
    pub supports_dropout: bool,
}

const REGISTRY: &[ArchitectureEntry] = &[
    ArchitectureEntry {
        architecture: Architecture::Unet,
        name: "Unet",
        description: "encoder/decoder U-Net with skip connections",
        supports_dropout: false,
    },
    ArchitectureEntry {
        architecture: Architecture::UnetDropout,
        name: "UnetDropout",
        description: "U-Net with dropout after each decoder block",
        supports_dropout: true,
    },
];

pub fn registry() -> &'static [ArchitectureEntry] {
    REGISTRY
}

pub fn known_names() -> Vec<&'static str> {
    REGISTRY.iter().map(|entry| entry.name).collect()
}

impl Architecture {
    pub fn resolve(name: &str) -> Result<Self> {
        REGISTRY
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.architecture)
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "unknown architecture '{name}', expected one of: {}",
                    known_names().join(", ")
                ))
                .into()
            })
    }

    pub fn entry(self) -> &'static ArchitectureEntry {
        // Every variant has exactly one registry row.
        match self {
            Self::Unet => &REGISTRY[0],
            Self::UnetDropout => &REGISTRY[1],
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry().name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainConfig {
    pub model_opts: ModelOpts,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelOpts {
    pub name: String,
    pub args: ModelArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelArgs {
    pub inchannels: usize,
    pub outchannels: usize,
    #[serde(default = "default_net_depth")]
    pub net_depth: usize,
    #[serde(default)]
    pub dropout: Option<f32>,
}

fn default_net_depth() -> usize {
    4
}

/// A training configuration whose architecture name has been checked
/// against the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub architecture: Architecture,
    pub in_channels: usize,
    pub out_channels: usize,
    pub net_depth: usize,
    pub dropout: Option<f32>,
}

impl TrainConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!(
                "failed to read training config {}: {e}",
                path.display()
            ))
        })?;
        parse_document(path, &raw)
    }

    pub fn model_spec(&self) -> Result<ModelSpec> {
        let architecture = Architecture::resolve(&self.model_opts.name)?;
        let args = &self.model_opts.args;

        if args.inchannels == 0 || args.outchannels == 0 {
            return Err(PipelineError::config(
                "model_opts.args.inchannels and outchannels must be positive",
            )
            .into());
        }
        if args.dropout.is_some() && !architecture.entry().supports_dropout {
            tracing::warn!(
                architecture = %architecture,
                "dropout is set but the architecture does not use it"
            );
        }

        Ok(ModelSpec {
            architecture,
            in_channels: args.inchannels,
            out_channels: args.outchannels,
            net_depth: args.net_depth,
            dropout: args.dropout,
        })
    }
}

impl ModelSpec {
    /// Check that the preprocessing produces the channel count the network was trained on.
    pub fn check_input_channels(&self, preprocessed: usize) -> Result<()> {
        if preprocessed != self.in_channels {
            return Err(PipelineError::shape(
                "preprocessed channel count",
                self.in_channels,
                preprocessed,
            )
            .into());
        }
        Ok(())
    }
}
