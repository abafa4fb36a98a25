//! Failure classes of an inference run.
//!
//! Core functions return [`anyhow::Result`]; the variants below are raised
//! through it so that the CLI (and tests) can classify a failure with
//! `error.downcast_ref::<PipelineError>()`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or missing preprocessing / training / app configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A tile, preprocessed tile, or model output violates the (T, T, K) contract.
    #[error("shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("raster I/O error for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// Requested accelerator unavailable. Reported, then the session falls back to CPU.
    #[error("device unavailable: {0}")]
    Device(String),
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn shape(
        what: impl Into<String>,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: impl Into<anyhow::Error>) -> Self {
        Self::Io {
            path: path.into(),
            source: source.into(),
        }
    }
}
