//! Tiled glacier segmentation over multi-band GeoTIFF rasters.
//!
//! A raster is zero-padded, cut into overlapping windows, each window is
//! preprocessed and run through a segmentation network, and the
//! per-class probabilities are stitched back into a georeferenced mosaic.

pub mod architecture;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod geotiff;
pub mod logging;
pub mod model;
pub mod preprocess;
pub mod raster;
pub mod runtime;
pub mod tiling;

pub use engine::{infer, InferenceOptions, InferenceOutput};
pub use error::PipelineError;
