//! Output products of one inference run: the georeferenced prediction and
//! quick-look PNGs of the input, the preprocessed mosaic and each class.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use ndarray::{s, Array3, ArrayView3, Axis};
use tracing::info;

use crate::engine::InferenceOutput;
use crate::error::PipelineError;
use crate::geotiff::write_geotiff;
use crate::raster::GeoRaster;

pub const DEFAULT_PNG_CHANNELS: [usize; 3] = [2, 4, 5];

/// Stems of the three inputs, joined into every output file name as
/// `{prefix}_{input}-{model}-{process}.{ext}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNames {
    input: String,
    model: String,
    process: String,
}

impl OutputNames {
    pub fn new(input: &Path, model: &Path, process_conf: &Path) -> Self {
        Self {
            input: file_stem(input),
            model: file_stem(model),
            process: file_stem(process_conf),
        }
    }

    pub fn file_name(&self, prefix: &str, ext: &str) -> String {
        format!(
            "{prefix}_{}-{}-{}.{ext}",
            self.input, self.model, self.process
        )
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Min-max rescale to [0, 1]. A constant array maps to zeros.
pub fn squash(values: ArrayView3<f32>) -> Array3<f32> {
    let (min, max) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        return Array3::zeros(values.raw_dim());
    }
    values.mapv(|v| if v.is_finite() { (v - min) / range } else { 0.0 })
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Encode a squashed `(H, W, C)` array: RGB from the first three channels,
/// grayscale from the first channel when there are fewer than three.
pub fn write_png(path: &Path, values: ArrayView3<f32>) -> Result<()> {
    let (h, w, c) = values.dim();
    if c == 0 {
        return Err(PipelineError::shape("png channels", "at least 1", c).into());
    }
    let (width, height) = (w as u32, h as u32);
    let squashed = squash(values);

    let result = if c >= 3 {
        let img: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
            let px = squashed.slice(s![y as usize, x as usize, ..3]);
            Rgb([to_u8(px[0]), to_u8(px[1]), to_u8(px[2])])
        });
        img.save(path)
    } else {
        let img: GrayImage = ImageBuffer::from_fn(width, height, |x, y| {
            Luma([to_u8(squashed[[y as usize, x as usize, 0]])])
        });
        img.save(path)
    };
    result.map_err(|e| PipelineError::io(path, e))?;
    Ok(())
}

/// Pick bands of an `(H, W, C)` array by index.
pub fn select_channels(values: ArrayView3<f32>, channels: &[usize]) -> Result<Array3<f32>> {
    let available = values.dim().2;
    if let Some(&bad) = channels.iter().find(|&&c| c >= available) {
        return Err(PipelineError::shape(
            "png channel selection",
            format!("index < {available}"),
            bad,
        )
        .into());
    }
    Ok(values.select(Axis(2), channels))
}

/// Write the GeoTIFF and PNG products into `output_dir`, returning every path written.
pub fn write_outputs(
    output_dir: &Path,
    names: &OutputNames,
    raw: &GeoRaster,
    output: &InferenceOutput,
    png_channels: &[usize],
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir).map_err(|e| PipelineError::io(output_dir, e))?;
    let mut written = Vec::new();

    let geo_path = output_dir.join(names.file_name("geo", "tiff"));
    write_geotiff(&geo_path, output.prediction.view(), &raw.meta)?;
    written.push(geo_path);

    let raw_hwc = raw.to_hwc();
    let input_path = output_dir.join(names.file_name("input", "png"));
    write_png(&input_path, select_channels(raw_hwc.view(), png_channels)?.view())?;
    written.push(input_path);

    let x_path = output_dir.join(names.file_name("x", "png"));
    write_png(&x_path, output.input_mosaic.view())?;
    written.push(x_path);

    for (k, class) in output.prediction.axis_iter(Axis(2)).enumerate() {
        let path = output_dir.join(names.file_name(&format!("y_hat-prepred-{k}"), "png"));
        write_png(&path, class.insert_axis(Axis(2)))?;
        written.push(path);
    }

    info!(
        output_dir = %output_dir.display(),
        files = written.len(),
        "Wrote inference outputs"
    );
    Ok(written)
}
