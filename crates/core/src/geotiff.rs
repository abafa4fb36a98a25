//! GeoTIFF reader/writer on top of the pure-Rust `tiff` crate.
//!
//! Only chunky (pixel-interleaved) images are supported, which is what GDAL
//! and Earth Engine exports produce by default. Any number of bands is read;
//! `tiff` reports more than one gray sample per pixel as a multiband image.
//! Georeferencing tags are carried through [`GeoMetadata`] without
//! interpretation.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use ndarray::{Array3, ArrayView3};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::raster::{
    GeoMetadata, GeoRaster, TAG_GDAL_NODATA, TAG_GEO_ASCII_PARAMS, TAG_GEO_DOUBLE_PARAMS,
    TAG_GEO_KEY_DIRECTORY, TAG_MODEL_PIXEL_SCALE, TAG_MODEL_TIEPOINT, TAG_MODEL_TRANSFORMATION,
};

/// Prediction probabilities are written as `255 * p`.
pub const OUTPUT_VALUE_SCALE: f32 = 255.0;

const PHOTOMETRIC_MIN_IS_BLACK: u16 = 1;
const COMPRESSION_NONE: u16 = 1;
const PLANAR_CHUNKY: u16 = 1;
const SAMPLE_FORMAT_IEEE_FP: u16 = 3;
const EXTRA_SAMPLE_UNSPECIFIED: u16 = 0;

fn geo_tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// Read a multi-band GeoTIFF into `(C, H, W)` f32 samples plus its georeferencing.
pub fn read_geotiff(path: &Path) -> Result<GeoRaster> {
    let raster = decode_geotiff(path).map_err(|source| PipelineError::io(path, source))?;
    info!(
        path = %path.display(),
        bands = raster.channels(),
        height = raster.height(),
        width = raster.width(),
        epsg = ?raster.meta.epsg(),
        "Loaded raster"
    );
    Ok(raster)
}

fn decode_geotiff(path: &Path) -> Result<GeoRaster> {
    let file =
        File::open(path).with_context(|| format!("failed to open raster: {}", path.display()))?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .context("failed to decode TIFF header")?
        .with_limits(Limits::unlimited());

    let (width, height) = decoder.dimensions().context("failed to read TIFF dimensions")?;
    let (width, height) = (width as usize, height as usize);
    if width == 0 || height == 0 {
        bail!("raster has empty extent {width}x{height}");
    }

    let meta = read_geo_metadata(&mut decoder);

    let samples = match decoder.read_image().context("failed to read TIFF pixel data")? {
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect::<Vec<_>>(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        _ => bail!("unsupported TIFF sample type"),
    };

    let pixels = width * height;
    if samples.len() % pixels != 0 {
        bail!(
            "decoded {} samples, not a multiple of {}x{} pixels",
            samples.len(),
            width,
            height
        );
    }
    let channels = samples.len() / pixels;
    debug!(width, height, channels, "Decoded TIFF samples");

    let hwc = Array3::from_shape_vec((height, width, channels), samples)?;
    let chw = hwc
        .permuted_axes([2, 0, 1])
        .as_standard_layout()
        .into_owned();

    Ok(GeoRaster::new(chw, meta))
}

fn read_geo_metadata<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> GeoMetadata {
    let mut find = |code: u16| decoder.find_tag(geo_tag(code)).ok().flatten();

    GeoMetadata {
        pixel_scale: find(TAG_MODEL_PIXEL_SCALE).and_then(|v| v.into_f64_vec().ok()),
        tiepoints: find(TAG_MODEL_TIEPOINT).and_then(|v| v.into_f64_vec().ok()),
        model_transformation: find(TAG_MODEL_TRANSFORMATION).and_then(|v| v.into_f64_vec().ok()),
        geo_key_directory: find(TAG_GEO_KEY_DIRECTORY).and_then(|v| v.into_u16_vec().ok()),
        geo_double_params: find(TAG_GEO_DOUBLE_PARAMS).and_then(|v| v.into_f64_vec().ok()),
        geo_ascii_params: find(TAG_GEO_ASCII_PARAMS).and_then(|v| v.into_string().ok()),
        nodata: find(TAG_GDAL_NODATA).and_then(|v| v.into_string().ok()),
    }
}

/// Write an `(H, W, K)` prediction as a K-band float32 GeoTIFF, scaled by
/// [`OUTPUT_VALUE_SCALE`], with `meta` copied onto the output unchanged.
pub fn write_geotiff(path: &Path, hwc: ArrayView3<f32>, meta: &GeoMetadata) -> Result<()> {
    encode_geotiff(path, hwc, meta).map_err(|source| PipelineError::io(path, source))?;
    info!(
        path = %path.display(),
        height = hwc.shape()[0],
        width = hwc.shape()[1],
        bands = hwc.shape()[2],
        "Wrote GeoTIFF"
    );
    Ok(())
}

fn encode_geotiff(path: &Path, hwc: ArrayView3<f32>, meta: &GeoMetadata) -> Result<()> {
    let (height, width, bands) = hwc.dim();
    if height == 0 || width == 0 || bands == 0 {
        bail!("refusing to write empty raster {height}x{width}x{bands}");
    }
    let bands_u16 = u16::try_from(bands).context("too many bands for a TIFF")?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    }

    let samples: Vec<f32> = hwc.iter().map(|v| v * OUTPUT_VALUE_SCALE).collect();

    let file = File::create(path)
        .with_context(|| format!("failed to create output file: {}", path.display()))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file))?;
    let mut dir = encoder.new_directory()?;

    let strip_offset = u32::try_from(dir.write_data(&samples[..])?)
        .map_err(|_| anyhow!("raster too large for classic TIFF"))?;
    let strip_bytes = u32::try_from(samples.len() * std::mem::size_of::<f32>())
        .map_err(|_| anyhow!("raster too large for classic TIFF"))?;

    dir.write_tag(Tag::ImageWidth, width as u32)?;
    dir.write_tag(Tag::ImageLength, height as u32)?;
    dir.write_tag(Tag::BitsPerSample, &vec![32u16; bands][..])?;
    dir.write_tag(Tag::Compression, COMPRESSION_NONE)?;
    dir.write_tag(Tag::PhotometricInterpretation, PHOTOMETRIC_MIN_IS_BLACK)?;
    dir.write_tag(Tag::StripOffsets, strip_offset)?;
    dir.write_tag(Tag::SamplesPerPixel, bands_u16)?;
    dir.write_tag(Tag::RowsPerStrip, height as u32)?;
    dir.write_tag(Tag::StripByteCounts, strip_bytes)?;
    dir.write_tag(Tag::PlanarConfiguration, PLANAR_CHUNKY)?;
    dir.write_tag(Tag::SampleFormat, &vec![SAMPLE_FORMAT_IEEE_FP; bands][..])?;
    if bands > 1 {
        dir.write_tag(Tag::ExtraSamples, &vec![EXTRA_SAMPLE_UNSPECIFIED; bands - 1][..])?;
    }

    if let Some(v) = meta.pixel_scale.as_deref() {
        dir.write_tag(geo_tag(TAG_MODEL_PIXEL_SCALE), v)?;
    }
    if let Some(v) = meta.tiepoints.as_deref() {
        dir.write_tag(geo_tag(TAG_MODEL_TIEPOINT), v)?;
    }
    if let Some(v) = meta.model_transformation.as_deref() {
        dir.write_tag(geo_tag(TAG_MODEL_TRANSFORMATION), v)?;
    }
    if let Some(v) = meta.geo_key_directory.as_deref() {
        dir.write_tag(geo_tag(TAG_GEO_KEY_DIRECTORY), v)?;
    }
    if let Some(v) = meta.geo_double_params.as_deref() {
        dir.write_tag(geo_tag(TAG_GEO_DOUBLE_PARAMS), v)?;
    }
    if let Some(v) = meta.geo_ascii_params.as_deref() {
        dir.write_tag(geo_tag(TAG_GEO_ASCII_PARAMS), v)?;
    }
    if let Some(v) = meta.nodata.as_deref() {
        dir.write_tag(geo_tag(TAG_GDAL_NODATA), v)?;
    }

    dir.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use tempfile::tempdir;

    fn utm_meta() -> GeoMetadata {
        GeoMetadata {
            pixel_scale: Some(vec![30.0, 30.0, 0.0]),
            tiepoints: Some(vec![0.0, 0.0, 0.0, 300_000.0, 3_100_000.0, 0.0]),
            geo_key_directory: Some(vec![1, 1, 0, 2, 1024, 0, 1, 1, 3072, 0, 1, 32645]),
            ..Default::default()
        }
    }

    #[test]
    fn written_geotiff_reads_back_scaled_with_same_georeferencing() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("pred.tiff");

        let hwc = Array3::from_shape_fn((5, 7, 3), |(r, c, k)| {
            (r * 7 + c) as f32 / 35.0 * (k + 1) as f32 / 3.0
        });
        write_geotiff(&path, hwc.view(), &utm_meta()).expect("write geotiff");

        let raster = read_geotiff(&path).expect("read geotiff");
        assert_eq!(raster.bands.shape(), &[3, 5, 7]);
        assert_eq!(raster.meta, utm_meta());
        assert_eq!(raster.meta.epsg(), Some(32645));

        let back = raster.to_hwc();
        for ((r, c, k), v) in hwc.indexed_iter() {
            assert!((back[[r, c, k]] - v * OUTPUT_VALUE_SCALE).abs() < 1e-4);
        }
    }

    /// Unsigned 16-bit pixel-interleaved scene, the layout of Landsat exports.
    fn write_u16_scene(path: &Path, hwc: &Array3<u16>, meta: &GeoMetadata) {
        let (height, width, bands) = hwc.dim();
        let samples: Vec<u16> = hwc.iter().copied().collect();

        let file = File::create(path).expect("create tiff");
        let mut encoder = TiffEncoder::new(BufWriter::new(file)).expect("encoder");
        let mut dir = encoder.new_directory().expect("directory");
        let offset = dir.write_data(&samples[..]).expect("strip") as u32;

        dir.write_tag(Tag::ImageWidth, width as u32).unwrap();
        dir.write_tag(Tag::ImageLength, height as u32).unwrap();
        dir.write_tag(Tag::BitsPerSample, &vec![16u16; bands][..]).unwrap();
        dir.write_tag(Tag::Compression, COMPRESSION_NONE).unwrap();
        dir.write_tag(Tag::PhotometricInterpretation, PHOTOMETRIC_MIN_IS_BLACK)
            .unwrap();
        dir.write_tag(Tag::StripOffsets, offset).unwrap();
        dir.write_tag(Tag::SamplesPerPixel, bands as u16).unwrap();
        dir.write_tag(Tag::RowsPerStrip, height as u32).unwrap();
        dir.write_tag(Tag::StripByteCounts, (samples.len() * 2) as u32)
            .unwrap();
        dir.write_tag(Tag::PlanarConfiguration, PLANAR_CHUNKY).unwrap();
        dir.write_tag(Tag::SampleFormat, &vec![1u16; bands][..]).unwrap();
        dir.write_tag(Tag::ExtraSamples, &vec![EXTRA_SAMPLE_UNSPECIFIED; bands - 1][..])
            .unwrap();
        if let Some(v) = meta.pixel_scale.as_deref() {
            dir.write_tag(geo_tag(TAG_MODEL_PIXEL_SCALE), v).unwrap();
        }
        if let Some(v) = meta.tiepoints.as_deref() {
            dir.write_tag(geo_tag(TAG_MODEL_TIEPOINT), v).unwrap();
        }
        if let Some(v) = meta.geo_key_directory.as_deref() {
            dir.write_tag(geo_tag(TAG_GEO_KEY_DIRECTORY), v).unwrap();
        }
        dir.finish().expect("finish tiff");
    }

    #[test]
    fn reads_twelve_band_u16_scene() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("LE07_scene.tif");
        let hwc = Array3::from_shape_fn((9, 11, 12), |(r, c, k)| {
            (k * 1000 + r * 11 + c) as u16
        });
        write_u16_scene(&path, &hwc, &utm_meta());

        let raster = read_geotiff(&path).expect("read multi-band scene");
        assert_eq!(raster.bands.shape(), &[12, 9, 11]);
        assert_eq!(raster.meta, utm_meta());
        assert_eq!(raster.bands[[0, 0, 0]], 0.0);
        assert_eq!(raster.bands[[5, 2, 3]], 5025.0);
        assert_eq!(raster.bands[[11, 8, 10]], 11098.0);
    }

    #[test]
    fn any_band_count_round_trips() {
        let dir = tempdir().expect("tempdir");
        for bands in 1..=13 {
            let path = dir.path().join(format!("pred-{bands}.tiff"));
            let hwc = Array3::from_shape_fn((9, 11, bands), |(r, c, k)| {
                ((r + c + k) % 5) as f32 / 4.0
            });
            write_geotiff(&path, hwc.view(), &GeoMetadata::default()).expect("write geotiff");

            let raster = read_geotiff(&path).expect("read geotiff");
            assert_eq!(raster.bands.shape(), &[bands, 9, 11], "{bands} bands");
            assert_eq!(raster.bands[[bands - 1, 8, 10]], hwc[[8, 10, bands - 1]] * 255.0);
        }
    }

    #[test]
    fn single_band_output_has_no_extra_samples() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("mask.tiff");
        let hwc = Array3::from_elem((4, 4, 1), 0.5f32);

        write_geotiff(&path, hwc.view(), &GeoMetadata::default()).expect("write geotiff");
        let raster = read_geotiff(&path).expect("read geotiff");

        assert_eq!(raster.channels(), 1);
        assert!(raster.bands.iter().all(|v| (*v - 127.5).abs() < 1e-4));
        assert!(!raster.meta.is_georeferenced());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = read_geotiff(Path::new("/definitely/not/here.tif")).expect_err("should fail");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Io { .. })
        ));
    }

    #[test]
    fn non_tiff_file_is_io_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("not-a.tif");
        fs::write(&path, b"plain text, not a tiff").expect("write file");

        let err = read_geotiff(&path).expect_err("should fail");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Io { .. })
        ));
    }
}
