//! In-memory raster and the georeferencing that travels with it.
//!
//! Pixel data read from disk is band-major `(C, H, W)`; the tiling engine works
//! on pixel-major `(H, W, C)` arrays. [`GeoMetadata`] is never touched by
//! tiling: padding only extends the bottom/right edges, so the origin and
//! pixel size of the source stay valid for the stitched output.

use ndarray::{Array3, ArrayView3};

pub const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
pub const TAG_MODEL_TIEPOINT: u16 = 33922;
pub const TAG_MODEL_TRANSFORMATION: u16 = 34264;
pub const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
pub const TAG_GEO_DOUBLE_PARAMS: u16 = 34736;
pub const TAG_GEO_ASCII_PARAMS: u16 = 34737;
pub const TAG_GDAL_NODATA: u16 = 42113;

const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;

/// Affine pixel → world mapping in GDAL/rasterio coefficient order:
///
/// ```text
/// x = c + a * col + b * row
/// y = f + d * col + e * row
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl AffineTransform {
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.c + self.a * col + self.b * row,
            self.f + self.d * col + self.e * row,
        )
    }
}

/// GeoTIFF georeferencing tags, kept verbatim so the writer can emit exactly
/// what the reader saw.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoMetadata {
    pub pixel_scale: Option<Vec<f64>>,
    pub tiepoints: Option<Vec<f64>>,
    pub model_transformation: Option<Vec<f64>>,
    pub geo_key_directory: Option<Vec<u16>>,
    pub geo_double_params: Option<Vec<f64>>,
    pub geo_ascii_params: Option<String>,
    pub nodata: Option<String>,
}

impl GeoMetadata {
    pub fn is_georeferenced(&self) -> bool {
        self.transform().is_some()
    }

    /// Affine transform from ModelTransformation, or from the first tiepoint
    /// plus pixel scale (north-up images).
    pub fn transform(&self) -> Option<AffineTransform> {
        if let Some(m) = self.model_transformation.as_deref() {
            if m.len() >= 8 {
                return Some(AffineTransform {
                    a: m[0],
                    b: m[1],
                    c: m[3],
                    d: m[4],
                    e: m[5],
                    f: m[7],
                });
            }
        }

        let scale = self.pixel_scale.as_deref()?;
        let tie = self.tiepoints.as_deref()?;
        if scale.len() < 2 || tie.len() < 6 {
            return None;
        }

        // Tiepoint maps raster (i, j) to model (x, y).
        let (i, j, x, y) = (tie[0], tie[1], tie[3], tie[4]);
        Some(AffineTransform {
            a: scale[0],
            b: 0.0,
            c: x - i * scale[0],
            d: 0.0,
            e: -scale[1],
            f: y + j * scale[1],
        })
    }

    /// EPSG code from the GeoKey directory: projected CRS first, then geographic.
    pub fn epsg(&self) -> Option<u16> {
        let keys = self.geo_key_directory.as_deref()?;
        if keys.len() < 4 {
            return None;
        }
        let count = keys[3] as usize;
        let entries = keys.get(4..4 + count * 4)?;

        let lookup = |wanted: u16| {
            entries.chunks_exact(4).find_map(|entry| {
                // entry = [key_id, tiff_tag_location, count, value_offset];
                // location 0 means the value is stored inline.
                (entry[0] == wanted && entry[1] == 0).then_some(entry[3])
            })
        };

        lookup(PROJECTED_CS_TYPE_GEO_KEY).or_else(|| lookup(GEOGRAPHIC_TYPE_GEO_KEY))
    }
}

/// Multi-band raster as read from disk: `bands` is `(C, H, W)`.
#[derive(Debug, Clone)]
pub struct GeoRaster {
    pub bands: Array3<f32>,
    pub meta: GeoMetadata,
}

impl GeoRaster {
    pub fn new(bands: Array3<f32>, meta: GeoMetadata) -> Self {
        Self { bands, meta }
    }

    pub fn channels(&self) -> usize {
        self.bands.shape()[0]
    }

    pub fn height(&self) -> usize {
        self.bands.shape()[1]
    }

    pub fn width(&self) -> usize {
        self.bands.shape()[2]
    }

    /// Pixel-major copy, `(H, W, C)` in standard layout.
    pub fn to_hwc(&self) -> Array3<f32> {
        chw_to_hwc(self.bands.view())
    }
}

pub fn chw_to_hwc(chw: ArrayView3<f32>) -> Array3<f32> {
    chw.permuted_axes([1, 2, 0]).as_standard_layout().into_owned()
}

pub fn hwc_to_chw(hwc: ArrayView3<f32>) -> Array3<f32> {
    hwc.permuted_axes([2, 0, 1]).as_standard_layout().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn transform_from_tiepoint_and_scale() {
        let meta = GeoMetadata {
            pixel_scale: Some(vec![30.0, 30.0, 0.0]),
            tiepoints: Some(vec![0.0, 0.0, 0.0, 300_000.0, 3_100_000.0, 0.0]),
            ..Default::default()
        };

        let t = meta.transform().expect("transform");
        assert_eq!(t.a, 30.0);
        assert_eq!(t.e, -30.0);
        assert_eq!(t.apply(0.0, 0.0), (300_000.0, 3_100_000.0));
        assert_eq!(t.apply(10.0, 2.0), (300_300.0, 3_099_940.0));
    }

    #[test]
    fn transform_prefers_model_transformation() {
        let mut m = vec![0.0; 16];
        m[0] = 10.0;
        m[3] = 5.0;
        m[5] = -10.0;
        m[7] = 7.0;
        m[15] = 1.0;
        let meta = GeoMetadata {
            model_transformation: Some(m),
            pixel_scale: Some(vec![30.0, 30.0, 0.0]),
            tiepoints: Some(vec![0.0; 6]),
            ..Default::default()
        };

        let t = meta.transform().expect("transform");
        assert_eq!((t.a, t.c, t.e, t.f), (10.0, 5.0, -10.0, 7.0));
    }

    #[test]
    fn missing_tags_mean_no_transform() {
        assert!(!GeoMetadata::default().is_georeferenced());
    }

    #[test]
    fn epsg_reads_projected_key() {
        // Header (version 1.1.0, 2 keys) + GTModelType + ProjectedCSType=32645.
        let meta = GeoMetadata {
            geo_key_directory: Some(vec![1, 1, 0, 2, 1024, 0, 1, 1, 3072, 0, 1, 32645]),
            ..Default::default()
        };
        assert_eq!(meta.epsg(), Some(32645));
    }

    #[test]
    fn epsg_falls_back_to_geographic_key() {
        let meta = GeoMetadata {
            geo_key_directory: Some(vec![1, 1, 0, 1, 2048, 0, 1, 4326]),
            ..Default::default()
        };
        assert_eq!(meta.epsg(), Some(4326));
    }

    #[test]
    fn hwc_and_chw_are_inverse() {
        let chw = Array3::from_shape_fn((3, 2, 4), |(c, r, col)| (c * 100 + r * 10 + col) as f32);
        let raster = GeoRaster::new(chw.clone(), GeoMetadata::default());
        let hwc = raster.to_hwc();

        assert_eq!(hwc.shape(), &[2, 4, 3]);
        assert_eq!(hwc[[1, 3, 2]], 213.0);
        assert_eq!(hwc_to_chw(hwc.view()), chw);
    }
}
