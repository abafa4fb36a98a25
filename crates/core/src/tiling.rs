//! Pad → window → stitch: the geometry of tiled inference.
//!
//! All arrays are `(H, W, C)`. Tiles are indexed `(i, j)` in row-major order,
//! tile `(0, 0)` sitting at the top-left of the padded raster.

use std::str::FromStr;

use anyhow::{bail, Result};
use ndarray::{s, Array2, Array3, ArrayView3, Zip};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;

/// Padded height/width are rounded up to a multiple of this.
pub const DEFAULT_PAD_MULTIPLE: usize = 512;

/// Smallest multiple of `multiple` that is `>= size`.
pub fn next_multiple(size: usize, multiple: usize) -> usize {
    size.div_ceil(multiple) * multiple
}

/// Zero-pad the bottom and right edges so both spatial dimensions are
/// multiples of `multiple`. Channels are left alone.
pub fn pad_to_valid(img: ArrayView3<f32>, multiple: usize) -> Array3<f32> {
    let (h, w, c) = img.dim();
    let padded_h = next_multiple(h, multiple);
    let padded_w = next_multiple(w, multiple);

    let mut padded = Array3::<f32>::zeros((padded_h, padded_w, c));
    padded.slice_mut(s![..h, ..w, ..]).assign(&img);
    padded
}

/// Keep the top-left `height x width` region.
///
/// When `img` is smaller than the requested extent (tiles that never reached
/// the far edge) the missing area is left as zeros.
pub fn crop(img: ArrayView3<f32>, height: usize, width: usize) -> Array3<f32> {
    let (h, w, c) = img.dim();
    if h >= height && w >= width {
        return img.slice(s![..height, ..width, ..]).to_owned();
    }

    let mut out = Array3::<f32>::zeros((height, width, c));
    let (keep_h, keep_w) = (h.min(height), w.min(width));
    out.slice_mut(s![..keep_h, ..keep_w, ..])
        .assign(&img.slice(s![..keep_h, ..keep_w, ..]));
    out
}

/// Grid geometry for sliding-window extraction over a padded raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLayout {
    pub tile_height: usize,
    pub tile_width: usize,
    pub overlap: usize,
    pub rows: usize,
    pub cols: usize,
}

impl TileLayout {
    /// Number of complete windows of `tile_size` with step `tile_size - overlap`
    /// along each axis. A tile larger than a padded dimension is clamped to it.
    pub fn new(
        padded_height: usize,
        padded_width: usize,
        tile_size: usize,
        overlap: usize,
    ) -> Result<Self> {
        if padded_height == 0 || padded_width == 0 {
            bail!(PipelineError::shape(
                "padded raster",
                "non-empty extent",
                (padded_height, padded_width)
            ));
        }
        if tile_size == 0 {
            bail!(PipelineError::config("tile_size must be positive"));
        }

        let tile_height = tile_size.min(padded_height);
        let tile_width = tile_size.min(padded_width);
        if overlap >= tile_height || overlap >= tile_width {
            bail!(PipelineError::config(format!(
                "overlap ({overlap}) must be smaller than the tile ({tile_height}x{tile_width})"
            )));
        }
        if tile_height < tile_size || tile_width < tile_size {
            debug!(
                tile_size,
                tile_height, tile_width, "Tile size clamped to padded raster"
            );
        }

        let rows = (padded_height - tile_height) / (tile_height - overlap) + 1;
        let cols = (padded_width - tile_width) / (tile_width - overlap) + 1;

        Ok(Self {
            tile_height,
            tile_width,
            overlap,
            rows,
            cols,
        })
    }

    pub fn step(&self) -> (usize, usize) {
        (
            self.tile_height - self.overlap,
            self.tile_width - self.overlap,
        )
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top-left pixel of tile `(i, j)`.
    pub fn origin(&self, i: usize, j: usize) -> (usize, usize) {
        let (step_h, step_w) = self.step();
        (i * step_h, j * step_w)
    }

    /// Row-major `(i, j)` of the `index`-th tile.
    pub fn position(&self, index: usize) -> (usize, usize) {
        (index / self.cols, index % self.cols)
    }

    /// Extent reached by the last row/column of tiles.
    pub fn covered_extent(&self) -> (usize, usize) {
        let (y, x) = self.origin(self.rows - 1, self.cols - 1);
        (y + self.tile_height, x + self.tile_width)
    }

    /// Shape of the stitched canvas, `(I*T, J*T)`.
    pub fn stitched_extent(&self) -> (usize, usize) {
        (self.rows * self.tile_height, self.cols * self.tile_width)
    }
}

/// Row-major grid of equally shaped tiles.
#[derive(Debug, Clone)]
pub struct TileGrid {
    layout: TileLayout,
    tiles: Vec<Array3<f32>>,
}

impl TileGrid {
    /// Assemble a grid from tiles already in row-major order, checking that every
    /// tile matches the layout and they all share one channel count.
    pub fn from_tiles(layout: TileLayout, tiles: Vec<Array3<f32>>) -> Result<Self> {
        if tiles.len() != layout.len() {
            bail!(PipelineError::shape(
                "tile grid",
                format!("{} tiles", layout.len()),
                format!("{} tiles", tiles.len())
            ));
        }

        let channels = tiles.first().map_or(0, |t| t.shape()[2]);
        for (index, tile) in tiles.iter().enumerate() {
            let expected = (layout.tile_height, layout.tile_width, channels);
            if tile.dim() != expected {
                bail!(PipelineError::shape(
                    format!("tile {:?}", layout.position(index)),
                    expected,
                    tile.dim()
                ));
            }
        }

        Ok(Self { layout, tiles })
    }

    pub fn layout(&self) -> &TileLayout {
        &self.layout
    }

    pub fn channels(&self) -> usize {
        self.tiles.first().map_or(0, |t| t.shape()[2])
    }

    pub fn get(&self, i: usize, j: usize) -> Option<&Array3<f32>> {
        if i >= self.layout.rows || j >= self.layout.cols {
            return None;
        }
        self.tiles.get(i * self.layout.cols + j)
    }

    pub fn tiles(&self) -> &[Array3<f32>] {
        &self.tiles
    }

    pub fn into_tiles(self) -> Vec<Array3<f32>> {
        self.tiles
    }
}

/// Slice a padded raster into overlapping windows.
pub fn window(padded: ArrayView3<f32>, tile_size: usize, overlap: usize) -> Result<TileGrid> {
    let (h, w, _) = padded.dim();
    let layout = TileLayout::new(h, w, tile_size, overlap)?;

    let tiles = (0..layout.len())
        .map(|index| {
            let (i, j) = layout.position(index);
            let (y, x) = layout.origin(i, j);
            padded
                .slice(s![y..y + layout.tile_height, x..x + layout.tile_width, ..])
                .to_owned()
        })
        .collect();

    debug!(
        rows = layout.rows,
        cols = layout.cols,
        tile_height = layout.tile_height,
        tile_width = layout.tile_width,
        overlap,
        "Windowed raster"
    );

    TileGrid::from_tiles(layout, tiles)
}

/// How overlapping tiles are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StitchStrategy {
    /// Later tiles (row-major) overwrite earlier ones in the overlap band.
    #[default]
    Overwrite,
    /// Mean over every tile covering the pixel.
    #[serde(alias = "mean")]
    Average,
    /// Element-wise maximum over every tile covering the pixel.
    Max,
}

impl StitchStrategy {
    pub const NAMES: [&'static str; 3] = ["overwrite", "average", "max"];
}

impl FromStr for StitchStrategy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "average" | "mean" => Ok(Self::Average),
            "max" => Ok(Self::Max),
            other => Err(PipelineError::config(format!(
                "unknown stitch strategy '{other}' (expected one of: {})",
                Self::NAMES.join(", ")
            ))),
        }
    }
}

impl std::fmt::Display for StitchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overwrite => write!(f, "overwrite"),
            Self::Average => write!(f, "average"),
            Self::Max => write!(f, "max"),
        }
    }
}

/// Reassemble a tile grid into one `(I*T, J*T, K)` raster.
pub fn stitch(grid: &TileGrid, strategy: StitchStrategy) -> Array3<f32> {
    let layout = grid.layout();
    let (out_h, out_w) = layout.stitched_extent();
    let (th, tw) = (layout.tile_height, layout.tile_width);
    let mut canvas = Array3::<f32>::zeros((out_h, out_w, grid.channels()));

    match strategy {
        StitchStrategy::Overwrite => {
            for (index, tile) in grid.tiles().iter().enumerate() {
                let (i, j) = layout.position(index);
                let (y, x) = layout.origin(i, j);
                canvas.slice_mut(s![y..y + th, x..x + tw, ..]).assign(tile);
            }
        }
        StitchStrategy::Average => {
            let mut coverage = Array2::<f32>::zeros((out_h, out_w));
            for (index, tile) in grid.tiles().iter().enumerate() {
                let (i, j) = layout.position(index);
                let (y, x) = layout.origin(i, j);
                let mut region = canvas.slice_mut(s![y..y + th, x..x + tw, ..]);
                region += tile;
                coverage.slice_mut(s![y..y + th, x..x + tw]).map_inplace(|n| *n += 1.0);
            }
            for ((r, c, _), value) in canvas.indexed_iter_mut() {
                let n = coverage[[r, c]];
                if n > 1.0 {
                    *value /= n;
                }
            }
        }
        StitchStrategy::Max => {
            let mut written = Array2::<bool>::from_elem((out_h, out_w), false);
            for (index, tile) in grid.tiles().iter().enumerate() {
                let (i, j) = layout.position(index);
                let (y, x) = layout.origin(i, j);
                let seen = written.slice(s![y..y + th, x..x + tw]).to_owned();
                Zip::indexed(canvas.slice_mut(s![y..y + th, x..x + tw, ..]))
                    .and(tile)
                    .for_each(|(r, c, _), out, &v| {
                        *out = if seen[[r, c]] { out.max(v) } else { v };
                    });
                written.slice_mut(s![y..y + th, x..x + tw]).fill(true);
            }
        }
    }

    canvas
}
