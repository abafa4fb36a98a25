//! End-to-end tiled inference over one raster.
//!
//! `infer` pads the raster, windows it, runs preprocessing, the model and a
//! sigmoid on every tile, then stitches the preprocessed tiles and the
//! probability tiles into two pixel-aligned mosaics cropped back to the
//! original extent. Any tile failure aborts the whole call.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use ndarray::{Array3, ArrayView3};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::model::{sigmoid_in_place, SegmentationModel};
use crate::preprocess::TilePreprocessor;
use crate::tiling::{
    crop, next_multiple, pad_to_valid, stitch, window, StitchStrategy, TileGrid, TileLayout,
    DEFAULT_PAD_MULTIPLE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceOptions {
    pub tile_size: usize,
    pub overlap: usize,
    pub pad_multiple: usize,
    pub stitch: StitchStrategy,
    /// 1 runs tiles sequentially in row-major order.
    pub workers: usize,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_PAD_MULTIPLE,
            overlap: 0,
            pad_multiple: DEFAULT_PAD_MULTIPLE,
            stitch: StitchStrategy::Overwrite,
            workers: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InferenceOutput {
    /// Preprocessed channels, `(H, W, C')`.
    pub input_mosaic: Array3<f32>,
    /// Per-class probabilities in (0, 1), `(H, W, K)`.
    pub prediction: Array3<f32>,
    pub layout: TileLayout,
}

type TileResult = (Array3<f32>, Array3<f32>);

/// Compute the padded extent and tile grid `infer` would use, without running anything.
pub fn plan(height: usize, width: usize, options: &InferenceOptions) -> Result<TileLayout> {
    if options.pad_multiple == 0 {
        return Err(PipelineError::config("pad_multiple must be positive").into());
    }
    let padded_h = next_multiple(height, options.pad_multiple);
    let padded_w = next_multiple(width, options.pad_multiple);
    TileLayout::new(padded_h, padded_w, options.tile_size, options.overlap)
}

pub fn infer(
    raw: ArrayView3<f32>,
    model: &mut dyn SegmentationModel,
    preprocessor: &dyn TilePreprocessor,
    options: &InferenceOptions,
) -> Result<InferenceOutput> {
    let (height, width, channels) = raw.dim();
    if height == 0 || width == 0 {
        return Err(
            PipelineError::shape("input raster", "non-empty extent", (height, width)).into(),
        );
    }
    if options.pad_multiple == 0 {
        return Err(PipelineError::config("pad_multiple must be positive").into());
    }

    let started = Instant::now();
    let padded = pad_to_valid(raw, options.pad_multiple);
    let grid = window(padded.view(), options.tile_size, options.overlap)?;
    let layout = *grid.layout();
    drop(padded);

    let (covered_h, covered_w) = layout.covered_extent();
    if covered_h < height || covered_w < width {
        warn!(
            covered_h,
            covered_w,
            height,
            width,
            "Tile grid does not reach the raster edge; uncovered area will be zero"
        );
    }

    info!(
        height,
        width,
        channels,
        rows = layout.rows,
        cols = layout.cols,
        tile_height = layout.tile_height,
        tile_width = layout.tile_width,
        overlap = layout.overlap,
        workers = options.workers,
        "Running tiled inference"
    );

    let tiles = grid.into_tiles();
    let results = if options.workers > 1 && tiles.len() > 1 {
        run_parallel(&layout, &tiles, model, preprocessor, options.workers)?
    } else {
        run_sequential(&layout, &tiles, model, preprocessor)?
    };
    drop(tiles);

    let (inputs, predictions): (Vec<_>, Vec<_>) = results.into_iter().unzip();
    let input_grid = TileGrid::from_tiles(layout, inputs)?;
    let prediction_grid = TileGrid::from_tiles(layout, predictions)?;

    let input_mosaic = stitch(&input_grid, options.stitch);
    let prediction = stitch(&prediction_grid, options.stitch);

    let output = InferenceOutput {
        input_mosaic: crop(input_mosaic.view(), height, width),
        prediction: crop(prediction.view(), height, width),
        layout,
    };

    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        tiles = layout.len(),
        classes = output.prediction.dim().2,
        "Tiled inference finished"
    );
    Ok(output)
}

/// Preprocess, predict and squash one tile, checking the `(T, T, _)` contract at each step.
fn process_tile(
    layout: &TileLayout,
    index: usize,
    tile: ArrayView3<f32>,
    preprocessor: &dyn TilePreprocessor,
    predict: impl FnOnce(ArrayView3<f32>) -> Result<Array3<f32>>,
) -> Result<TileResult> {
    let (i, j) = layout.position(index);
    let (th, tw) = (layout.tile_height, layout.tile_width);

    let x = preprocessor
        .process(tile)
        .with_context(|| format!("preprocessing tile ({i}, {j})"))?;
    let expected_x = (th, tw, preprocessor.output_channels());
    if x.dim() != expected_x {
        return Err(PipelineError::shape(
            format!("preprocessed tile ({i}, {j})"),
            expected_x,
            x.dim(),
        )
        .into());
    }

    let mut y = predict(x.view()).with_context(|| format!("inference on tile ({i}, {j})"))?;
    let (yh, yw, k) = y.dim();
    if yh != th || yw != tw || k == 0 {
        return Err(PipelineError::shape(
            format!("model output for tile ({i}, {j})"),
            (th, tw, "K>0"),
            y.dim(),
        )
        .into());
    }
    sigmoid_in_place(&mut y);

    debug!(i, j, classes = k, "Tile done");
    Ok((x, y))
}

fn run_sequential(
    layout: &TileLayout,
    tiles: &[Array3<f32>],
    model: &mut dyn SegmentationModel,
    preprocessor: &dyn TilePreprocessor,
) -> Result<Vec<TileResult>> {
    tiles
        .iter()
        .enumerate()
        .map(|(index, tile)| {
            process_tile(layout, index, tile.view(), preprocessor, |x| model.predict(x))
        })
        .collect()
}

/// Work-stealing over tile indices on scoped threads. Model calls are
/// serialized; preprocessing runs concurrently. The first error raises the
/// abort flag and is returned once every worker has stopped.
fn run_parallel(
    layout: &TileLayout,
    tiles: &[Array3<f32>],
    model: &mut dyn SegmentationModel,
    preprocessor: &dyn TilePreprocessor,
    workers: usize,
) -> Result<Vec<TileResult>> {
    let workers = workers.min(tiles.len());
    let next = AtomicUsize::new(0);
    let abort = AtomicBool::new(false);
    let model = Mutex::new(model);
    let slots: Mutex<Vec<Option<TileResult>>> = Mutex::new(vec![None; tiles.len()]);
    let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    thread::scope(|scope| {
        for worker in 0..workers {
            let (next, abort, model) = (&next, &abort, &model);
            let (slots, first_error) = (&slots, &first_error);
            scope.spawn(move || loop {
                if abort.load(Ordering::Acquire) {
                    break;
                }
                let index = next.fetch_add(1, Ordering::AcqRel);
                if index >= tiles.len() {
                    break;
                }

                let result = process_tile(layout, index, tiles[index].view(), preprocessor, |x| {
                    let mut guard = model
                        .lock()
                        .map_err(|_| anyhow!("model lock poisoned by a panicked worker"))?;
                    guard.predict(x)
                });

                match result {
                    Ok(done) => {
                        if let Ok(mut slots) = slots.lock() {
                            slots[index] = Some(done);
                        }
                    }
                    Err(e) => {
                        debug!(worker, index, "Worker failed; aborting");
                        abort.store(true, Ordering::Release);
                        if let Ok(mut slot) = first_error.lock() {
                            slot.get_or_insert(e);
                        }
                        break;
                    }
                }
            });
        }
    });

    let first_error = first_error
        .into_inner()
        .map_err(|_| anyhow!("error slot poisoned"))?;
    if let Some(e) = first_error {
        return Err(e);
    }

    slots
        .into_inner()
        .map_err(|_| anyhow!("result slots poisoned"))?
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| anyhow!("tile {:?} produced no result", layout.position(index)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use ndarray::{s, Array3, Axis};

    use super::*;

    /// Keeps the first `C'` channels.
    struct TakeChannels(usize);

    impl TilePreprocessor for TakeChannels {
        fn output_channels(&self) -> usize {
            self.0
        }

        fn process(&self, tile: ArrayView3<f32>) -> Result<Array3<f32>> {
            Ok(tile.slice(s![.., .., ..self.0]).to_owned())
        }
    }

    /// Logit per class = sum of input channels minus class index.
    struct SumModel {
        classes: usize,
        calls: usize,
    }

    impl SegmentationModel for SumModel {
        fn predict(&mut self, tile: ArrayView3<f32>) -> Result<Array3<f32>> {
            self.calls += 1;
            let (h, w, _) = tile.dim();
            let total = tile.sum_axis(Axis(2));
            Ok(Array3::from_shape_fn((h, w, self.classes), |(r, c, k)| {
                total[[r, c]] - k as f32
            }))
        }
    }

    struct FailingModel {
        fail_on: usize,
        calls: AtomicUsize,
    }

    impl SegmentationModel for FailingModel {
        fn predict(&mut self, tile: ArrayView3<f32>) -> Result<Array3<f32>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == self.fail_on {
                bail!("accelerator fault");
            }
            let (h, w, _) = tile.dim();
            Ok(Array3::zeros((h, w, 1)))
        }
    }

    struct WrongShapeModel;

    impl SegmentationModel for WrongShapeModel {
        fn predict(&mut self, _tile: ArrayView3<f32>) -> Result<Array3<f32>> {
            Ok(Array3::zeros((16, 16, 2)))
        }
    }

    fn raster(h: usize, w: usize, c: usize) -> Array3<f32> {
        Array3::from_shape_fn((h, w, c), |(r, col, k)| ((r * 7 + col * 3 + k) % 11) as f32 * 0.1)
    }

    fn options(tile_size: usize, overlap: usize) -> InferenceOptions {
        InferenceOptions {
            tile_size,
            overlap,
            pad_multiple: 512,
            stitch: StitchStrategy::Overwrite,
            workers: 1,
        }
    }

    #[test]
    fn output_matches_original_extent() {
        let img = raster(600, 600, 3);
        let mut model = SumModel { classes: 2, calls: 0 };
        let out = infer(img.view(), &mut model, &TakeChannels(3), &options(512, 0)).unwrap();

        assert_eq!(out.prediction.dim(), (600, 600, 2));
        assert_eq!(out.input_mosaic.dim(), (600, 600, 3));
        assert_eq!((out.layout.rows, out.layout.cols), (2, 2));
        assert_eq!(model.calls, 4);
    }

    #[test]
    fn overlapping_grid_on_800_square() {
        let img = raster(800, 800, 3);
        let mut model = SumModel { classes: 1, calls: 0 };
        let out = infer(img.view(), &mut model, &TakeChannels(2), &options(512, 64)).unwrap();

        assert_eq!(out.layout.step(), (448, 448));
        assert_eq!((out.layout.rows, out.layout.cols), (2, 2));
        assert_eq!(out.prediction.dim(), (800, 800, 1));
        assert_eq!(out.input_mosaic.dim(), (800, 800, 2));
    }

    #[test]
    fn probabilities_follow_inputs() {
        let img = Array3::<f32>::zeros((100, 120, 2));
        let mut model = SumModel { classes: 3, calls: 0 };
        let out = infer(img.view(), &mut model, &TakeChannels(2), &options(512, 0)).unwrap();

        assert_eq!(out.prediction[[5, 5, 0]], 0.5);
        assert!(out.prediction.iter().all(|&p| p > 0.0 && p < 1.0));
        assert!(out.prediction[[5, 5, 1]] < 0.5);
    }

    #[test]
    fn default_options_cover_odd_multiple_extent() {
        let img = raster(1100, 1100, 2);
        let mut model = SumModel { classes: 1, calls: 0 };
        let out =
            infer(img.view(), &mut model, &TakeChannels(2), &InferenceOptions::default()).unwrap();

        assert_eq!((out.layout.rows, out.layout.cols), (3, 3));
        assert_eq!(out.layout.stitched_extent(), (1536, 1536));
        assert!(out.prediction.iter().all(|&p| p > 0.0 && p < 1.0));
        assert_eq!(out.input_mosaic, img);
    }

    #[test]
    fn input_mosaic_reconstructs_preprocessed_raster() {
        let img = raster(700, 530, 4);
        let mut model = SumModel { classes: 1, calls: 0 };
        let out = infer(img.view(), &mut model, &TakeChannels(3), &options(512, 0)).unwrap();
        assert_eq!(out.input_mosaic, img.slice(s![.., .., ..3]).to_owned());
    }

    #[test]
    fn repeated_runs_are_identical() {
        let img = raster(600, 600, 3);
        let mut model = SumModel { classes: 2, calls: 0 };
        let opts = options(512, 64);
        let first = infer(img.view(), &mut model, &TakeChannels(3), &opts).unwrap();
        let second = infer(img.view(), &mut model, &TakeChannels(3), &opts).unwrap();
        assert_eq!(first.prediction, second.prediction);
        assert_eq!(first.input_mosaic, second.input_mosaic);
    }

    #[test]
    fn model_failure_aborts_call() {
        let img = raster(600, 600, 3);
        let mut model = FailingModel {
            fail_on: 2,
            calls: AtomicUsize::new(0),
        };
        let err = infer(img.view(), &mut model, &TakeChannels(3), &options(512, 0)).unwrap_err();
        assert!(format!("{err:#}").contains("accelerator fault"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn wrong_model_shape_is_shape_mismatch() {
        let img = raster(64, 64, 3);
        let err = infer(img.view(), &mut WrongShapeModel, &TakeChannels(3), &options(512, 0))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn parallel_matches_sequential() {
        let img = raster(1100, 900, 3);
        let mut sequential_model = SumModel { classes: 2, calls: 0 };
        let mut parallel_model = SumModel { classes: 2, calls: 0 };
        let sequential =
            infer(img.view(), &mut sequential_model, &TakeChannels(3), &options(512, 0)).unwrap();

        let mut parallel_opts = options(512, 0);
        parallel_opts.workers = 4;
        let parallel =
            infer(img.view(), &mut parallel_model, &TakeChannels(3), &parallel_opts).unwrap();

        assert_eq!(sequential.prediction, parallel.prediction);
        assert_eq!(sequential.input_mosaic, parallel.input_mosaic);
        assert_eq!(parallel_model.calls, sequential_model.calls);
    }

    #[test]
    fn parallel_failure_aborts_call() {
        let img = raster(1100, 1100, 3);
        let mut model = FailingModel {
            fail_on: 0,
            calls: AtomicUsize::new(0),
        };
        let mut opts = options(512, 0);
        opts.workers = 3;
        assert!(infer(img.view(), &mut model, &TakeChannels(3), &opts).is_err());
    }

    #[test]
    fn plan_reports_grid_without_model() {
        let layout = plan(600, 600, &options(512, 0)).unwrap();
        assert_eq!((layout.rows, layout.cols), (2, 2));

        let clamped = plan(300, 300, &options(1024, 0)).unwrap();
        assert_eq!((clamped.tile_height, clamped.tile_width), (512, 512));
        assert_eq!(clamped.len(), 1);
    }

    #[test]
    fn empty_raster_is_rejected() {
        let img = Array3::<f32>::zeros((0, 10, 3));
        let mut model = SumModel { classes: 1, calls: 0 };
        assert!(infer(img.view(), &mut model, &TakeChannels(3), &options(512, 0)).is_err());
    }
}
