//! The segmentation network boundary.
//!
//! A [`SegmentationModel`] maps one preprocessed tile `(T, T, C')` to raw
//! per-class logits `(T, T, K)`. The engine applies [`sigmoid`] afterwards.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array3, Array4, ArrayD, ArrayView3, Axis, Ix4};
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use crate::backend::{build_session, ExecutionContext, SessionConfig};
use crate::error::PipelineError;

pub trait SegmentationModel: Send {
    fn predict(&mut self, tile: ArrayView3<f32>) -> Result<Array3<f32>>;
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn sigmoid_in_place(values: &mut Array3<f32>) {
    values.mapv_inplace(sigmoid);
}

/// An exported network executed through ONNX Runtime.
pub struct OnnxSegmentationModel {
    session: Session,
    model_path: PathBuf,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    out_channels: Option<usize>,
}

impl OnnxSegmentationModel {
    /// `out_channels`, when known from the training config, is enforced on every prediction.
    pub fn load(
        model_path: &Path,
        context: &ExecutionContext,
        tile_extent: Option<(usize, usize)>,
        out_channels: Option<usize>,
    ) -> Result<Self> {
        info!(
            model = %model_path.display(),
            backend = %context.backend,
            device_id = context.device_id,
            "Loading ONNX segmentation model"
        );

        let session = build_session(&SessionConfig {
            model_path,
            context,
            input_extent: tile_extent,
        })?;

        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .ok_or_else(|| PipelineError::config("model declares no inputs"))?;
        let output_name = session
            .outputs()
            .first()
            .map(|output| output.name().to_string())
            .ok_or_else(|| PipelineError::config("model declares no outputs"))?;
        let is_fp16 = match session.inputs()[0].dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        debug!(%input_name, %output_name, is_fp16, "Detected model IO");

        Ok(Self {
            session,
            model_path: model_path.to_path_buf(),
            input_name,
            output_name,
            is_fp16,
            out_channels,
        })
    }

    pub fn is_fp16(&self) -> bool {
        self.is_fp16
    }

    fn run_f32(&mut self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let input_tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(output_view.to_owned())
    }

    fn run_f16(&mut self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let shape = input.shape().to_vec();
        let f32_data = input.into_raw_vec_and_offset().0;
        let mut fp16_data = vec![f16::ZERO; f32_data.len()];
        fp16_data.convert_from_f32_slice(&f32_data);

        let input_tensor = Tensor::from_array(ArrayD::from_shape_vec(shape, fp16_data)?)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;

        let fp16_owned = output_view.as_standard_layout().into_owned();
        let fp16_slice = fp16_owned
            .as_slice()
            .context("fp16 output is not contiguous")?;
        let mut f32_out = vec![0.0f32; fp16_slice.len()];
        fp16_slice.convert_to_f32_slice(&mut f32_out);
        Ok(ArrayD::from_shape_vec(fp16_owned.shape().to_vec(), f32_out)?)
    }
}

impl SegmentationModel for OnnxSegmentationModel {
    fn predict(&mut self, tile: ArrayView3<f32>) -> Result<Array3<f32>> {
        let (h, w, _) = tile.dim();
        let nchw = tile_to_nchw(tile);

        let raw = if self.is_fp16 {
            self.run_f16(nchw)
        } else {
            self.run_f32(nchw)
        }
        .with_context(|| format!("inference failed for {}", self.model_path.display()))?;

        let logits = nchw_to_tile(raw)?;
        let (oh, ow, k) = logits.dim();
        let k_ok = self.out_channels.map_or(true, |expected| expected == k);
        if oh != h || ow != w || !k_ok {
            let expected_k = self.out_channels.unwrap_or(k);
            return Err(PipelineError::shape("model output", (h, w, expected_k), (oh, ow, k)).into());
        }
        Ok(logits)
    }
}

/// `(T, T, C)` → `(1, C, T, T)`, contiguous.
pub fn tile_to_nchw(tile: ArrayView3<f32>) -> Array4<f32> {
    tile.permuted_axes([2, 0, 1])
        .insert_axis(Axis(0))
        .as_standard_layout()
        .into_owned()
}

/// `(1, K, T, T)` → `(T, T, K)`.
pub fn nchw_to_tile(output: ArrayD<f32>) -> Result<Array3<f32>> {
    let shape = output.shape().to_vec();
    let batch = output
        .into_dimensionality::<Ix4>()
        .map_err(|_| PipelineError::shape("model output rank", "(1, K, T, T)", &shape))?;
    if batch.len_of(Axis(0)) != 1 {
        return Err(PipelineError::shape("model output batch", 1, batch.len_of(Axis(0))).into());
    }
    Ok(batch
        .index_axis_move(Axis(0), 0)
        .permuted_axes([1, 2, 0])
        .as_standard_layout()
        .into_owned())
}
