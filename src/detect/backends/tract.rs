#![cfg(feature = "backend-tract")]

use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::metadata::ModelMetadata;
use crate::detect::postprocess::{postprocess, PostprocessParams};
use crate::detect::result::DetectionBatch;
use crate::frame::DecodedImage;

/// Tract-based backend for YOLO ONNX exports.
///
/// Loads a local model file plus its Ultralytics metadata (class names) and
/// runs inference on square RGB inputs. No network I/O; nothing is written
/// to disk.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    labels: Vec<String>,
    params: PostprocessParams,
}

impl TractBackend {
    /// Load an ONNX model and its metadata, and prepare it for inference.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        model_path: P,
        metadata_path: Q,
        input_size: u32,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let metadata = ModelMetadata::load(metadata_path)?;
        if let Some(declared) = metadata.input_size {
            if declared != input_size {
                log::warn!(
                    "model {} declares input {} but {} is configured",
                    model_path.display(),
                    declared,
                    input_size
                );
            }
        }

        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            labels: metadata.labels,
            params: PostprocessParams::default(),
        })
    }

    /// Override the default thresholds.
    pub fn with_params(mut self, params: PostprocessParams) -> Self {
        self.params = params;
        self
    }

    fn build_input(&self, image: &DecodedImage) -> Result<Tensor> {
        let resized = image.resized_square(self.input_size)?;
        let size = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn extract_output(&self, outputs: TVec<TValue>) -> Result<(Vec<f32>, usize, usize)> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        let (rows, cols) = match shape.as_slice() {
            [1, rows, cols] | [rows, cols] => (*rows, *cols),
            other => return Err(anyhow!("unexpected model output shape {:?}", other)),
        };
        Ok((view.iter().copied().collect(), rows, cols))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &DecodedImage, rotation_degrees: u32) -> Result<DetectionBatch> {
        let frame = image.rotated(rotation_degrees)?;
        let (width, height) = frame.dimensions();

        let started = Instant::now();
        let input = self.build_input(&frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let (raw, rows, cols) = self.extract_output(outputs)?;
        let detections = postprocess(
            &raw,
            rows,
            cols,
            &self.labels,
            self.input_size,
            &self.params,
            width,
            height,
        )?;
        let elapsed = started.elapsed().as_millis() as u64;
        log::debug!(
            "tract: {} detections in {} ms ({}x{})",
            detections.len(),
            elapsed,
            width,
            height
        );

        DetectionBatch::new(detections, elapsed, width, height)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = DecodedImage::filled(self.input_size, self.input_size, [0, 0, 0])?;
        self.detect(&blank, 0).map(|_| ())
    }
}
