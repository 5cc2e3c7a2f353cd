#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::backends::yolo::{decode_rows, ClassLabels};
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Tract-based YOLO backend for ONNX inference.
///
/// Frames are resized to the network input, fed as a normalized NCHW
/// tensor, and every output tensor is decoded as YOLO rows whose width is
/// the tensor's last dimension.
pub struct TractYoloBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    labels: ClassLabels,
    width: u32,
    height: u32,
}

impl TractYoloBackend {
    /// Load an ONNX model and its class names from disk.
    pub fn new(model_path: &Path, labels_path: &Path, width: u32, height: u32) -> Result<Self> {
        let labels = ClassLabels::from_path(labels_path)?;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "loaded ONNX model {} ({}x{} input, {} classes)",
            model_path.display(),
            width,
            height,
            labels.len()
        );
        Ok(Self {
            model,
            labels,
            width,
            height,
        })
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let resized = image::imageops::resize(
            frame.image(),
            self.width,
            self.height,
            image::imageops::FilterType::Triangle,
        );
        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        )
        .into_tensor()
    }
}

impl DetectorBackend for TractYoloBackend {
    fn name(&self) -> &'static str {
        "yolo"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        if outputs.is_empty() {
            return Err(anyhow!("model produced no outputs"));
        }

        let mut detections = Vec::new();
        for output in outputs.iter() {
            let stride = output.shape().last().copied().unwrap_or(0);
            let view = output
                .to_array_view::<f32>()
                .context("model output tensor was not f32")?;
            let data: Vec<f32> = view.iter().copied().collect();
            detections.extend(decode_rows(
                &data,
                stride,
                frame.width(),
                frame.height(),
                &self.labels,
            )?);
        }
        Ok(detections)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::from_image(image::RgbImage::new(self.width, self.height), 0);
        self.detect(&blank).map(|_| ())
    }
}
