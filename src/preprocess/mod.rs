//! Frame → tensor preparation.
//!
//! Conversion order is fixed: pixel format to RGB24, optional region of
//! interest, bilinear resize to the model's declared input size, value
//! normalization, then layout. Every step is plain `f32` arithmetic over
//! precomputed taps, so identical frames produce bit-identical tensors.

mod color;
mod resize;

use serde::Deserialize;

use crate::error::PipelineError;
use crate::frame::Frame;
use crate::tensor::{Tensor, TensorShape};

pub use resize::Roi;
use resize::SampleGrid;

/// How 8-bit channel values are mapped into the model's input range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Normalization {
    /// `[0, 1]`
    #[default]
    Unit,
    /// `[-1, 1]`
    Signed,
    /// `[0, 255]`, for models that normalize internally.
    Raw,
    /// `(v / 255 - mean[c]) / std[c]`
    MeanStd { mean: [f32; 3], std: [f32; 3] },
}

impl Normalization {
    fn validate(&self) -> Result<(), String> {
        if let Self::MeanStd { std, .. } = self {
            if std.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
                return Err("normalization std must be positive".to_string());
            }
        }
        Ok(())
    }

    fn apply(&self, value: f32, channel: usize) -> f32 {
        match self {
            Self::Unit => value / 255.0,
            Self::Signed => value / 127.5 - 1.0,
            Self::Raw => value,
            Self::MeanStd { mean, std } => (value / 255.0 - mean[channel]) / std[channel],
        }
    }
}

/// Preprocessing options independent of the model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub normalization: Normalization,
    /// Normalized crop applied before resizing.
    pub roi: Option<Roi>,
}

/// Converts frames into tensors matching one model input shape.
pub struct Preprocessor {
    shape: TensorShape,
    normalization: Normalization,
    roi: Option<Roi>,
    grid: Option<SampleGrid>,
}

impl Preprocessor {
    pub fn new(
        shape: TensorShape,
        normalization: Normalization,
        roi: Option<Roi>,
    ) -> Result<Self, PipelineError> {
        if !matches!(shape.channels, 1 | 3) || shape.width == 0 || shape.height == 0 {
            return Err(PipelineError::ModelLoad(format!(
                "model input {} is not a 1- or 3-channel image",
                shape
            )));
        }
        normalization.validate().map_err(PipelineError::ModelLoad)?;
        if let Some(roi) = &roi {
            roi.validate().map_err(PipelineError::ModelLoad)?;
        }
        Ok(Self {
            shape,
            normalization,
            roi,
            grid: None,
        })
    }

    pub fn from_config(shape: TensorShape, config: &PreprocessConfig) -> Result<Self, PipelineError> {
        Self::new(shape, config.normalization, config.roi)
    }

    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    /// Consume a frame and produce a tensor of exactly `self.shape()`.
    pub fn prepare(&mut self, frame: Frame) -> Result<Tensor, PipelineError> {
        let sequence = frame.sequence;
        let format = frame.format;
        let rgb = color::to_rgb(&frame)?;

        let stale = self
            .grid
            .as_ref()
            .map_or(true, |grid| !grid.matches(rgb.width, rgb.height));
        if stale {
            log::debug!(
                "preprocess: building sample grid {}x{} -> {}",
                rgb.width,
                rgb.height,
                self.shape
            );
            self.grid = Some(SampleGrid::new(
                rgb.width,
                rgb.height,
                self.roi,
                self.shape.width,
                self.shape.height,
            ));
        }
        let Some(grid) = self.grid.as_ref() else {
            return Err(PipelineError::unsupported(format, "no sample grid"));
        };

        let shape = self.shape;
        let mut data = vec![0f32; shape.element_count()];
        for y in 0..shape.height {
            for x in 0..shape.width {
                let [r, g, b] = grid.sample(&rgb.data, x, y);
                if shape.channels == 1 {
                    let luma = 0.299 * r + 0.587 * g + 0.114 * b;
                    data[shape.offset(0, y, x)] = self.normalization.apply(luma, 0);
                } else {
                    for (c, v) in [r, g, b].into_iter().enumerate() {
                        data[shape.offset(c, y, x)] = self.normalization.apply(v, c);
                    }
                }
            }
        }

        Tensor::new(shape, sequence, data)
            .ok_or_else(|| PipelineError::unsupported(format, "tensor size mismatch"))
    }
}
