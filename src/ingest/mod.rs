//! Frame ingestion sources.
//!
//! This module provides different sources for camera frames:
//! - Synthetic moving-pattern frames (`stub://<name>`, testing and demos)
//! - Directories of still images (feature: ingest-images)
//! - USB/V4L2 devices (feature: ingest-v4l2)
//!
//! Every source implements `FrameSource` and produces `Frame` instances with a
//! per-source sequence number starting at 1. The ingestion layer is responsible
//! for:
//! - Reporting the pixel format the device actually delivered
//! - Bounding every capture wait (a stalled device fails, it never hangs)
//! - Pacing synthetic and replayed input to the target frame rate
//!
//! The ingestion layer MUST NOT:
//! - Retain frames after handing them to the pipeline
//! - Convert or resize pixels (that belongs to the preprocessor)
//! - Log pixel content

#[cfg(feature = "ingest-images")]
pub mod image_dir;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use serde::Deserialize;
use std::time::Duration;

use crate::error::PipelineError;
use crate::frame::{Frame, PixelFormat};

#[cfg(feature = "ingest-images")]
pub use image_dir::ImageDirSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// A camera, or anything that behaves like one.
pub trait FrameSource: Send {
    /// Human-readable identifier (URI or device path) for logs.
    fn name(&self) -> &str;

    /// Acquire the device. Called before the first frame and again after every
    /// `CaptureUnavailable` failure.
    fn connect(&mut self) -> Result<(), PipelineError>;

    /// Capture the next frame. `Ok(None)` means the stream has ended.
    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError>;

    /// Release the device. Safe to call when not connected.
    fn disconnect(&mut self) {}

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub connects: u64,
    pub last_error: Option<String>,
}

/// Configuration for a frame source.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// `stub://<name>`, `/dev/videoN`, or a directory of images.
    pub uri: String,
    /// Target frame rate (frames per second).
    pub target_fps: u32,
    /// Requested capture width.
    pub width: u32,
    /// Requested capture height.
    pub height: u32,
    /// Requested pixel format. Devices may negotiate a different one.
    pub pixel_format: PixelFormat,
    /// End the stream after this many frames.
    pub max_frames: Option<u64>,
    /// Pace synthetic and replayed frames to `target_fps`.
    pub realtime: bool,
    /// Peak amplitude of per-pixel noise added to synthetic frames.
    pub noise: u8,
    /// Seed for synthetic noise.
    pub seed: u64,
    /// Restart image replay at the first file after the last one.
    pub looping: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            uri: "stub://camera".to_string(),
            target_fps: 30,
            width: 1280,
            height: 720,
            pixel_format: PixelFormat::Rgb24,
            max_frames: None,
            realtime: true,
            noise: 0,
            seed: 0,
            looping: false,
        }
    }
}

impl SourceConfig {
    pub fn frame_interval(&self) -> Duration {
        frame_interval(self.target_fps)
    }

    /// How long a capture may wait before the source counts as stalled.
    pub fn stall_timeout(&self, stall_frames: u32) -> Duration {
        self.frame_interval()
            .saturating_mul(stall_frames.max(1))
            .max(Duration::from_millis(1))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.uri.trim().is_empty() {
            return Err("source uri must not be empty".to_string());
        }
        if self.target_fps == 0 {
            return Err("target_fps must be greater than zero".to_string());
        }
        if self.width == 0 || self.height == 0 {
            return Err(format!(
                "capture size {}x{} must be non-zero",
                self.width, self.height
            ));
        }
        Ok(())
    }
}

/// Open the source named by `config.uri`. The source is not yet connected.
pub fn open_source(
    config: &SourceConfig,
    stall_timeout: Duration,
) -> Result<Box<dyn FrameSource>, PipelineError> {
    let uri = config.uri.trim();
    match SourceKind::classify(uri) {
        SourceKind::Synthetic => Ok(Box::new(SyntheticSource::new(config.clone())?)),
        SourceKind::Device => open_device(config, stall_timeout),
        SourceKind::ImageDir => open_image_dir(config),
        SourceKind::Unsupported => Err(source_error(format!(
            "unsupported source uri {:?} (expected stub://, /dev/video* or a directory)",
            uri
        ))),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SourceKind {
    Synthetic,
    Device,
    ImageDir,
    Unsupported,
}

impl SourceKind {
    fn classify(uri: &str) -> Self {
        if uri.starts_with("stub://") {
            Self::Synthetic
        } else if uri.starts_with("/dev/video") || uri.starts_with("v4l2://") {
            Self::Device
        } else if uri.starts_with("file://") || (!uri.is_empty() && !uri.contains("://")) {
            Self::ImageDir
        } else {
            Self::Unsupported
        }
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(
    config: &SourceConfig,
    stall_timeout: Duration,
) -> Result<Box<dyn FrameSource>, PipelineError> {
    Ok(Box::new(V4l2Source::new(config.clone(), stall_timeout)))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(
    config: &SourceConfig,
    _stall_timeout: Duration,
) -> Result<Box<dyn FrameSource>, PipelineError> {
    Err(source_error(format!(
        "{} requires the ingest-v4l2 feature",
        config.uri
    )))
}

#[cfg(feature = "ingest-images")]
fn open_image_dir(config: &SourceConfig) -> Result<Box<dyn FrameSource>, PipelineError> {
    Ok(Box::new(ImageDirSource::new(config.clone())?))
}

#[cfg(not(feature = "ingest-images"))]
fn open_image_dir(config: &SourceConfig) -> Result<Box<dyn FrameSource>, PipelineError> {
    Err(source_error(format!(
        "{} requires the ingest-images feature",
        config.uri
    )))
}

fn source_error(reason: String) -> PipelineError {
    PipelineError::Stage {
        stage: "source",
        reason,
    }
}

pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

pub(crate) fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}
