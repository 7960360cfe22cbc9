//! Pipeline error taxonomy.
//!
//! Stage-level failures are typed so the pipeline owner can tell a dropped frame
//! from a dead camera. Application-layer code (config, binaries) wraps these in
//! `anyhow` like everything else.

use thiserror::Error;

use crate::frame::PixelFormat;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The camera stream stalled or disconnected. Retried with backoff.
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// Capture kept failing after the configured number of reconnect attempts.
    #[error("capture failed after {attempts} consecutive attempts: {last}")]
    CaptureRetriesExhausted { attempts: u32, last: String },

    /// The frame cannot be converted into a model tensor. The frame is dropped.
    #[error("unsupported frame format {format:?}: {reason}")]
    UnsupportedFrameFormat { format: PixelFormat, reason: String },

    /// Model artifact or label set missing or malformed. Fatal before the loop starts.
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// A single inference call failed. The frame is dropped.
    #[error("inference failed: {0}")]
    Inference(String),

    /// Too many inference failures in a row; the engine is considered broken.
    #[error("inference failed {consecutive} times in a row: {last}")]
    InferenceFailuresExceeded { consecutive: u32, last: String },

    /// A stage could not be set up, or its thread panicked.
    #[error("pipeline stage '{stage}' failed: {reason}")]
    Stage { stage: &'static str, reason: String },
}

impl PipelineError {
    pub fn unsupported(format: PixelFormat, reason: impl Into<String>) -> Self {
        Self::UnsupportedFrameFormat {
            format,
            reason: reason.into(),
        }
    }

    /// Per-frame errors the pipeline absorbs without stopping.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CaptureUnavailable(_) | Self::UnsupportedFrameFormat { .. } | Self::Inference(_)
        )
    }
}
