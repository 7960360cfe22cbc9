#![cfg(feature = "ingest-v4l2")]
//! V4L2 frame source.
//!
//! This module provides `V4l2Source` for capturing frames from local V4L2 devices.
//!
//! The V4L2 source is responsible for:
//! - Opening a local device node (e.g., /dev/video0)
//! - Requesting the configured resolution, pixel format and frame rate
//! - Reporting the format the driver actually negotiated
//! - Bounding each capture wait by the stall timeout
//!
//! The V4L2 source MUST NOT:
//! - Retain frames beyond handoff to the pipeline
//! - Convert pixels (the preprocessor owns conversion)

use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::{health_grace, FrameSource, SourceConfig, SourceStats};
use crate::error::PipelineError;
use crate::frame::{Frame, PixelFormat};

/// Driver-side buffers in the mmap ring.
const MMAP_BUFFERS: u32 = 4;

pub struct V4l2Source {
    config: SourceConfig,
    device_path: String,
    stall_timeout: Duration,
    state: Option<DeviceV4l2State>,
    sequence: u64,
    connects: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
    active_format: PixelFormat,
}

#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: SourceConfig, stall_timeout: Duration) -> Self {
        let device_path = config
            .uri
            .strip_prefix("v4l2://")
            .unwrap_or(&config.uri)
            .to_string();
        Self {
            active_width: config.width,
            active_height: config.height,
            active_format: config.pixel_format,
            config,
            device_path,
            stall_timeout,
            state: None,
            sequence: 0,
            connects: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn unavailable(&mut self, what: &str, err: impl std::fmt::Display) -> PipelineError {
        let message = format!("{} {}: {}", what, self.device_path, err);
        self.last_error = Some(message.clone());
        PipelineError::CaptureUnavailable(message)
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        &self.device_path
    }

    fn connect(&mut self) -> Result<(), PipelineError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        self.state = None;
        let mut device = v4l::Device::with_path(&self.device_path)
            .map_err(|err| self.unavailable("open v4l2 device", err))?;
        let mut format = device
            .format()
            .map_err(|err| self.unavailable("read v4l2 format of", err))?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(&self.config.pixel_format.fourcc());

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.device_path,
                    err
                );
                device
                    .format()
                    .map_err(|err| self.unavailable("read v4l2 format after set failure on", err))?
            }
        };

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.device_path,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.active_format = PixelFormat::from_fourcc(format.fourcc.repr);
        if self.active_format != self.config.pixel_format {
            log::warn!(
                "V4l2Source: {} negotiated {:?} instead of {:?}",
                self.device_path,
                self.active_format,
                self.config.pixel_format
            );
        }

        let stall_timeout = self.stall_timeout;
        let state = DeviceV4l2StateBuilder {
            device,
            stream_builder: |device| {
                let mut stream =
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, MMAP_BUFFERS)?;
                stream.set_timeout(stall_timeout);
                Ok(stream)
            },
        }
        .try_build()
        .map_err(|err: std::io::Error| self.unavailable("create v4l2 buffer stream for", err))?;
        self.state = Some(state);
        self.last_error = None;
        self.connects += 1;

        log::info!(
            "V4l2Source: connected to {} ({}x{} {:?})",
            self.device_path,
            self.active_width,
            self.active_height,
            self.active_format
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        use v4l::io::traits::CaptureStream;

        if let Some(limit) = self.config.max_frames {
            if self.sequence >= limit {
                return Ok(None);
            }
        }

        let Some(state) = self.state.as_mut() else {
            return Err(self.unavailable("capture from", "device not connected"));
        };
        let captured = state.with_mut(|fields| {
            fields.stream.next().map(|(buf, meta)| {
                let used = (meta.bytesused as usize).min(buf.len());
                // Some drivers leave bytesused at zero for uncompressed formats.
                let used = if used == 0 { buf.len() } else { used };
                buf[..used].to_vec()
            })
        });
        let data = match captured {
            Ok(data) => data,
            Err(err) => {
                // A stalled stream is unrecoverable in place; force a reconnect.
                self.state = None;
                return Err(self.unavailable("capture v4l2 frame from", err));
            }
        };

        self.sequence += 1;
        self.last_frame_at = Some(Instant::now());

        Ok(Some(Frame::new(
            data,
            self.active_width,
            self.active_height,
            self.active_format,
            self.sequence,
        )))
    }

    fn disconnect(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Source: disconnected from {}", self.device_path);
        }
    }

    fn is_healthy(&self) -> bool {
        if self.state.is_none() || self.last_error.is_some() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= health_grace(self.config.target_fps)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.sequence,
            connects: self.connects,
            last_error: self.last_error.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_device() -> V4l2Source {
        V4l2Source::new(
            SourceConfig {
                uri: "v4l2:///dev/video-does-not-exist".to_string(),
                ..SourceConfig::default()
            },
            Duration::from_millis(100),
        )
    }

    #[test]
    fn scheme_prefix_is_stripped() {
        assert_eq!(missing_device().name(), "/dev/video-does-not-exist");
    }

    #[test]
    fn missing_device_is_capture_unavailable() {
        let mut source = missing_device();
        assert!(matches!(
            source.connect(),
            Err(PipelineError::CaptureUnavailable(_))
        ));
        assert!(!source.is_healthy());
        assert!(source.stats().last_error.is_some());
    }

    #[test]
    fn capture_before_connect_is_unavailable() {
        let mut source = missing_device();
        assert!(matches!(
            source.next_frame(),
            Err(PipelineError::CaptureUnavailable(_))
        ));
    }
}
