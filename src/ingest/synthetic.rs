//! Synthetic frame source (`stub://`).
//!
//! Renders a dim horizontal gradient with one bright stripe. Every
//! `SCENE_HOLD_FRAMES` frames the stripe moves down a quarter of the frame and
//! switches colour, so a classifier sees a scene that holds long enough to
//! become stable and then changes. Output is fully determined by the config
//! (noise included, via the seed).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;

use super::{health_grace, FrameSource, SourceConfig, SourceStats};
use crate::error::PipelineError;
use crate::frame::{Frame, PixelFormat};

/// Frames each synthetic scene is held for.
pub const SCENE_HOLD_FRAMES: u64 = 30;

pub struct SyntheticSource {
    config: SourceConfig,
    rng: StdRng,
    connected: bool,
    sequence: u64,
    connects: u64,
    next_due: Option<Instant>,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Result<Self, PipelineError> {
        let format = config.pixel_format;
        let encodable = match format {
            PixelFormat::Mjpeg => cfg!(feature = "mjpeg"),
            PixelFormat::Other(_) => false,
            _ => format.expected_len(config.width, config.height).is_some(),
        };
        if !encodable || config.width == 0 || config.height == 0 {
            return Err(PipelineError::Stage {
                stage: "source",
                reason: format!(
                    "synthetic source cannot render {:?} at {}x{}",
                    format, config.width, config.height
                ),
            });
        }
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            connected: false,
            sequence: 0,
            connects: 0,
            next_due: None,
            last_frame_at: None,
        })
    }

    /// Scene index for a sequence number.
    pub fn scene_of(sequence: u64) -> u64 {
        sequence.saturating_sub(1) / SCENE_HOLD_FRAMES
    }

    fn pace(&mut self) {
        if !self.config.realtime {
            return;
        }
        let interval = self.config.frame_interval();
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        // Never try to catch up on frames missed while the consumer was slow.
        self.next_due = Some(due.max(now) + interval);
    }

    fn render_rgb(&mut self, sequence: u64) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let scene = Self::scene_of(sequence);
        let stripe_rows = (height / 4).max(1);
        let stripe_top = (scene as usize % 4) * height / 4;
        let channel = (scene % 3) as usize;

        let mut rgb = vec![0u8; width * height * 3];
        for y in 0..height {
            let in_stripe = (y + height - stripe_top) % height < stripe_rows;
            for x in 0..width {
                let base = 24 + (x * 40 / width.max(1)) as u8;
                let px = &mut rgb[(y * width + x) * 3..][..3];
                px.fill(base);
                if in_stripe {
                    px.fill(64);
                    px[channel] = 230;
                }
            }
        }

        let amplitude = self.config.noise as i16;
        if amplitude > 0 {
            for value in rgb.iter_mut() {
                let delta = self.rng.gen_range(-amplitude..=amplitude);
                *value = (*value as i16 + delta).clamp(0, 255) as u8;
            }
        }
        rgb
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.config.uri
    }

    /// Synthetic sources are always "connected".
    fn connect(&mut self) -> Result<(), PipelineError> {
        self.connected = true;
        self.connects += 1;
        self.next_due = None;
        log::info!(
            "SyntheticSource: connected to {} ({}x{} {:?} @ {} fps)",
            self.config.uri,
            self.config.width,
            self.config.height,
            self.config.pixel_format,
            self.config.target_fps
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        if !self.connected {
            return Err(PipelineError::CaptureUnavailable(format!(
                "{} is not connected",
                self.config.uri
            )));
        }
        if let Some(limit) = self.config.max_frames {
            if self.sequence >= limit {
                return Ok(None);
            }
        }

        self.pace();
        self.sequence += 1;
        let rgb = self.render_rgb(self.sequence);
        let (width, height) = (self.config.width, self.config.height);
        let format = self.config.pixel_format;
        let data = encode(rgb, width, height, format)?;
        self.last_frame_at = Some(Instant::now());

        Ok(Some(Frame::new(data, width, height, format, self.sequence)))
    }

    fn disconnect(&mut self) {
        if self.connected {
            log::info!("SyntheticSource: disconnected from {}", self.config.uri);
        }
        self.connected = false;
    }

    fn is_healthy(&self) -> bool {
        if !self.connected {
            return false;
        }
        match self.last_frame_at {
            Some(at) => at.elapsed() <= health_grace(self.config.target_fps),
            None => true,
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.sequence,
            connects: self.connects,
            last_error: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Encoding from packed RGB
// ----------------------------------------------------------------------------

fn encode(rgb: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Result<Vec<u8>, PipelineError> {
    let out = match format {
        PixelFormat::Rgb24 => rgb,
        PixelFormat::Bgr24 => rgb.chunks_exact(3).flat_map(|p| [p[2], p[1], p[0]]).collect(),
        PixelFormat::Rgba32 => rgb
            .chunks_exact(3)
            .flat_map(|p| [p[0], p[1], p[2], 255])
            .collect(),
        PixelFormat::Bgra32 => rgb
            .chunks_exact(3)
            .flat_map(|p| [p[2], p[1], p[0], 255])
            .collect(),
        PixelFormat::Gray8 => rgb.chunks_exact(3).map(luma).collect(),
        PixelFormat::Nv12 => semi_planar(&rgb, width as usize, height as usize, false),
        PixelFormat::Nv21 => semi_planar(&rgb, width as usize, height as usize, true),
        PixelFormat::Yuyv => yuyv(&rgb),
        PixelFormat::Mjpeg => jpeg(&rgb, width, height)?,
        PixelFormat::Other(_) => {
            return Err(PipelineError::unsupported(format, "synthetic source cannot encode"))
        }
    };
    Ok(out)
}

fn luma(p: &[u8]) -> u8 {
    clamp_u8(0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
}

fn chroma(p: &[u8]) -> (u8, u8) {
    let (r, g, b) = (p[0] as f32, p[1] as f32, p[2] as f32);
    let u = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let v = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (clamp_u8(u), clamp_u8(v))
}

fn clamp_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

fn semi_planar(rgb: &[u8], width: usize, height: usize, vu_order: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(width * height * 3 / 2);
    out.extend(rgb.chunks_exact(3).map(luma));
    for y in (0..height).step_by(2) {
        for x in (0..width).step_by(2) {
            // Chroma sampled from the top-left pixel of each 2x2 block.
            let (u, v) = chroma(&rgb[(y * width + x) * 3..][..3]);
            if vu_order {
                out.extend_from_slice(&[v, u]);
            } else {
                out.extend_from_slice(&[u, v]);
            }
        }
    }
    out
}

fn yuyv(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks_exact(6)
        .flat_map(|pair| {
            let (u, v) = chroma(&pair[..3]);
            [luma(&pair[..3]), u, luma(&pair[3..]), v]
        })
        .collect()
}

#[cfg(feature = "mjpeg")]
fn jpeg(rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>, PipelineError> {
    use image::codecs::jpeg::JpegEncoder;
    use image::ExtendedColorType;

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 90)
        .encode(rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| PipelineError::Stage {
            stage: "source",
            reason: format!("jpeg encode: {}", e),
        })?;
    Ok(out)
}

#[cfg(not(feature = "mjpeg"))]
fn jpeg(_rgb: &[u8], _width: u32, _height: u32) -> Result<Vec<u8>, PipelineError> {
    Err(PipelineError::unsupported(
        PixelFormat::Mjpeg,
        "MJPEG frames require the mjpeg feature",
    ))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
