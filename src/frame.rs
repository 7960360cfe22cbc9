//! Captured frames.
//!
//! - `PixelFormat`: layout of the bytes a camera hands us.
//! - `Frame`: one captured image. Pixel bytes are private, there is no `Clone`.
//!
//! A frame is owned by exactly one stage at a time. Sources create it, the
//! handoff slot or the sequential loop moves it to the preprocessor, and the
//! preprocessor consumes it. Nothing retains frames after preparation, which keeps
//! memory flat under sustained capture.

use serde::Deserialize;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// PixelFormat
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgba32,
    Bgra32,
    Gray8,
    /// Y plane followed by interleaved U/V at quarter resolution.
    Nv12,
    /// Y plane followed by interleaved V/U at quarter resolution.
    Nv21,
    /// Packed 4:2:2, `Y0 U Y1 V` per pixel pair.
    Yuyv,
    /// One JPEG image per frame.
    Mjpeg,
    /// Anything a device reports that we have no converter for.
    #[serde(skip)]
    Other([u8; 4]),
}

impl PixelFormat {
    /// Map a V4L2-style FourCC to a format.
    pub fn from_fourcc(code: [u8; 4]) -> Self {
        match &code {
            b"RGB3" => Self::Rgb24,
            b"BGR3" => Self::Bgr24,
            b"AB24" | b"RGBA" => Self::Rgba32,
            b"AR24" | b"BGRA" => Self::Bgra32,
            b"GREY" => Self::Gray8,
            b"NV12" => Self::Nv12,
            b"NV21" => Self::Nv21,
            b"YUYV" => Self::Yuyv,
            b"MJPG" | b"JPEG" => Self::Mjpeg,
            _ => Self::Other(code),
        }
    }

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            Self::Rgb24 => *b"RGB3",
            Self::Bgr24 => *b"BGR3",
            Self::Rgba32 => *b"AB24",
            Self::Bgra32 => *b"AR24",
            Self::Gray8 => *b"GREY",
            Self::Nv12 => *b"NV12",
            Self::Nv21 => *b"NV21",
            Self::Yuyv => *b"YUYV",
            Self::Mjpeg => *b"MJPG",
            Self::Other(code) => code,
        }
    }

    /// Exact buffer length for a frame of this format, when the format is fixed-size.
    ///
    /// Returns `None` for compressed formats, unknown formats, odd dimensions on
    /// subsampled formats, and on overflow.
    pub fn expected_len(self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize).checked_mul(height as usize)?;
        match self {
            Self::Rgb24 | Self::Bgr24 => pixels.checked_mul(3),
            Self::Rgba32 | Self::Bgra32 => pixels.checked_mul(4),
            Self::Gray8 => Some(pixels),
            Self::Nv12 | Self::Nv21 => {
                if width % 2 != 0 || height % 2 != 0 {
                    return None;
                }
                pixels.checked_add(pixels / 2)
            }
            Self::Yuyv => {
                if width % 2 != 0 {
                    return None;
                }
                pixels.checked_mul(2)
            }
            Self::Mjpeg | Self::Other(_) => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured camera image.
///
/// Explicitly NOT `Clone`: a frame moves through the pipeline, it is never shared.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Monotonically increasing per source, starting at 1.
    pub sequence: u64,
    captured_at: Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            format,
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Time since capture, used for latency reporting.
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

impl std::fmt::Debug for Frame {
    // Pixel bytes stay out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}
