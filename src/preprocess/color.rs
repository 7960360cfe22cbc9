use std::borrow::Cow;

use crate::error::PipelineError;
use crate::frame::{Frame, PixelFormat};

/// Packed RGB24 view of a frame.
pub(crate) struct RgbImage<'a> {
    pub width: u32,
    pub height: u32,
    pub data: Cow<'a, [u8]>,
}

pub(crate) fn to_rgb(frame: &Frame) -> Result<RgbImage<'_>, PipelineError> {
    let format = frame.format;
    let (width, height) = (frame.width, frame.height);
    let pixels = frame.pixels();

    if format == PixelFormat::Mjpeg {
        return decode_jpeg(pixels, width, height);
    }

    let expected = format.expected_len(width, height).ok_or_else(|| {
        PipelineError::unsupported(
            format,
            format!("no converter for {}x{} frames", width, height),
        )
    })?;
    if pixels.len() != expected {
        return Err(PipelineError::unsupported(
            format,
            format!(
                "frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ),
        ));
    }
    if width == 0 || height == 0 {
        return Err(PipelineError::unsupported(format, "empty frame"));
    }

    let data = match format {
        PixelFormat::Rgb24 => Cow::Borrowed(pixels),
        PixelFormat::Bgr24 => Cow::Owned(swizzle(pixels, 3, [2, 1, 0])),
        PixelFormat::Rgba32 => Cow::Owned(swizzle(pixels, 4, [0, 1, 2])),
        PixelFormat::Bgra32 => Cow::Owned(swizzle(pixels, 4, [2, 1, 0])),
        PixelFormat::Gray8 => Cow::Owned(pixels.iter().flat_map(|&g| [g, g, g]).collect()),
        PixelFormat::Nv12 => Cow::Owned(semi_planar_to_rgb(pixels, width, height, false)),
        PixelFormat::Nv21 => Cow::Owned(semi_planar_to_rgb(pixels, width, height, true)),
        PixelFormat::Yuyv => Cow::Owned(yuyv_to_rgb(pixels, width, height)),
        PixelFormat::Mjpeg | PixelFormat::Other(_) => {
            return Err(PipelineError::unsupported(format, "no converter"))
        }
    };

    Ok(RgbImage {
        width,
        height,
        data,
    })
}

fn swizzle(pixels: &[u8], stride: usize, order: [usize; 3]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(pixels.len() / stride * 3);
    for px in pixels.chunks_exact(stride) {
        rgb.extend_from_slice(&[px[order[0]], px[order[1]], px[order[2]]]);
    }
    rgb
}

fn semi_planar_to_rgb(pixels: &[u8], width: u32, height: u32, vu_order: bool) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w * h;

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i];
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let (u, v) = if vu_order {
                (pixels[uv_index + 1], pixels[uv_index])
            } else {
                (pixels[uv_index], pixels[uv_index + 1])
            };
            let offset = (j * w + i) * 3;
            rgb[offset..offset + 3].copy_from_slice(&yuv_to_rgb(y, u, v));
        }
    }
    rgb
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixel_count = width as usize * height as usize;
    let mut rgb = Vec::with_capacity(pixel_count * 3);
    for quad in pixels.chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    rgb
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    let r = y + 1.402_f32 * v;
    let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
    let b = y + 1.772_f32 * u;

    [clamp_to_u8(r), clamp_to_u8(g), clamp_to_u8(b)]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(feature = "mjpeg")]
fn decode_jpeg(pixels: &[u8], _width: u32, _height: u32) -> Result<RgbImage<'static>, PipelineError> {
    let decoded = image::load_from_memory_with_format(pixels, image::ImageFormat::Jpeg)
        .map_err(|e| PipelineError::unsupported(PixelFormat::Mjpeg, format!("jpeg decode: {}", e)))?
        .to_rgb8();
    let (width, height) = decoded.dimensions();
    Ok(RgbImage {
        width,
        height,
        data: Cow::Owned(decoded.into_raw()),
    })
}

#[cfg(not(feature = "mjpeg"))]
fn decode_jpeg(_pixels: &[u8], _width: u32, _height: u32) -> Result<RgbImage<'static>, PipelineError> {
    Err(PipelineError::unsupported(
        PixelFormat::Mjpeg,
        "MJPEG frames require the mjpeg feature",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> Vec<u8> {
        let frame = Frame::new(data, width, height, format, 1);
        to_rgb(&frame).expect("convert").data.into_owned()
    }

    #[test]
    fn nv12_conversion_produces_gray() {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        assert_eq!(convert(PixelFormat::Nv12, 2, 2, nv12), vec![128u8; 12]);
    }

    #[test]
    fn yuyv_neutral_chroma_is_gray() {
        let yuyv = vec![200, 128, 50, 128];
        assert_eq!(
            convert(PixelFormat::Yuyv, 2, 1, yuyv),
            vec![200, 200, 200, 50, 50, 50]
        );
    }

    #[test]
    fn bgr_and_bgra_are_swizzled() {
        assert_eq!(convert(PixelFormat::Bgr24, 1, 1, vec![1, 2, 3]), vec![3, 2, 1]);
        assert_eq!(
            convert(PixelFormat::Bgra32, 1, 1, vec![1, 2, 3, 255]),
            vec![3, 2, 1]
        );
        assert_eq!(
            convert(PixelFormat::Rgba32, 1, 1, vec![1, 2, 3, 255]),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn rgb_pass_through_borrows() {
        let frame = Frame::new(vec![1u8; 9], 1, 3, PixelFormat::Rgb24, 1);
        let rgb = to_rgb(&frame).expect("rgb");
        assert!(matches!(rgb.data, Cow::Borrowed(_)));
    }

    #[test]
    fn length_mismatch_is_unsupported() {
        let frame = Frame::new(vec![1u8; 8], 1, 3, PixelFormat::Rgb24, 1);
        let err = to_rgb(&frame).err().expect("must fail");
        assert!(matches!(err, PipelineError::UnsupportedFrameFormat { .. }));
    }

    #[test]
    fn unknown_fourcc_is_unsupported() {
        let frame = Frame::new(vec![0u8; 16], 2, 2, PixelFormat::Other(*b"H264"), 1);
        assert!(to_rgb(&frame).is_err());
    }
}
