use serde::Deserialize;

/// Region of interest in normalized `0..1` frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct Roi {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Roi {
    pub fn validate(&self) -> Result<(), String> {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);
        if !(in_unit(self.x) && in_unit(self.y)) {
            return Err(format!("roi origin ({}, {}) outside 0..1", self.x, self.y));
        }
        if !(self.width > 0.0 && self.height > 0.0) {
            return Err("roi must have a positive width and height".to_string());
        }
        if self.x + self.width > 1.0 + f32::EPSILON || self.y + self.height > 1.0 + f32::EPSILON {
            return Err("roi extends past the frame edge".to_string());
        }
        Ok(())
    }

    /// Pixel window `(x, y, width, height)` inside a `width x height` frame.
    /// Always at least one pixel, always inside the frame.
    pub(crate) fn to_pixels(self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let (x0, w) = axis_window(self.x, self.width, width);
        let (y0, h) = axis_window(self.y, self.height, height);
        (x0, y0, w, h)
    }
}

fn axis_window(origin: f32, extent: f32, len: u32) -> (u32, u32) {
    let start = ((origin * len as f32).floor() as u32).min(len.saturating_sub(1));
    let span = ((extent * len as f32).round() as u32).clamp(1, len - start);
    (start, span)
}

/// Precomputed bilinear taps along one axis.
struct AxisTaps {
    lo: Vec<usize>,
    hi: Vec<usize>,
    weight: Vec<f32>,
}

impl AxisTaps {
    /// Half-pixel-centre mapping of `dst_len` samples onto `src_len` source
    /// pixels starting at `src_start`.
    fn new(src_start: u32, src_len: u32, dst_len: usize) -> Self {
        let scale = src_len as f32 / dst_len as f32;
        let max = (src_len - 1) as f32;
        let mut lo = Vec::with_capacity(dst_len);
        let mut hi = Vec::with_capacity(dst_len);
        let mut weight = Vec::with_capacity(dst_len);
        for d in 0..dst_len {
            let s = ((d as f32 + 0.5) * scale - 0.5).clamp(0.0, max);
            let s0 = s.floor();
            let i0 = s0 as u32;
            let i1 = (i0 + 1).min(src_len - 1);
            lo.push((src_start + i0) as usize);
            hi.push((src_start + i1) as usize);
            weight.push(s - s0);
        }
        Self { lo, hi, weight }
    }
}

/// Cached sampling grid for one source geometry.
pub(crate) struct SampleGrid {
    key: (u32, u32),
    src_width: usize,
    xs: AxisTaps,
    ys: AxisTaps,
}

impl SampleGrid {
    pub(crate) fn new(
        src_width: u32,
        src_height: u32,
        roi: Option<Roi>,
        dst_width: usize,
        dst_height: usize,
    ) -> Self {
        let (x0, y0, w, h) = match roi {
            Some(roi) => roi.to_pixels(src_width, src_height),
            None => (0, 0, src_width, src_height),
        };
        Self {
            key: (src_width, src_height),
            src_width: src_width as usize,
            xs: AxisTaps::new(x0, w, dst_width),
            ys: AxisTaps::new(y0, h, dst_height),
        }
    }

    pub(crate) fn matches(&self, src_width: u32, src_height: u32) -> bool {
        self.key == (src_width, src_height)
    }

    /// Bilinear RGB sample at destination pixel `(dx, dy)`.
    pub(crate) fn sample(&self, rgb: &[u8], dx: usize, dy: usize) -> [f32; 3] {
        let (x0, x1, wx) = (self.xs.lo[dx], self.xs.hi[dx], self.xs.weight[dx]);
        let (y0, y1, wy) = (self.ys.lo[dy], self.ys.hi[dy], self.ys.weight[dy]);
        let at = |x: usize, y: usize, c: usize| rgb[(y * self.src_width + x) * 3 + c] as f32;

        let mut out = [0f32; 3];
        for (c, value) in out.iter_mut().enumerate() {
            let top = at(x0, y0, c) + (at(x1, y0, c) - at(x0, y0, c)) * wx;
            let bottom = at(x0, y1, c) + (at(x1, y1, c) - at(x0, y1, c)) * wx;
            *value = top + (bottom - top) * wy;
        }
        out
    }
}
