//! Model input tensors.

use serde::Deserialize;
use std::sync::Arc;

/// Memory layout of a batch-1 image tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, C, H, W]`
    Nchw,
    /// `[1, H, W, C]`
    Nhwc,
}

/// Declared input shape of a model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorShape {
    pub layout: TensorLayout,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl TensorShape {
    pub fn nchw(channels: usize, height: usize, width: usize) -> Self {
        Self {
            layout: TensorLayout::Nchw,
            channels,
            height,
            width,
        }
    }

    pub fn nhwc(height: usize, width: usize, channels: usize) -> Self {
        Self {
            layout: TensorLayout::Nhwc,
            channels,
            height,
            width,
        }
    }

    /// Interpret a 4-D model input shape. Batch must be 1; the channel axis is
    /// whichever of axis 1 / axis 3 holds 1 or 3.
    pub fn from_dims(dims: &[usize]) -> Option<Self> {
        match dims {
            [1, c, h, w] if matches!(c, 1 | 3) => Some(Self::nchw(*c, *h, *w)),
            [1, h, w, c] if matches!(c, 1 | 3) => Some(Self::nhwc(*h, *w, *c)),
            _ => None,
        }
    }

    pub fn dims(&self) -> [usize; 4] {
        match self.layout {
            TensorLayout::Nchw => [1, self.channels, self.height, self.width],
            TensorLayout::Nhwc => [1, self.height, self.width, self.channels],
        }
    }

    pub fn element_count(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Flat row-major offset of element `(channel, y, x)`.
    pub fn offset(&self, channel: usize, y: usize, x: usize) -> usize {
        match self.layout {
            TensorLayout::Nchw => (channel * self.height + y) * self.width + x,
            TensorLayout::Nhwc => (y * self.width + x) * self.channels + channel,
        }
    }
}

impl std::fmt::Display for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d] = self.dims();
        write!(f, "{:?}[{}x{}x{}x{}]", self.layout, a, b, c, d)
    }
}

/// A prepared model input. Storage is private and shared read-only, so a tensor
/// can never be mutated once built.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: TensorShape,
    /// Sequence number of the frame this tensor was prepared from.
    pub sequence: u64,
    data: Arc<[f32]>,
}

impl Tensor {
    /// Build a tensor. Returns `None` when `data` does not fill `shape` exactly.
    pub fn new(shape: TensorShape, sequence: u64, data: Vec<f32>) -> Option<Self> {
        if data.len() != shape.element_count() {
            return None;
        }
        Some(Self {
            shape,
            sequence,
            data: data.into(),
        })
    }

    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}
