use crate::error::PipelineError;
use crate::infer::backend::{InferenceBackend, ModelInfo};
use crate::infer::ModelConfig;
use crate::tensor::{Tensor, TensorShape};

/// Scale applied to band means before softmax; keeps stub outputs peaked enough
/// to exercise the aggregator.
const STUB_SHARPNESS: f32 = 8.0;

/// Stub backend for testing and demos.
///
/// Splits the tensor into one contiguous band per class and scores each class by
/// its band's mean value. Content-dependent, stateless and fully deterministic.
pub struct StubBackend {
    info: ModelInfo,
}

impl StubBackend {
    pub fn new(input: TensorShape, label_count: usize) -> Self {
        Self {
            info: ModelInfo {
                name: "stub".to_string(),
                input,
                label_count,
                digest: None,
                quantization_tolerance: 0.0,
            },
        }
    }

    pub fn from_config(config: &ModelConfig, label_count: usize) -> Self {
        Self::new(config.fallback_input(), label_count)
    }
}

impl InferenceBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn run(&mut self, input: &Tensor) -> Result<Vec<f32>, PipelineError> {
        let values = input.as_slice();
        let classes = self.info.label_count;
        if classes == 0 || values.len() < classes {
            return Err(PipelineError::Inference(format!(
                "tensor of {} values cannot feed {} classes",
                values.len(),
                classes
            )));
        }

        let band = values.len() / classes;
        let scores = (0..classes)
            .map(|class| {
                let start = class * band;
                let end = if class + 1 == classes {
                    values.len()
                } else {
                    start + band
                };
                let slice = &values[start..end];
                slice.iter().sum::<f32>() / slice.len() as f32 * STUB_SHARPNESS
            })
            .collect();
        Ok(scores)
    }
}
