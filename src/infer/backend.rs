use crate::error::PipelineError;
use crate::tensor::{Tensor, TensorShape};

/// Metadata a loaded model declares about itself.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelInfo {
    /// Artifact file name, or the backend name for synthetic models.
    pub name: String,
    pub input: TensorShape,
    /// Size of the output vector.
    pub label_count: usize,
    /// SHA-256 of the artifact bytes, hex encoded.
    pub digest: Option<String>,
    /// Largest per-class difference two runs on the same tensor may show.
    /// Zero for float models.
    pub quantization_tolerance: f32,
}

/// Model execution runtime.
///
/// A backend is created once per pipeline and owns its loaded model until it is
/// dropped. `run` must be free of hidden state: the same tensor always yields the
/// same scores (within `ModelInfo::quantization_tolerance`). Backends are not
/// required to be `Sync`; the engine never calls one concurrently.
pub trait InferenceBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn info(&self) -> &ModelInfo;

    /// Forward pass. Returns one raw score per output class; the engine turns
    /// scores into probabilities.
    fn run(&mut self, input: &Tensor) -> Result<Vec<f32>, PipelineError>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}
