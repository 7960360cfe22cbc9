//! Inference engine and model backends.
//!
//! The engine is the only owner of a loaded model. Backends are capabilities
//! behind `InferenceBackend`; `BackendRegistry` picks one by name so the rest of
//! the pipeline never binds to a specific runtime.

mod backend;
pub mod backends;
mod engine;
mod labels;
mod prediction;
mod registry;

use std::path::PathBuf;

use crate::error::PipelineError;
use crate::tensor::{TensorLayout, TensorShape};

pub use backend::{InferenceBackend, ModelInfo};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use engine::{InferenceEngine, OutputActivation};
pub use labels::LabelSet;
pub use prediction::{ClassScore, Prediction, PROBABILITY_TOLERANCE};
pub use registry::{BackendFactory, BackendRegistry};

/// Label file looked up beside the model when no explicit path is configured.
pub const DEFAULT_LABELS_FILE: &str = "labels.txt";

/// Model selection and loading options.
#[derive(Clone, Debug)]
pub struct ModelConfig {
    /// Registry name of the backend (`stub`, `tract`, ...).
    pub backend: String,
    /// Model artifact. Required by artifact-backed backends.
    pub path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    /// Inline labels; take precedence over any label file.
    pub labels: Option<Vec<String>>,
    /// Input size used by the stub backend and for models with symbolic input dims.
    pub input_width: usize,
    pub input_height: usize,
    pub input_layout: TensorLayout,
    pub activation: OutputActivation,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: "stub".to_string(),
            path: None,
            labels_path: None,
            labels: None,
            input_width: 224,
            input_height: 224,
            input_layout: TensorLayout::Nchw,
            activation: OutputActivation::Auto,
        }
    }
}

impl ModelConfig {
    pub fn fallback_input(&self) -> TensorShape {
        match self.input_layout {
            TensorLayout::Nchw => TensorShape::nchw(3, self.input_height, self.input_width),
            TensorLayout::Nhwc => TensorShape::nhwc(self.input_height, self.input_width, 3),
        }
    }

    /// Where the label file is expected: the explicit path, else `labels.txt`
    /// next to the model.
    pub fn labels_location(&self) -> Option<PathBuf> {
        self.labels_path.clone().or_else(|| {
            self.path
                .as_ref()
                .map(|model| model.with_file_name(DEFAULT_LABELS_FILE))
        })
    }

    pub fn load_labels(&self) -> Result<LabelSet, PipelineError> {
        if let Some(labels) = &self.labels {
            return LabelSet::new(labels);
        }
        match self.labels_location() {
            Some(path) => LabelSet::from_file(&path),
            None => Err(PipelineError::ModelLoad(
                "no label set configured (set labels or labels_path)".to_string(),
            )),
        }
    }
}
