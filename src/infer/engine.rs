use serde::Deserialize;
use std::time::Instant;

use crate::error::PipelineError;
use crate::infer::prediction::is_distribution;
use crate::infer::{
    BackendRegistry, InferenceBackend, LabelSet, ModelConfig, ModelInfo, Prediction,
};
use crate::tensor::Tensor;

/// How raw model scores become probabilities.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
    /// Keep scores that already form a distribution, softmax anything else.
    #[default]
    Auto,
    Softmax,
    /// Scores must already be a distribution.
    Identity,
}

impl std::str::FromStr for OutputActivation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "softmax" => Ok(Self::Softmax),
            "identity" => Ok(Self::Identity),
            other => Err(format!("unknown output activation '{}'", other)),
        }
    }
}

/// Owns one loaded model and its label set for the lifetime of a pipeline.
///
/// The engine is moved into whichever stage runs inference, so calls are
/// serialized by ownership. Dropping the engine releases the model.
pub struct InferenceEngine {
    backend: Box<dyn InferenceBackend>,
    labels: LabelSet,
    activation: OutputActivation,
    runs: u64,
}

impl InferenceEngine {
    /// Pair a loaded backend with its labels. The label count must match the
    /// model's declared output size.
    pub fn new(
        mut backend: Box<dyn InferenceBackend>,
        labels: LabelSet,
        activation: OutputActivation,
    ) -> Result<Self, PipelineError> {
        let info = backend.info();
        if info.label_count != labels.len() {
            return Err(PipelineError::ModelLoad(format!(
                "model '{}' declares {} outputs but the label set has {} entries",
                info.name,
                info.label_count,
                labels.len()
            )));
        }
        backend.warm_up()?;

        let info = backend.info();
        log::info!(
            "model loaded: backend={} name={} input={} labels={} digest={}",
            backend.name(),
            info.name,
            info.input,
            labels.len(),
            info.digest.as_deref().unwrap_or("-")
        );
        Ok(Self {
            backend,
            labels,
            activation,
            runs: 0,
        })
    }

    /// Load labels and model as configured.
    pub fn load(config: &ModelConfig, registry: &BackendRegistry) -> Result<Self, PipelineError> {
        let labels = config.load_labels()?;
        let backend = registry.create(config, &labels)?;
        Self::new(backend, labels, config.activation)
    }

    pub fn info(&self) -> &ModelInfo {
        self.backend.info()
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Run one forward pass.
    pub fn infer(&mut self, tensor: Tensor) -> Result<Prediction, PipelineError> {
        let expected = self.backend.info().input;
        if tensor.shape() != expected {
            return Err(PipelineError::Inference(format!(
                "tensor shape {} does not match model input {}",
                tensor.shape(),
                expected
            )));
        }

        let start = Instant::now();
        let scores = self.backend.run(&tensor)?;
        self.runs += 1;
        log::debug!(
            "inference seq={} took {}ms",
            tensor.sequence,
            start.elapsed().as_millis()
        );

        let probabilities = activate(self.activation, scores)?;
        Prediction::new(tensor.sequence, &self.labels, &probabilities)
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        log::info!(
            "model released: backend={} name={} runs={}",
            self.backend.name(),
            self.backend.info().name,
            self.runs
        );
    }
}

fn activate(activation: OutputActivation, scores: Vec<f32>) -> Result<Vec<f32>, PipelineError> {
    if scores.iter().any(|v| !v.is_finite()) {
        return Err(PipelineError::Inference(
            "model produced non-finite scores".to_string(),
        ));
    }
    match activation {
        OutputActivation::Softmax => Ok(softmax(&scores)),
        OutputActivation::Identity if is_distribution(&scores) => Ok(scores),
        OutputActivation::Identity => Err(PipelineError::Inference(
            "identity activation requires the model to output a distribution".to_string(),
        )),
        OutputActivation::Auto if is_distribution(&scores) => Ok(scores),
        OutputActivation::Auto => Ok(softmax(&scores)),
    }
}

fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
