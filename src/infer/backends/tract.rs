#![cfg(feature = "backend-tract")]

use std::path::Path;

use sha2::{Digest, Sha256};
use tract_onnx::prelude::*;

use crate::error::PipelineError;
use crate::infer::backend::{InferenceBackend, ModelInfo};
use crate::infer::ModelConfig;
use crate::tensor::{Tensor as FrameTensor, TensorShape};

/// Tract-based backend for ONNX classifiers.
///
/// Input shape and output size are read from the model's own declared facts.
/// The configured input size is used only when the model leaves its spatial
/// dimensions symbolic. The model file is read once, at construction.
pub struct TractBackend {
    plan: TypedRunnableModel<TypedModel>,
    input_type: DatumType,
    output_scale: f32,
    info: ModelInfo,
}

impl TractBackend {
    pub fn from_config(config: &ModelConfig) -> Result<Self, PipelineError> {
        let path = config.path.as_deref().ok_or_else(|| {
            PipelineError::ModelLoad("tract backend requires a model path".to_string())
        })?;
        Self::load(path, config.fallback_input())
    }

    /// Load an ONNX model from disk and prepare it for inference.
    pub fn load(model_path: &Path, fallback: TensorShape) -> Result<Self, PipelineError> {
        let load_err = |what: &str, e: &dyn std::fmt::Display| {
            PipelineError::ModelLoad(format!("{} {}: {}", what, model_path.display(), e))
        };

        let bytes = std::fs::read(model_path).map_err(|e| load_err("failed to read", &e))?;
        let digest = hex::encode(Sha256::digest(&bytes));

        let model = tract_onnx::onnx()
            .model_for_read(&mut bytes.as_slice())
            .map_err(|e| load_err("failed to parse ONNX model", &e))?;

        let typed = match model.clone().into_optimized() {
            Ok(typed) if declared_input(&typed).is_some() => typed,
            _ => {
                log::info!(
                    "model {} has no concrete input shape, using {}",
                    model_path.display(),
                    fallback
                );
                let [n, a, b, c] = fallback.dims();
                model
                    .with_input_fact(
                        0,
                        InferenceFact::dt_shape(f32::datum_type(), tvec!(n, a, b, c)),
                    )
                    .map_err(|e| load_err("failed to set input fact for", &e))?
                    .into_optimized()
                    .map_err(|e| load_err("failed to optimize", &e))?
            }
        };

        let input = declared_input(&typed).ok_or_else(|| {
            PipelineError::ModelLoad(format!(
                "{}: input is not a batch-1 image tensor",
                model_path.display()
            ))
        })?;
        let input_type = typed
            .input_fact(0)
            .map_err(|e| load_err("failed to read input fact of", &e))?
            .datum_type;
        let output_fact = typed
            .output_fact(0)
            .map_err(|e| load_err("failed to read output fact of", &e))?;
        let output_type = output_fact.datum_type;
        let label_count: usize = output_fact
            .shape
            .as_concrete()
            .ok_or_else(|| {
                PipelineError::ModelLoad(format!(
                    "{}: output shape is not concrete",
                    model_path.display()
                ))
            })?
            .iter()
            .product();

        let output_scale = if output_type == u8::datum_type() {
            1.0 / 255.0
        } else {
            1.0
        };
        let quantized = !input_type.is_float() || !output_type.is_float();

        let plan = typed
            .into_runnable()
            .map_err(|e| load_err("failed to build runnable model from", &e))?;

        let name = model_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| model_path.display().to_string());

        Ok(Self {
            plan,
            input_type,
            output_scale,
            info: ModelInfo {
                name,
                input,
                label_count,
                digest: Some(digest),
                quantization_tolerance: if quantized { 1.0 / 255.0 } else { 0.0 },
            },
        })
    }
}

fn declared_input(model: &TypedModel) -> Option<TensorShape> {
    let fact = model.input_fact(0).ok()?;
    TensorShape::from_dims(fact.shape.as_concrete()?)
}

impl InferenceBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn run(&mut self, input: &FrameTensor) -> Result<Vec<f32>, PipelineError> {
        let infer_err =
            |what: &str, e: &dyn std::fmt::Display| PipelineError::Inference(format!("{}: {}", what, e));

        let dims = input.shape().dims();
        let mut tensor = Tensor::from_shape::<f32>(&dims, input.as_slice())
            .map_err(|e| infer_err("failed to build input tensor", &e))?;
        if self.input_type != f32::datum_type() {
            tensor = tensor
                .cast_to_dt(self.input_type)
                .map_err(|e| infer_err("failed to cast input tensor", &e))?
                .into_owned();
        }

        let outputs = self
            .plan
            .run(tvec!(tensor.into()))
            .map_err(|e| infer_err("ONNX inference failed", &e))?;
        let output = outputs
            .first()
            .ok_or_else(|| PipelineError::Inference("model produced no outputs".to_string()))?;
        let scores = output
            .cast_to::<f32>()
            .map_err(|e| infer_err("model output is not numeric", &e))?;
        let scores = scores
            .as_slice::<f32>()
            .map_err(|e| infer_err("model output is not contiguous", &e))?;

        Ok(scores.iter().map(|v| v * self.output_scale).collect())
    }
}
