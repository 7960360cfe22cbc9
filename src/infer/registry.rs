use std::collections::HashMap;

use crate::error::PipelineError;
use crate::infer::{InferenceBackend, LabelSet, ModelConfig};

/// Constructs a backend from model configuration. The label set is passed so
/// synthetic backends can size their output; artifact-backed ones ignore it and
/// declare their own output size.
pub type BackendFactory = Box<
    dyn Fn(&ModelConfig, &LabelSet) -> Result<Box<dyn InferenceBackend>, PipelineError>
        + Send
        + Sync,
>;

/// Named backend factories.
///
/// Holds constructors rather than instances so a model is only loaded once the
/// pipeline asks for it, and each pipeline gets its own handle.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every backend compiled into this build.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("stub", |config, labels| {
            let backend = super::backends::StubBackend::from_config(config, labels.len());
            Ok(Box::new(backend) as Box<dyn InferenceBackend>)
        });
        #[cfg(feature = "backend-tract")]
        registry.register("tract", |config, _labels| {
            let backend = super::backends::TractBackend::from_config(config)?;
            Ok(Box::new(backend) as Box<dyn InferenceBackend>)
        });
        registry
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ModelConfig, &LabelSet) -> Result<Box<dyn InferenceBackend>, PipelineError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Load the backend named by `config.backend`.
    pub fn create(
        &self,
        config: &ModelConfig,
        labels: &LabelSet,
    ) -> Result<Box<dyn InferenceBackend>, PipelineError> {
        let factory = self.factories.get(&config.backend).ok_or_else(|| {
            PipelineError::ModelLoad(format!(
                "backend '{}' not available (registered: {})",
                config.backend,
                self.list().join(", ")
            ))
        })?;
        factory(config, labels)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
