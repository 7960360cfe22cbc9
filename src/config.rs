use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregate::AggregatorConfig;
use crate::frame::PixelFormat;
use crate::infer::{ModelConfig, OutputActivation};
use crate::ingest::SourceConfig;
use crate::pipeline::{PipelineMode, RuntimeConfig};
use crate::preprocess::{Normalization, PreprocessConfig, Roi};
use crate::tensor::TensorLayout;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    source: Option<SourceConfigFile>,
    model: Option<ModelConfigFile>,
    preprocess: Option<PreprocessConfigFile>,
    aggregator: Option<AggregatorConfigFile>,
    pipeline: Option<RuntimeConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    uri: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    pixel_format: Option<PixelFormat>,
    max_frames: Option<u64>,
    realtime: Option<bool>,
    noise: Option<u8>,
    seed: Option<u64>,
    looping: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    backend: Option<String>,
    path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    labels: Option<Vec<String>>,
    input_width: Option<usize>,
    input_height: Option<usize>,
    input_layout: Option<TensorLayout>,
    activation: Option<OutputActivation>,
}

#[derive(Debug, Deserialize, Default)]
struct PreprocessConfigFile {
    normalization: Option<Normalization>,
    roi: Option<Roi>,
}

#[derive(Debug, Deserialize, Default)]
struct AggregatorConfigFile {
    dwell_frames: Option<u32>,
    smoothing: Option<f32>,
    min_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct RuntimeConfigFile {
    mode: Option<PipelineMode>,
    stall_frames: Option<u32>,
    max_capture_retries: Option<u32>,
    capture_backoff_ms: Option<u64>,
    capture_backoff_max_ms: Option<u64>,
    max_inference_failures: Option<u32>,
    health_interval_secs: Option<u64>,
}

/// Everything needed to build a `Pipeline`.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub model: ModelConfig,
    pub preprocess: PreprocessConfig,
    pub aggregator: AggregatorConfig,
    pub runtime: RuntimeConfig,
}

impl PipelineConfig {
    /// Defaults, then the file named by `AMIGO_CONFIG` (if any), then
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("AMIGO_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit config file.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let source_defaults = SourceConfig::default();
        let source = match file.source {
            Some(src) => SourceConfig {
                uri: src.uri.unwrap_or(source_defaults.uri),
                target_fps: src.target_fps.unwrap_or(source_defaults.target_fps),
                width: src.width.unwrap_or(source_defaults.width),
                height: src.height.unwrap_or(source_defaults.height),
                pixel_format: src.pixel_format.unwrap_or(source_defaults.pixel_format),
                max_frames: src.max_frames.or(source_defaults.max_frames),
                realtime: src.realtime.unwrap_or(source_defaults.realtime),
                noise: src.noise.unwrap_or(source_defaults.noise),
                seed: src.seed.unwrap_or(source_defaults.seed),
                looping: src.looping.unwrap_or(source_defaults.looping),
            },
            None => source_defaults,
        };

        let model_defaults = ModelConfig::default();
        let model = match file.model {
            Some(m) => ModelConfig {
                backend: m.backend.unwrap_or(model_defaults.backend),
                path: m.path,
                labels_path: m.labels_path,
                labels: m.labels,
                input_width: m.input_width.unwrap_or(model_defaults.input_width),
                input_height: m.input_height.unwrap_or(model_defaults.input_height),
                input_layout: m.input_layout.unwrap_or(model_defaults.input_layout),
                activation: m.activation.unwrap_or(model_defaults.activation),
            },
            None => model_defaults,
        };

        let preprocess = file
            .preprocess
            .map(|p| PreprocessConfig {
                normalization: p.normalization.unwrap_or_default(),
                roi: p.roi,
            })
            .unwrap_or_default();

        let aggregator_defaults = AggregatorConfig::default();
        let aggregator = match file.aggregator {
            Some(a) => AggregatorConfig {
                dwell_frames: a.dwell_frames.unwrap_or(aggregator_defaults.dwell_frames),
                smoothing: a.smoothing.unwrap_or(aggregator_defaults.smoothing),
                min_confidence: a
                    .min_confidence
                    .unwrap_or(aggregator_defaults.min_confidence),
            },
            None => aggregator_defaults,
        };

        let runtime_defaults = RuntimeConfig::default();
        let runtime = match file.pipeline {
            Some(p) => RuntimeConfig {
                mode: p.mode.unwrap_or(runtime_defaults.mode),
                frame_interval: runtime_defaults.frame_interval,
                stall_frames: p.stall_frames.unwrap_or(runtime_defaults.stall_frames),
                max_capture_retries: p
                    .max_capture_retries
                    .unwrap_or(runtime_defaults.max_capture_retries),
                capture_backoff: p
                    .capture_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(runtime_defaults.capture_backoff),
                capture_backoff_max: p
                    .capture_backoff_max_ms
                    .map(Duration::from_millis)
                    .unwrap_or(runtime_defaults.capture_backoff_max),
                max_inference_failures: p
                    .max_inference_failures
                    .unwrap_or(runtime_defaults.max_inference_failures),
                health_interval: p
                    .health_interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(runtime_defaults.health_interval),
            },
            None => runtime_defaults,
        };

        let mut cfg = Self {
            source,
            model,
            preprocess,
            aggregator,
            runtime,
        };
        cfg.sync_frame_interval();
        cfg
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(uri) = std::env::var("AMIGO_SOURCE_URI") {
            if !uri.trim().is_empty() {
                self.source.uri = uri;
            }
        }
        if let Ok(path) = std::env::var("AMIGO_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.model.path = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("AMIGO_LABELS_PATH") {
            if !path.trim().is_empty() {
                self.model.labels_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(labels) = std::env::var("AMIGO_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.model.labels = Some(parsed);
            }
        }
        if let Ok(backend) = std::env::var("AMIGO_BACKEND") {
            if !backend.trim().is_empty() {
                self.model.backend = backend.trim().to_string();
            }
        }
        if let Ok(dwell) = std::env::var("AMIGO_DWELL_FRAMES") {
            self.aggregator.dwell_frames = dwell
                .trim()
                .parse()
                .map_err(|_| anyhow!("AMIGO_DWELL_FRAMES must be a positive integer"))?;
        }
        if let Ok(floor) = std::env::var("AMIGO_MIN_CONFIDENCE") {
            self.aggregator.min_confidence = floor
                .trim()
                .parse()
                .map_err(|_| anyhow!("AMIGO_MIN_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Ok(mode) = std::env::var("AMIGO_PIPELINE_MODE") {
            self.runtime.mode = mode
                .parse()
                .map_err(|e: String| anyhow!("AMIGO_PIPELINE_MODE: {}", e))?;
        }
        Ok(())
    }

    /// Check cross-field constraints. Call again after changing fields by hand.
    pub fn validate(&mut self) -> Result<()> {
        self.source.validate().map_err(|e| anyhow!("source: {}", e))?;
        self.aggregator
            .validate()
            .map_err(|e| anyhow!("aggregator: {}", e))?;
        if let Some(roi) = &self.preprocess.roi {
            roi.validate().map_err(|e| anyhow!("preprocess: {}", e))?;
        }
        if self.model.backend.trim().is_empty() {
            return Err(anyhow!("model: backend must not be empty"));
        }
        if self.model.backend == "tract" && self.model.path.is_none() {
            return Err(anyhow!("model: the tract backend requires a model path"));
        }
        if self.model.input_width == 0 || self.model.input_height == 0 {
            return Err(anyhow!("model: input size must be non-zero"));
        }
        if self.runtime.capture_backoff.is_zero() {
            return Err(anyhow!("pipeline: capture_backoff_ms must be greater than zero"));
        }
        if self.runtime.capture_backoff_max < self.runtime.capture_backoff {
            return Err(anyhow!(
                "pipeline: capture_backoff_max_ms must not be below capture_backoff_ms"
            ));
        }
        if self.runtime.stall_frames == 0 {
            return Err(anyhow!("pipeline: stall_frames must be greater than zero"));
        }
        self.sync_frame_interval();
        Ok(())
    }

    /// The runtime paces its waits off the source's nominal frame rate.
    fn sync_frame_interval(&mut self) {
        if self.source.target_fps > 0 {
            self.runtime.frame_interval = self.source.frame_interval();
        }
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
