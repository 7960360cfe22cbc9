//! Amigo Vision
//!
//! A real-time camera classification pipeline: frames are captured, converted
//! into model tensors, classified, smoothed over time and handed to a consumer
//! as a stable label with a confidence.
//!
//! # Architecture
//!
//! ```text
//! FrameSource → Preprocessor → InferenceEngine → TemporalAggregator → ResultSink
//! ```
//!
//! The pipeline holds these guarantees by construction:
//!
//! 1. **Bounded memory**: frames are moved, never cloned, and at most one frame
//!    waits between capture and processing.
//! 2. **Ordered results**: predictions reach the aggregator in capture order;
//!    stragglers are dropped, never reordered.
//! 3. **One model owner**: the engine is the single owner of the loaded model
//!    and is released when the pipeline stops.
//! 4. **Absorbed transients**: a bad frame or failed inference costs one frame;
//!    only persistent failure stops the run, and the sink hears about it once.
//!
//! # Module Structure
//!
//! - `frame`: captured frames and pixel formats
//! - `ingest`: frame sources (synthetic, V4L2, image directories)
//! - `preprocess`: frame → tensor conversion
//! - `infer`: label sets, backends, the inference engine
//! - `aggregate`: temporal smoothing state machine
//! - `sink`: result delivery
//! - `pipeline`: scheduling, retries and shutdown
//! - `config`: file and environment configuration

pub mod aggregate;
pub mod config;
pub mod error;
pub mod frame;
pub mod handoff;
pub mod infer;
pub mod ingest;
pub mod pipeline;
pub mod preprocess;
pub mod sink;
pub mod tensor;
pub mod ui;

pub use aggregate::{
    AggregatedResult, AggregatorConfig, AggregatorState, Observation, TemporalAggregator,
};
pub use config::PipelineConfig;
pub use error::PipelineError;
pub use frame::{Frame, PixelFormat};
pub use handoff::{LatestSlot, Take};
pub use infer::{
    BackendRegistry, ClassScore, InferenceBackend, InferenceEngine, LabelSet, ModelConfig,
    ModelInfo, OutputActivation, Prediction, StubBackend,
};
#[cfg(feature = "backend-tract")]
pub use infer::TractBackend;
pub use ingest::{open_source, FrameSource, SourceConfig, SourceStats, SyntheticSource};
#[cfg(feature = "ingest-images")]
pub use ingest::ImageDirSource;
#[cfg(feature = "ingest-v4l2")]
pub use ingest::V4l2Source;
pub use pipeline::{Pipeline, PipelineMode, PipelineStats, RuntimeConfig, StopHandle};
pub use preprocess::{Normalization, PreprocessConfig, Preprocessor, Roi};
pub use sink::{result_channel, LatestResultSink, LogSink, ResultReceiver, ResultSink, SinkEvent};
pub use tensor::{Tensor, TensorLayout, TensorShape};
