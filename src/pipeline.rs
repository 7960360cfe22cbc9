//! Pipeline runtime: capture → preprocess → infer → aggregate → publish.
//!
//! Two scheduling modes:
//! - `Sequential`: one loop runs every stage in turn.
//! - `Threaded`: a capture thread feeds a `LatestSlot`; the calling thread
//!   drains it and runs the remaining stages. A frame that arrives while the
//!   previous one is still pending displaces it, so at most one frame is ever
//!   buffered and results track the newest image.
//!
//! Per-frame failures (unsupported format, a failed inference, a capture
//! hiccup) are absorbed and counted. Capture is retried with exponential
//! backoff; too many consecutive capture or inference failures end the run.
//! On any exit the source is disconnected and the engine dropped before the
//! outcome is reported, and a fatal error reaches the sink exactly once.

use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::aggregate::{AggregatorConfig, Observation, TemporalAggregator};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::handoff::{LatestSlot, Take};
use crate::infer::{BackendRegistry, InferenceEngine};
use crate::ingest::{open_source, FrameSource};
use crate::preprocess::Preprocessor;
use crate::sink::ResultSink;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    Sequential,
    #[default]
    Threaded,
}

impl std::str::FromStr for PipelineMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "threaded" => Ok(Self::Threaded),
            other => Err(format!(
                "unknown pipeline mode '{}' (expected sequential or threaded)",
                other
            )),
        }
    }
}

/// Scheduling, retry and escalation settings.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    pub mode: PipelineMode,
    /// Nominal time between frames; bounds every wait in the loop.
    pub frame_interval: Duration,
    /// Frame intervals without a frame before capture counts as stalled.
    pub stall_frames: u32,
    /// Consecutive capture failures tolerated before the run fails.
    pub max_capture_retries: u32,
    pub capture_backoff: Duration,
    pub capture_backoff_max: Duration,
    /// Consecutive inference failures tolerated before the run fails.
    pub max_inference_failures: u32,
    pub health_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::Threaded,
            frame_interval: Duration::from_millis(33),
            stall_frames: 10,
            max_capture_retries: 5,
            capture_backoff: Duration::from_millis(100),
            capture_backoff_max: Duration::from_millis(2_000),
            max_inference_failures: 10,
            health_interval: Duration::from_secs(5),
        }
    }
}

impl RuntimeConfig {
    pub fn stall_timeout(&self) -> Duration {
        self.frame_interval
            .saturating_mul(self.stall_frames.max(1))
            .max(Duration::from_millis(1))
    }

    /// Upper bound for a single blocking wait, so stop requests are honoured
    /// within one frame interval.
    fn wait_chunk(&self) -> Duration {
        self.frame_interval.max(Duration::from_millis(1))
    }
}

// ----------------------------------------------------------------------------
// Stop handle and statistics
// ----------------------------------------------------------------------------

/// Cooperative stop signal, checked between stages.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `total` in chunks of at most `chunk`. Returns true if a stop
    /// was requested meanwhile.
    fn sleep(&self, total: Duration, chunk: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.is_stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(chunk));
        }
    }
}

/// Counters reported when a run ends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_captured: u64,
    /// Frames displaced from the handoff slot before processing.
    pub frames_dropped: u64,
    /// Frames the preprocessor could not convert.
    pub frames_rejected: u64,
    pub inference_failures: u64,
    pub predictions: u64,
    /// Predictions under the aggregator's confidence floor.
    pub suppressed: u64,
    pub out_of_order: u64,
    pub results_published: u64,
    pub capture_retries: u64,
    pub peak_handoff_depth: usize,
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "captured={} dropped={} rejected={} inference_failures={} predictions={} \
             suppressed={} out_of_order={} published={} capture_retries={} peak_depth={}",
            self.frames_captured,
            self.frames_dropped,
            self.frames_rejected,
            self.inference_failures,
            self.predictions,
            self.suppressed,
            self.out_of_order,
            self.results_published,
            self.capture_retries,
            self.peak_handoff_depth
        )
    }
}

#[derive(Default)]
struct Counters {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    frames_rejected: AtomicU64,
    inference_failures: AtomicU64,
    predictions: AtomicU64,
    suppressed: AtomicU64,
    out_of_order: AtomicU64,
    results_published: AtomicU64,
    capture_retries: AtomicU64,
    peak_handoff_depth: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            predictions: self.predictions.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            results_published: self.results_published.load(Ordering::Relaxed),
            capture_retries: self.capture_retries.load(Ordering::Relaxed),
            peak_handoff_depth: self.peak_handoff_depth.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Capture stage
// ----------------------------------------------------------------------------

struct Capture {
    source: Box<dyn FrameSource>,
    runtime: RuntimeConfig,
    counters: Arc<Counters>,
    stop: StopHandle,
    connected: bool,
    failures: u32,
    backoff: Duration,
    last_report: Instant,
}

impl Capture {
    fn new(
        source: Box<dyn FrameSource>,
        runtime: RuntimeConfig,
        counters: Arc<Counters>,
        stop: StopHandle,
    ) -> Self {
        let backoff = runtime.capture_backoff;
        Self {
            source,
            runtime,
            counters,
            stop,
            connected: false,
            failures: 0,
            backoff,
            last_report: Instant::now(),
        }
    }

    /// Next frame, reconnecting as needed. `Ok(None)` on end of stream or stop.
    fn next(&mut self) -> Result<Option<Frame>, PipelineError> {
        loop {
            if self.stop.is_stopped() {
                return Ok(None);
            }
            if !self.connected {
                match self.source.connect() {
                    Ok(()) => self.connected = true,
                    Err(PipelineError::CaptureUnavailable(reason)) => {
                        if self.retry(reason)? {
                            return Ok(None);
                        }
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
            match self.source.next_frame() {
                Ok(Some(frame)) => {
                    self.failures = 0;
                    self.backoff = self.runtime.capture_backoff;
                    Counters::bump(&self.counters.frames_captured);
                    if self.last_report.elapsed() >= self.runtime.health_interval {
                        self.report();
                        self.last_report = Instant::now();
                    }
                    return Ok(Some(frame));
                }
                Ok(None) => {
                    log::info!("capture: end of stream from {}", self.source.name());
                    return Ok(None);
                }
                Err(PipelineError::CaptureUnavailable(reason)) => {
                    if self.retry(reason)? {
                        return Ok(None);
                    }
                }
                Err(err) if err.is_recoverable() => {
                    log::debug!("capture: dropping frame: {}", err);
                    Counters::bump(&self.counters.frames_rejected);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Record a capture failure and wait out the backoff. Returns true if a
    /// stop was requested while waiting.
    fn retry(&mut self, reason: String) -> Result<bool, PipelineError> {
        self.failures += 1;
        if self.failures > self.runtime.max_capture_retries {
            return Err(PipelineError::CaptureRetriesExhausted {
                attempts: self.failures,
                last: reason,
            });
        }
        Counters::bump(&self.counters.capture_retries);
        log::warn!(
            "capture: {} unavailable ({}/{}): {}; reconnecting in {:?}",
            self.source.name(),
            self.failures,
            self.runtime.max_capture_retries,
            reason,
            self.backoff
        );
        if self.connected {
            self.source.disconnect();
            self.connected = false;
        }
        let stopped = self.stop.sleep(self.backoff, self.runtime.wait_chunk());
        self.backoff = (self.backoff * 2).min(self.runtime.capture_backoff_max);
        Ok(stopped)
    }

    fn report(&self) {
        let stats = self.source.stats();
        log::info!(
            "source health: {} healthy={} frames={} connects={} last_error={}",
            self.source.name(),
            self.source.is_healthy(),
            stats.frames_captured,
            stats.connects,
            stats.last_error.as_deref().unwrap_or("-")
        );
    }

    fn shutdown(&mut self) {
        if self.connected {
            self.source.disconnect();
            self.connected = false;
        }
        self.report();
    }
}

// ----------------------------------------------------------------------------
// Processing stages
// ----------------------------------------------------------------------------

struct Processor {
    preprocessor: Preprocessor,
    engine: InferenceEngine,
    aggregator: TemporalAggregator,
    sink: Arc<dyn ResultSink>,
    counters: Arc<Counters>,
    max_inference_failures: u32,
    consecutive_failures: u32,
}

impl Processor {
    /// Run one frame through preprocess, inference and aggregation. Per-frame
    /// failures are absorbed; only fatal errors are returned.
    fn process(&mut self, frame: Frame) -> Result<(), PipelineError> {
        let sequence = frame.sequence;
        let captured_at = frame.captured_at();
        log::trace!("seq={} waited {}ms for processing", sequence, frame.age().as_millis());

        let tensor = match self.preprocessor.prepare(frame) {
            Ok(tensor) => tensor,
            Err(err @ PipelineError::UnsupportedFrameFormat { .. }) => {
                log::debug!("dropping frame seq={}: {}", sequence, err);
                Counters::bump(&self.counters.frames_rejected);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let prediction = match self.engine.infer(tensor) {
            Ok(prediction) => {
                self.consecutive_failures = 0;
                prediction
            }
            Err(PipelineError::Inference(reason)) => {
                Counters::bump(&self.counters.inference_failures);
                self.consecutive_failures += 1;
                if self.consecutive_failures > self.max_inference_failures {
                    return Err(PipelineError::InferenceFailuresExceeded {
                        consecutive: self.consecutive_failures,
                        last: reason,
                    });
                }
                log::warn!(
                    "inference failed on seq={} ({} in a row): {}",
                    sequence,
                    self.consecutive_failures,
                    reason
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        Counters::bump(&self.counters.predictions);
        log::debug!(
            "seq={} frame-to-prediction latency {}ms",
            sequence,
            captured_at.elapsed().as_millis()
        );

        match self.aggregator.observe(&prediction) {
            Observation::Updated(result) => {
                self.sink.publish(result);
                Counters::bump(&self.counters.results_published);
            }
            Observation::Suppressed => Counters::bump(&self.counters.suppressed),
            Observation::Cleared { sequence } => {
                log::debug!("seq={}: below confidence floor, label cleared", sequence);
                Counters::bump(&self.counters.suppressed);
                self.sink.clear(sequence);
            }
            Observation::OutOfOrder { .. } => Counters::bump(&self.counters.out_of_order),
            Observation::LabelMismatch { expected, actual } => {
                return Err(PipelineError::Stage {
                    stage: "aggregate",
                    reason: format!(
                        "prediction has {} classes, aggregator expects {}",
                        actual, expected
                    ),
                });
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

pub struct Pipeline {
    runtime: RuntimeConfig,
    source: Box<dyn FrameSource>,
    processor: Processor,
    counters: Arc<Counters>,
    stop: StopHandle,
}

impl Pipeline {
    /// Assemble a pipeline from already-acquired parts. The preprocessor must
    /// produce the engine's declared input shape.
    pub fn new(
        runtime: RuntimeConfig,
        source: Box<dyn FrameSource>,
        preprocessor: Preprocessor,
        engine: InferenceEngine,
        aggregator: AggregatorConfig,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self, PipelineError> {
        let input = engine.info().input;
        if preprocessor.shape() != input {
            return Err(PipelineError::ModelLoad(format!(
                "preprocessor produces {} but the model expects {}",
                preprocessor.shape(),
                input
            )));
        }
        aggregator.validate().map_err(|reason| PipelineError::Stage {
            stage: "aggregate",
            reason,
        })?;

        let counters = Arc::new(Counters::default());
        let processor = Processor {
            aggregator: TemporalAggregator::new(aggregator, engine.labels().len()),
            preprocessor,
            engine,
            sink,
            counters: Arc::clone(&counters),
            max_inference_failures: runtime.max_inference_failures,
            consecutive_failures: 0,
        };
        Ok(Self {
            runtime,
            source,
            processor,
            counters,
            stop: StopHandle::new(),
        })
    }

    /// Load the model, open the source and wire everything as configured.
    /// Model problems surface here, before any frame is captured.
    pub fn build(
        config: &PipelineConfig,
        registry: &BackendRegistry,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self, PipelineError> {
        let engine = InferenceEngine::load(&config.model, registry)?;
        let preprocessor = Preprocessor::from_config(engine.info().input, &config.preprocess)?;
        let source = open_source(&config.source, config.runtime.stall_timeout())?;
        Self::new(
            config.runtime.clone(),
            source,
            preprocessor,
            engine,
            config.aggregator,
            sink,
        )
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run until the source ends, a stop is requested, or a fatal error.
    pub fn run(self) -> Result<PipelineStats, PipelineError> {
        let Self {
            runtime,
            source,
            processor,
            counters,
            stop,
        } = self;
        let sink = Arc::clone(&processor.sink);

        log::info!(
            "pipeline: starting {:?} run on {} (backend={}, input={})",
            runtime.mode,
            source.name(),
            processor.engine.backend_name(),
            processor.engine.info().input
        );
        let capture = Capture::new(source, runtime.clone(), Arc::clone(&counters), stop.clone());
        let outcome = match runtime.mode {
            PipelineMode::Sequential => run_sequential(&runtime, capture, processor, &counters),
            PipelineMode::Threaded => run_threaded(&runtime, capture, processor, &counters, &stop),
        };
        // Source and engine are released by now.

        let stats = counters.snapshot();
        match outcome {
            Ok(()) => {
                log::info!("pipeline: finished ({})", stats);
                Ok(stats)
            }
            Err(err) => {
                log::error!("pipeline: fatal error: {} ({})", err, stats);
                sink.fail(&err);
                Err(err)
            }
        }
    }
}

struct HealthTicker {
    interval: Duration,
    last: Instant,
}

impl HealthTicker {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    fn tick(&mut self, counters: &Counters) {
        if self.last.elapsed() >= self.interval {
            log::info!("pipeline health: {}", counters.snapshot());
            self.last = Instant::now();
        }
    }
}

fn run_sequential(
    runtime: &RuntimeConfig,
    mut capture: Capture,
    mut processor: Processor,
    counters: &Counters,
) -> Result<(), PipelineError> {
    let mut health = HealthTicker::new(runtime.health_interval);
    let outcome = loop {
        let frame = match capture.next() {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        if capture.stop.is_stopped() {
            break Ok(());
        }
        if let Err(err) = processor.process(frame) {
            break Err(err);
        }
        health.tick(counters);
    };
    capture.shutdown();
    drop(capture);
    drop(processor);
    outcome
}

fn run_threaded(
    runtime: &RuntimeConfig,
    mut capture: Capture,
    mut processor: Processor,
    counters: &Arc<Counters>,
    stop: &StopHandle,
) -> Result<(), PipelineError> {
    let slot: Arc<LatestSlot<Frame>> = Arc::new(LatestSlot::new());

    let capture_thread = {
        let slot = Arc::clone(&slot);
        let counters = Arc::clone(counters);
        thread::Builder::new()
            .name("amigo-capture".to_string())
            .spawn(move || {
                let outcome = loop {
                    match capture.next() {
                        Ok(Some(frame)) => {
                            if let Some(displaced) = slot.put(frame) {
                                if slot.is_closed() {
                                    break Ok(());
                                }
                                log::debug!(
                                    "dropping frame seq={} (processing busy)",
                                    displaced.sequence
                                );
                                Counters::bump(&counters.frames_dropped);
                            }
                            counters
                                .peak_handoff_depth
                                .fetch_max(slot.depth(), Ordering::Relaxed);
                        }
                        Ok(None) => break Ok(()),
                        Err(err) => break Err(err),
                    }
                };
                slot.close();
                capture.shutdown();
                outcome
            })
    };
    let capture_thread = match capture_thread {
        Ok(handle) => handle,
        Err(err) => {
            drop(processor);
            return Err(PipelineError::Stage {
                stage: "capture",
                reason: format!("failed to spawn capture thread: {}", err),
            });
        }
    };

    let mut health = HealthTicker::new(runtime.health_interval);
    let stall_timeout = runtime.stall_timeout();
    let mut last_frame_at = Instant::now();
    let mut stalled = false;
    let processed = loop {
        if stop.is_stopped() {
            break Ok(());
        }
        match slot.take_timeout(runtime.wait_chunk()) {
            Take::Item(frame) => {
                last_frame_at = Instant::now();
                stalled = false;
                if let Err(err) = processor.process(frame) {
                    break Err(err);
                }
            }
            Take::Empty => {
                if !stalled && last_frame_at.elapsed() >= stall_timeout {
                    log::warn!("pipeline: no frame for {:?}", last_frame_at.elapsed());
                    stalled = true;
                }
            }
            Take::Closed => break Ok(()),
        }
        health.tick(counters);
    };

    // Make the capture thread exit, then release the engine.
    if processed.is_err() {
        stop.stop();
    }
    slot.close();
    let captured = capture_thread.join().unwrap_or_else(|_| {
        Err(PipelineError::Stage {
            stage: "capture",
            reason: "capture thread panicked".to_string(),
        })
    });
    drop(slot);
    drop(processor);

    processed.and(captured)
}
