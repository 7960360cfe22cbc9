use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use amigo_vision::{
    result_channel, AggregatedResult, AggregatorConfig, BackendRegistry, Frame, FrameSource,
    InferenceBackend, InferenceEngine, LabelSet, ModelInfo, Normalization, OutputActivation,
    Pipeline, PipelineConfig, PipelineError, PipelineMode, PixelFormat, Preprocessor,
    ResultSink, RuntimeConfig, SinkEvent, SourceStats, Tensor, TensorShape,
};

const WIDTH: u32 = 8;
const HEIGHT: u32 = 8;

fn input_shape() -> TensorShape {
    TensorShape::nchw(3, 4, 4)
}

fn labels() -> LabelSet {
    LabelSet::new(["cat", "dog", "bird"]).expect("labels")
}

fn rgb_frame(sequence: u64) -> Frame {
    let len = (WIDTH * HEIGHT * 3) as usize;
    Frame::new(vec![128; len], WIDTH, HEIGHT, PixelFormat::Rgb24, sequence)
}

fn fast_runtime(mode: PipelineMode) -> RuntimeConfig {
    RuntimeConfig {
        mode,
        frame_interval: Duration::from_millis(5),
        capture_backoff: Duration::from_millis(1),
        capture_backoff_max: Duration::from_millis(4),
        ..RuntimeConfig::default()
    }
}

fn aggregator() -> AggregatorConfig {
    AggregatorConfig {
        dwell_frames: 3,
        smoothing: 0.5,
        min_confidence: 0.5,
    }
}

// ----------------------------------------------------------------------------
// Scripted source
// ----------------------------------------------------------------------------

enum Step {
    Rgb,
    Raw([u8; 4]),
    Unavailable,
}

#[derive(Default)]
struct SourceTally {
    connects: AtomicU64,
    disconnects: AtomicU64,
    connected: AtomicBool,
    health_checks: AtomicU64,
}

struct ScriptedSource {
    steps: VecDeque<Step>,
    endless: bool,
    pace: Option<Duration>,
    sequence: u64,
    tally: Arc<SourceTally>,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>) -> (Self, Arc<SourceTally>) {
        let tally = Arc::new(SourceTally::default());
        let source = Self {
            steps: steps.into(),
            endless: false,
            pace: None,
            sequence: 0,
            tally: Arc::clone(&tally),
        };
        (source, tally)
    }

    fn frames(count: usize) -> (Self, Arc<SourceTally>) {
        Self::new((0..count).map(|_| Step::Rgb).collect())
    }

    fn endless(pace: Duration) -> (Self, Arc<SourceTally>) {
        let (mut source, tally) = Self::new(Vec::new());
        source.endless = true;
        source.pace = Some(pace);
        (source, tally)
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

impl FrameSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn connect(&mut self) -> Result<(), PipelineError> {
        self.tally.connects.fetch_add(1, Ordering::SeqCst);
        self.tally.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        if let Some(pace) = self.pace {
            thread::sleep(pace);
        }
        if self.endless {
            let sequence = self.next_sequence();
            return Ok(Some(rgb_frame(sequence)));
        }
        match self.steps.pop_front() {
            Some(Step::Rgb) => {
                let sequence = self.next_sequence();
                Ok(Some(rgb_frame(sequence)))
            }
            Some(Step::Raw(code)) => {
                let sequence = self.next_sequence();
                Ok(Some(Frame::new(
                    vec![0; 64],
                    WIDTH,
                    HEIGHT,
                    PixelFormat::Other(code),
                    sequence,
                )))
            }
            Some(Step::Unavailable) => {
                Err(PipelineError::CaptureUnavailable("camera unplugged".to_string()))
            }
            None => Ok(None),
        }
    }

    fn disconnect(&mut self) {
        self.tally.disconnects.fetch_add(1, Ordering::SeqCst);
        self.tally.connected.store(false, Ordering::SeqCst);
    }

    fn is_healthy(&self) -> bool {
        self.tally.health_checks.fetch_add(1, Ordering::SeqCst);
        self.tally.connected.load(Ordering::SeqCst)
    }

    fn stats(&self) -> SourceStats {
        self.tally.health_checks.fetch_add(1, Ordering::SeqCst);
        SourceStats {
            frames_captured: self.sequence,
            connects: self.tally.connects.load(Ordering::SeqCst),
            last_error: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Scripted backend
// ----------------------------------------------------------------------------

type Script = Box<dyn FnMut(u64) -> Result<Vec<f32>, PipelineError> + Send>;

#[derive(Default)]
struct BackendTally {
    seen: Mutex<Vec<u64>>,
    released: AtomicU64,
}

struct ScriptedBackend {
    info: ModelInfo,
    script: Script,
    delay: Option<Duration>,
    tally: Arc<BackendTally>,
}

impl ScriptedBackend {
    fn new(script: Script) -> (Self, Arc<BackendTally>) {
        let tally = Arc::new(BackendTally::default());
        let backend = Self {
            info: ModelInfo {
                name: "scripted".to_string(),
                input: input_shape(),
                label_count: 3,
                digest: None,
                quantization_tolerance: 0.0,
            },
            script,
            delay: None,
            tally: Arc::clone(&tally),
        };
        (backend, tally)
    }

    fn always(label_index: usize) -> (Self, Arc<BackendTally>) {
        Self::new(Box::new(move |_| Ok(confident(label_index))))
    }
}

impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn run(&mut self, input: &Tensor) -> Result<Vec<f32>, PipelineError> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if let Ok(mut seen) = self.tally.seen.lock() {
            seen.push(input.sequence);
        }
        (self.script)(input.sequence)
    }
}

impl Drop for ScriptedBackend {
    fn drop(&mut self) {
        self.tally.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn confident(label_index: usize) -> Vec<f32> {
    let mut probabilities = vec![0.05; 3];
    probabilities[label_index] = 0.9;
    probabilities
}

/// Records every call a pipeline makes on its sink.
#[derive(Default)]
struct RecordingSink {
    results: Mutex<Vec<AggregatedResult>>,
    clears: Mutex<Vec<u64>>,
    failures: AtomicU64,
}

impl ResultSink for RecordingSink {
    fn publish(&self, result: AggregatedResult) {
        if let Ok(mut results) = self.results.lock() {
            results.push(result);
        }
    }

    fn clear(&self, sequence: u64) {
        if let Ok(mut clears) = self.clears.lock() {
            clears.push(sequence);
        }
    }

    fn fail(&self, _error: &PipelineError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

fn pipeline(
    runtime: RuntimeConfig,
    source: ScriptedSource,
    backend: ScriptedBackend,
    sink: Arc<dyn ResultSink>,
) -> Pipeline {
    let engine = InferenceEngine::new(Box::new(backend), labels(), OutputActivation::Auto)
        .expect("engine");
    let preprocessor =
        Preprocessor::new(input_shape(), Normalization::Unit, None).expect("preprocessor");
    Pipeline::new(runtime, Box::new(source), preprocessor, engine, aggregator(), sink)
        .expect("pipeline")
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[test]
fn sequential_run_settles_on_a_stable_label() {
    let (source, source_tally) = ScriptedSource::frames(6);
    let (backend, backend_tally) = ScriptedBackend::always(1);
    let (sink, receiver) = result_channel();

    let stats = pipeline(
        fast_runtime(PipelineMode::Sequential),
        source,
        backend,
        Arc::new(sink),
    )
    .run()
    .expect("run");

    assert_eq!(stats.frames_captured, 6);
    assert_eq!(stats.predictions, 6);
    assert_eq!(stats.results_published, 6);
    assert_eq!(stats.frames_dropped, 0);

    match receiver.try_recv() {
        SinkEvent::Result(result) => {
            assert_eq!(&*result.label, "dog");
            assert!(result.stable);
            assert_eq!(result.sequence, 6);
            assert_eq!(result.run_length, 6);
        }
        other => panic!("expected a result, got {:?}", other),
    }
    assert_eq!(receiver.try_recv(), SinkEvent::Closed);

    assert_eq!(backend_tally.released.load(Ordering::SeqCst), 1);
    assert!(!source_tally.connected.load(Ordering::SeqCst));
    // Source health is reported when the run releases the source.
    assert!(source_tally.health_checks.load(Ordering::SeqCst) >= 2);
}

#[test]
fn low_confidence_clears_the_reported_label() {
    let (source, _) = ScriptedSource::frames(8);
    let (backend, _) = ScriptedBackend::new(Box::new(|sequence| {
        if sequence <= 4 {
            Ok(confident(1))
        } else {
            Ok(vec![0.4, 0.3, 0.3])
        }
    }));
    let (sink, receiver) = result_channel();

    let stats = pipeline(
        fast_runtime(PipelineMode::Sequential),
        source,
        backend,
        Arc::new(sink),
    )
    .run()
    .expect("run");

    assert_eq!(stats.results_published, 4);
    assert_eq!(stats.suppressed, 4);
    // The stable "dog" is replaced by a single clear; the rest stay quiet.
    assert_eq!(receiver.try_recv(), SinkEvent::Cleared(5));
    assert_eq!(receiver.try_recv(), SinkEvent::Closed);

    let (source, _) = ScriptedSource::frames(8);
    let (backend, _) = ScriptedBackend::new(Box::new(|sequence| {
        if sequence <= 4 || sequence == 8 {
            Ok(confident(1))
        } else {
            Ok(vec![0.4, 0.3, 0.3])
        }
    }));
    let recording = Arc::new(RecordingSink::default());
    pipeline(
        fast_runtime(PipelineMode::Sequential),
        source,
        backend,
        recording.clone(),
    )
    .run()
    .expect("run");

    assert_eq!(*recording.clears.lock().expect("clears"), vec![5]);
    let results = recording.results.lock().expect("results");
    let last = results.last().expect("last result");
    assert_eq!(last.sequence, 8);
    assert_eq!(last.run_length, 1);
    assert!(!last.stable);
}

#[test]
fn results_follow_capture_order() {
    let (source, _) = ScriptedSource::frames(12);
    let (backend, _) = ScriptedBackend::new(Box::new(|sequence| {
        Ok(confident(if sequence <= 6 { 0 } else { 2 }))
    }));
    let sink = Arc::new(RecordingSink::default());

    pipeline(
        fast_runtime(PipelineMode::Sequential),
        source,
        backend,
        sink.clone(),
    )
    .run()
    .expect("run");

    let results = sink.results.lock().expect("results");
    let sequences: Vec<u64> = results.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, (1..=12).collect::<Vec<_>>());

    let last = results.last().expect("last result");
    assert_eq!(&*last.label, "bird");
    assert!(last.stable);

    // The switch is never reported as stable on its first frame.
    let first_bird = results
        .iter()
        .find(|r| &*r.label == "bird")
        .expect("bird appears");
    assert!(!first_bird.stable);
    assert_eq!(sink.failures.load(Ordering::SeqCst), 0);
}

#[test]
fn unsupported_frames_never_reach_the_engine() {
    let (source, _) = ScriptedSource::new(vec![
        Step::Rgb,
        Step::Raw(*b"H264"),
        Step::Rgb,
        Step::Raw(*b"Y16 "),
        Step::Rgb,
    ]);
    let (backend, backend_tally) = ScriptedBackend::always(0);
    let sink = Arc::new(RecordingSink::default());

    let stats = pipeline(
        fast_runtime(PipelineMode::Sequential),
        source,
        backend,
        sink.clone(),
    )
    .run()
    .expect("run");

    assert_eq!(stats.frames_captured, 5);
    assert_eq!(stats.frames_rejected, 2);
    assert_eq!(stats.predictions, 3);
    assert_eq!(*backend_tally.seen.lock().expect("seen"), vec![1, 3, 5]);

    // Rejected frames do not break the agreeing run.
    let results = sink.results.lock().expect("results");
    let last = results.last().expect("last result");
    assert_eq!(last.run_length, 3);
    assert!(last.stable);
}

#[test]
fn threaded_mode_drops_stale_frames_instead_of_queueing() {
    let (source, _) = ScriptedSource::frames(120);
    let (mut backend, backend_tally) = ScriptedBackend::always(2);
    backend.delay = Some(Duration::from_millis(5));
    let sink = Arc::new(RecordingSink::default());

    let stats = pipeline(
        fast_runtime(PipelineMode::Threaded),
        source,
        backend,
        sink.clone(),
    )
    .run()
    .expect("run");

    assert_eq!(stats.frames_captured, 120);
    assert!(stats.frames_dropped > 0, "stats: {}", stats);
    assert!(stats.peak_handoff_depth <= 1, "stats: {}", stats);
    assert_eq!(stats.predictions + stats.frames_dropped, stats.frames_captured);

    let seen = backend_tally.seen.lock().expect("seen");
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    let results = sink.results.lock().expect("results");
    assert!(results.windows(2).all(|pair| pair[0].sequence < pair[1].sequence));
}

#[test]
fn transient_capture_failures_are_absorbed() {
    let (source, source_tally) = ScriptedSource::new(vec![
        Step::Rgb,
        Step::Unavailable,
        Step::Unavailable,
        Step::Rgb,
        Step::Rgb,
    ]);
    let (backend, _) = ScriptedBackend::always(0);
    let sink = Arc::new(RecordingSink::default());

    let stats = pipeline(
        fast_runtime(PipelineMode::Sequential),
        source,
        backend,
        sink.clone(),
    )
    .run()
    .expect("run");

    assert_eq!(stats.frames_captured, 3);
    assert_eq!(stats.capture_retries, 2);
    assert_eq!(source_tally.connects.load(Ordering::SeqCst), 3);
    assert_eq!(sink.failures.load(Ordering::SeqCst), 0);
}

#[test]
fn persistent_capture_failure_stops_the_run_once() {
    let (source, source_tally) =
        ScriptedSource::new((0..20).map(|_| Step::Unavailable).collect());
    let (backend, backend_tally) = ScriptedBackend::always(0);
    let (sink, receiver) = result_channel();
    let mut runtime = fast_runtime(PipelineMode::Threaded);
    runtime.max_capture_retries = 3;

    let err = pipeline(runtime, source, backend, Arc::new(sink))
        .run()
        .expect_err("capture must give up");

    match err {
        PipelineError::CaptureRetriesExhausted { attempts, .. } => assert_eq!(attempts, 4),
        other => panic!("unexpected error: {}", other),
    }
    match receiver.try_recv() {
        SinkEvent::Failed(reason) => assert!(reason.contains("4 consecutive attempts")),
        other => panic!("expected a failure, got {:?}", other),
    }
    assert_eq!(source_tally.connects.load(Ordering::SeqCst), 4);
    assert!(!source_tally.connected.load(Ordering::SeqCst));
    assert_eq!(backend_tally.released.load(Ordering::SeqCst), 1);
}

#[test]
fn repeated_inference_failures_escalate() {
    let (source, _) = ScriptedSource::frames(50);
    let (backend, backend_tally) = ScriptedBackend::new(Box::new(|sequence| {
        if sequence == 1 {
            Ok(confident(0))
        } else {
            Err(PipelineError::Inference("accelerator timeout".to_string()))
        }
    }));
    let sink = Arc::new(RecordingSink::default());
    let mut runtime = fast_runtime(PipelineMode::Sequential);
    runtime.max_inference_failures = 2;

    let err = pipeline(runtime, source, backend, sink.clone())
        .run()
        .expect_err("inference must give up");

    assert!(matches!(
        err,
        PipelineError::InferenceFailuresExceeded { consecutive: 3, .. }
    ));
    assert_eq!(sink.failures.load(Ordering::SeqCst), 1);
    assert_eq!(sink.results.lock().expect("results").len(), 1);
    assert_eq!(*backend_tally.seen.lock().expect("seen"), vec![1, 2, 3, 4]);
    assert_eq!(backend_tally.released.load(Ordering::SeqCst), 1);
}

#[test]
fn isolated_inference_failures_only_cost_a_frame() {
    let (source, _) = ScriptedSource::frames(6);
    let (backend, _) = ScriptedBackend::new(Box::new(|sequence| {
        if sequence % 2 == 0 {
            Err(PipelineError::Inference("flaky".to_string()))
        } else {
            Ok(confident(1))
        }
    }));
    let sink = Arc::new(RecordingSink::default());
    let mut runtime = fast_runtime(PipelineMode::Sequential);
    runtime.max_inference_failures = 1;

    let stats = pipeline(runtime, source, backend, sink.clone())
        .run()
        .expect("run");

    assert_eq!(stats.inference_failures, 3);
    assert_eq!(stats.predictions, 3);
    assert_eq!(sink.failures.load(Ordering::SeqCst), 0);
}

#[test]
fn stop_handle_ends_an_endless_source() {
    for mode in [PipelineMode::Sequential, PipelineMode::Threaded] {
        let (source, source_tally) = ScriptedSource::endless(Duration::from_millis(2));
        let (backend, backend_tally) = ScriptedBackend::always(0);
        let (sink, receiver) = result_channel();

        let running = pipeline(fast_runtime(mode), source, backend, Arc::new(sink));
        let stop = running.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            stop.stop();
        });

        let stats = running.run().expect("run");
        stopper.join().expect("stopper");

        assert!(stats.frames_captured > 0);
        assert!(!source_tally.connected.load(Ordering::SeqCst));
        assert_eq!(backend_tally.released.load(Ordering::SeqCst), 1);

        // Drain whatever is left; the channel ends cleanly.
        loop {
            match receiver.try_recv() {
                SinkEvent::Result(_) => continue,
                SinkEvent::Closed => break,
                other => panic!("{:?}: unexpected event {:?}", mode, other),
            }
        }
    }
}

#[test]
fn repeated_runs_release_source_and_model_each_time() {
    for _ in 0..3 {
        let (source, source_tally) = ScriptedSource::frames(4);
        let (backend, backend_tally) = ScriptedBackend::always(0);
        let (sink, _receiver) = result_channel();

        pipeline(
            fast_runtime(PipelineMode::Threaded),
            source,
            backend,
            Arc::new(sink),
        )
        .run()
        .expect("run");

        assert_eq!(backend_tally.released.load(Ordering::SeqCst), 1);
        assert!(!source_tally.connected.load(Ordering::SeqCst));
        assert_eq!(
            source_tally.connects.load(Ordering::SeqCst),
            source_tally.disconnects.load(Ordering::SeqCst)
        );
    }
}

#[test]
fn mismatched_preprocessor_is_rejected_at_assembly() {
    let (source, _) = ScriptedSource::frames(1);
    let (backend, _) = ScriptedBackend::always(0);
    let engine = InferenceEngine::new(Box::new(backend), labels(), OutputActivation::Auto)
        .expect("engine");
    let preprocessor = Preprocessor::new(TensorShape::nchw(3, 8, 8), Normalization::Unit, None)
        .expect("preprocessor");
    let (sink, _receiver) = result_channel();

    let result = Pipeline::new(
        fast_runtime(PipelineMode::Sequential),
        Box::new(source),
        preprocessor,
        engine,
        aggregator(),
        Arc::new(sink),
    );
    assert!(matches!(result, Err(PipelineError::ModelLoad(_))));
}

#[test]
fn configured_stub_pipeline_tracks_the_synthetic_scene() {
    let mut config = PipelineConfig::default();
    config.source.uri = "stub://integration".to_string();
    config.source.width = 64;
    config.source.height = 48;
    config.source.realtime = false;
    config.source.max_frames = Some(60);
    config.model.labels = Some(vec![
        "red".to_string(),
        "green".to_string(),
        "blue".to_string(),
    ]);
    config.runtime.mode = PipelineMode::Sequential;
    config.validate().expect("valid config");

    let (sink, receiver) = result_channel();
    let stats = Pipeline::build(&config, &BackendRegistry::with_builtin(), Arc::new(sink))
        .expect("build")
        .run()
        .expect("run");

    assert_eq!(stats.frames_captured, 60);
    assert_eq!(stats.predictions, 60);
    match receiver.try_recv() {
        SinkEvent::Result(result) => {
            assert_eq!(&*result.label, "green");
            assert!(result.stable);
            assert_eq!(result.sequence, 60);
        }
        other => panic!("expected a result, got {:?}", other),
    }
}

#[test]
fn missing_model_fails_before_capture() {
    let mut config = PipelineConfig::default();
    config.model.backend = "does-not-exist".to_string();
    config.model.labels = Some(vec!["a".to_string(), "b".to_string()]);
    let (sink, _receiver) = result_channel();

    let result = Pipeline::build(&config, &BackendRegistry::with_builtin(), Arc::new(sink));
    assert!(matches!(result, Err(PipelineError::ModelLoad(_))));
}
