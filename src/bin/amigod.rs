//! amigod - real-time camera classification daemon
//!
//! This daemon:
//! 1. Loads configuration (file, environment, then command-line flags)
//! 2. Loads the model and its label set once, failing fast on a bad artifact
//! 3. Captures frames, classifies them and smooths the results over time
//! 4. Reports label changes and stability transitions until stopped (Ctrl-C)
//!    or the source ends

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use amigo_vision::{
    result_channel, ui::StatusLine, ui::Ui, BackendRegistry, LogSink, Pipeline, PipelineConfig,
    PipelineMode, ResultReceiver, ResultSink, SinkEvent,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Classify camera frames in real time")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "AMIGO_CONFIG")]
    config: Option<PathBuf>,
    /// Frame source: stub://<name>, /dev/videoN or an image directory.
    #[arg(long)]
    source: Option<String>,
    /// Model artifact path.
    #[arg(long)]
    model: Option<PathBuf>,
    /// Label file (defaults to labels.txt beside the model).
    #[arg(long)]
    labels: Option<PathBuf>,
    /// Inference backend name.
    #[arg(long)]
    backend: Option<String>,
    /// Consecutive agreeing predictions before a label is stable.
    #[arg(long)]
    dwell: Option<u32>,
    /// Scheduling mode (sequential|threaded).
    #[arg(long)]
    mode: Option<PipelineMode>,
    /// Stop after this many frames.
    #[arg(long)]
    max_frames: Option<u64>,
    /// Print the available inference backends and exit.
    #[arg(long)]
    list_backends: bool,
    /// Log every label change instead of showing a status line.
    #[arg(long)]
    log_results: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let registry = BackendRegistry::with_builtin();
    if args.list_backends {
        for name in registry.list() {
            println!("{}", name);
        }
        return Ok(());
    }

    let config = {
        let stage = ui.stage("Load configuration");
        match load_config(&args) {
            Ok(config) => config,
            Err(err) => {
                stage.fail(&err);
                return Err(err);
            }
        }
    };
    log::info!(
        "amigod {}: source={} backend={} mode={:?} dwell={}",
        env!("CARGO_PKG_VERSION"),
        config.source.uri,
        config.model.backend,
        config.runtime.mode,
        config.aggregator.dwell_frames
    );

    let (sink, receiver): (Arc<dyn ResultSink>, Option<ResultReceiver>) = if args.log_results {
        (Arc::new(LogSink::default()), None)
    } else {
        let (sink, receiver) = result_channel();
        (Arc::new(sink), Some(receiver))
    };
    let pipeline = {
        let stage = ui.stage("Load model and open source");
        match Pipeline::build(&config, &registry, sink) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                stage.fail(&err);
                return Err(err).context("pipeline setup failed");
            }
        }
    };

    let stop = pipeline.stop_handle();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received, stopping pipeline...");
        stop.stop();
    })
    .context("error setting Ctrl-C handler")?;

    let consumer = match receiver {
        Some(receiver) => {
            let status = ui.status(&config.source.uri);
            let handle = thread::Builder::new()
                .name("amigo-results".to_string())
                .spawn(move || consume_results(receiver, status))
                .context("spawn result consumer")?;
            Some(handle)
        }
        None => None,
    };

    let outcome = pipeline.run();
    // The pipeline has dropped its sink by now, which closes the receiver.
    if let Some(consumer) = consumer {
        consumer
            .join()
            .map_err(|_| anyhow!("result consumer panicked"))?;
    }

    match outcome {
        Ok(stats) => {
            log::info!("amigod: finished ({})", stats);
            Ok(())
        }
        Err(err) => Err(err).context("pipeline stopped on a fatal error"),
    }
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load_from(args.config.as_deref())?;
    if let Some(source) = &args.source {
        config.source.uri = source.clone();
    }
    if let Some(model) = &args.model {
        config.model.path = Some(model.clone());
    }
    if let Some(labels) = &args.labels {
        config.model.labels_path = Some(labels.clone());
    }
    if let Some(backend) = &args.backend {
        config.model.backend = backend.clone();
    }
    if let Some(dwell) = args.dwell {
        config.aggregator.dwell_frames = dwell;
    }
    if let Some(mode) = args.mode {
        config.runtime.mode = mode;
    }
    if let Some(max_frames) = args.max_frames {
        config.source.max_frames = Some(max_frames);
    }
    config.validate()?;
    Ok(config)
}

fn consume_results(receiver: ResultReceiver, mut status: StatusLine) {
    let mut last: Option<(usize, bool)> = None;
    loop {
        match receiver.recv_timeout(Duration::from_millis(250)) {
            SinkEvent::Result(result) => {
                let key = (result.label_index, result.stable);
                if last != Some(key) {
                    if result.stable {
                        log::info!(
                            "stable: {} ({:.2}) after {} frames",
                            result.label,
                            result.confidence,
                            result.run_length
                        );
                    } else if last.map(|(index, _)| index) != Some(result.label_index) {
                        log::info!("candidate: {} ({:.2})", result.label, result.confidence);
                    } else {
                        log::info!("unstable: {} ({:.2})", result.label, result.confidence);
                    }
                    last = Some(key);
                }
                status.update(&result);
            }
            SinkEvent::Cleared(sequence) => {
                if last.take().is_some() {
                    log::info!("cleared: nothing recognized (seq {})", sequence);
                }
                status.clear(sequence);
            }
            SinkEvent::Idle => {}
            SinkEvent::Failed(reason) => {
                status.finish(&format!("failed: {}", reason));
                return;
            }
            SinkEvent::Closed => {
                status.finish(&format!("stopped ({} results skipped)", receiver.dropped()));
                return;
            }
        }
    }
}
