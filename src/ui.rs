//! Terminal progress output for `amigod`.
//!
//! Startup stages (config, model load, source open) get a spinner that turns
//! into a check mark with the elapsed time. While the pipeline runs, a status
//! line shows the current label. On a non-TTY, or with `--ui plain`, stages are
//! printed as plain lines on stderr.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::aggregate::AggregatedResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl std::str::FromStr for UiMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "auto" => Ok(Self::Auto),
            "plain" => Ok(Self::Plain),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("unknown ui mode '{}' (auto, plain, pretty)", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    disable_pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool, disable_pretty: bool) -> Self {
        Self {
            mode,
            is_tty,
            disable_pretty,
        }
    }

    /// `disable_pretty` covers environments such as `NO_COLOR` or CI where
    /// `auto` should fall back to plain output.
    pub fn from_args(ui_flag: Option<&str>, is_tty: bool, disable_pretty: bool) -> Self {
        let mode = ui_flag
            .and_then(|flag| flag.parse().ok())
            .unwrap_or(UiMode::Auto);
        Self::new(mode, is_tty, disable_pretty)
    }

    fn use_pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.disable_pretty,
                UiMode::Plain => false,
            }
    }

    fn spinner(&self, message: String) -> Option<ProgressBar> {
        if !self.use_pretty() {
            return None;
        }
        let spinner = ProgressBar::new_spinner();
        spinner.set_draw_target(ProgressDrawTarget::stderr());
        spinner.enable_steady_tick(Duration::from_millis(120));
        let style = ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.set_message(message);
        Some(spinner)
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        let spinner = self.spinner(format!("{name}…"));
        if spinner.is_none() {
            eprintln!("==> {}", name);
        }
        StageGuard {
            name: name.to_string(),
            start: Instant::now(),
            spinner,
            failed: None,
        }
    }

    /// Live line for the running pipeline.
    pub fn status(&self, source: &str) -> StatusLine {
        let spinner = self.spinner(format!("{source}: waiting for frames"));
        if spinner.is_none() {
            eprintln!("==> watching {}", source);
        }
        StatusLine {
            source: source.to_string(),
            spinner,
        }
    }
}

/// Marks a startup stage done (or failed) when dropped.
pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    failed: Option<String>,
}

impl StageGuard {
    /// Report the stage as failed instead of done.
    pub fn fail(mut self, reason: impl std::fmt::Display) {
        self.failed = Some(reason.to_string());
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = format_duration(self.start.elapsed());
        let message = match &self.failed {
            Some(reason) => format!("✘ {} ({}): {}", self.name, elapsed, reason),
            None => format!("✔ {} ({})", self.name, elapsed),
        };
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

/// Shows the latest label on a spinner line. In plain mode label changes are
/// left to the log, so updates print nothing.
pub struct StatusLine {
    source: String,
    spinner: Option<ProgressBar>,
}

impl StatusLine {
    pub fn update(&mut self, result: &AggregatedResult) {
        if let Some(spinner) = &self.spinner {
            spinner.set_message(describe(&self.source, result));
        }
    }

    pub fn clear(&mut self, sequence: u64) {
        if let Some(spinner) = &self.spinner {
            spinner.set_message(format!("○ {}: nothing recognized (seq {})", self.source, sequence));
        }
    }

    pub fn finish(self, summary: &str) {
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(format!("■ {}: {}", self.source, summary)),
            None => eprintln!("■ {}: {}", self.source, summary),
        }
    }
}

fn describe(source: &str, result: &AggregatedResult) -> String {
    let marker = if result.stable { "●" } else { "○" };
    format!(
        "{} {}: {} {:.0}% (seq {})",
        marker,
        source,
        result.label,
        result.confidence * 100.0,
        result.sequence
    )
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
