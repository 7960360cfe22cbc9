//! Result delivery to the presentation layer.
//!
//! `publish` never blocks the pipeline. The provided `LatestResultSink` keeps
//! only the newest undelivered update (a result or a clear), so a slow UI sees
//! fresh state instead of a backlog. A fatal pipeline error is delivered once
//! through `fail`, after which the channel is closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::aggregate::AggregatedResult;
use crate::error::PipelineError;
use crate::handoff::{LatestSlot, Take};

/// Consumer of aggregated results.
pub trait ResultSink: Send + Sync {
    /// Deliver a result. Must return promptly.
    fn publish(&self, result: AggregatedResult);

    /// The previously published label no longer applies: frame `sequence` fell
    /// under the confidence floor. Must return promptly.
    fn clear(&self, _sequence: u64) {}

    /// Terminal failure notification; called at most once per pipeline run.
    fn fail(&self, _error: &PipelineError) {}
}

/// What a `ResultReceiver` yields.
#[derive(Clone, Debug, PartialEq)]
pub enum SinkEvent {
    Result(AggregatedResult),
    /// Nothing is recognized any more, as of this frame sequence.
    Cleared(u64),
    /// The pipeline stopped on a fatal error; no further events follow.
    Failed(String),
    /// Nothing arrived within the timeout.
    Idle,
    /// The pipeline shut down cleanly.
    Closed,
}

struct Shared {
    slot: LatestSlot<SinkEvent>,
    failure: Mutex<Option<String>>,
    failed: AtomicBool,
}

/// Latest-wins sink. Updates displaced before the receiver took them are
/// counted as dropped.
pub struct LatestResultSink {
    shared: Arc<Shared>,
}

/// Consumer end of a `LatestResultSink`.
pub struct ResultReceiver {
    shared: Arc<Shared>,
}

/// Create a connected sink/receiver pair.
pub fn result_channel() -> (LatestResultSink, ResultReceiver) {
    let shared = Arc::new(Shared {
        slot: LatestSlot::new(),
        failure: Mutex::new(None),
        failed: AtomicBool::new(false),
    });
    (
        LatestResultSink {
            shared: Arc::clone(&shared),
        },
        ResultReceiver { shared },
    )
}

impl LatestResultSink {
    /// Hand `event` to the receiver unless the channel is closed.
    fn deliver(&self, event: SinkEvent) {
        if self.shared.slot.is_closed() {
            return;
        }
        if self.shared.slot.put(event).is_some() {
            log::debug!("sink: receiver lagging, replaced pending update");
        }
    }
}

impl ResultSink for LatestResultSink {
    fn publish(&self, result: AggregatedResult) {
        self.deliver(SinkEvent::Result(result));
    }

    fn clear(&self, sequence: u64) {
        self.deliver(SinkEvent::Cleared(sequence));
    }

    fn fail(&self, error: &PipelineError) {
        if self.shared.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut failure) = self.shared.failure.lock() {
            *failure = Some(error.to_string());
        }
        self.shared.slot.close();
    }
}

impl Drop for LatestResultSink {
    fn drop(&mut self) {
        self.shared.slot.close();
    }
}

impl ResultReceiver {
    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> SinkEvent {
        match self.shared.slot.take_timeout(timeout) {
            Take::Item(event) => event,
            Take::Empty => SinkEvent::Idle,
            Take::Closed => self.terminal(),
        }
    }

    pub fn try_recv(&self) -> SinkEvent {
        match self.shared.slot.try_take() {
            Take::Item(event) => event,
            Take::Empty => SinkEvent::Idle,
            Take::Closed => self.terminal(),
        }
    }

    /// Updates replaced before this receiver took them.
    pub fn dropped(&self) -> u64 {
        self.shared.slot.displaced()
    }

    fn terminal(&self) -> SinkEvent {
        let failure = self
            .shared
            .failure
            .lock()
            .ok()
            .and_then(|failure| failure.clone());
        match failure {
            Some(reason) => SinkEvent::Failed(reason),
            None => SinkEvent::Closed,
        }
    }
}

/// Sink that logs every result; used when nothing consumes results.
#[derive(Default)]
pub struct LogSink {
    last: Mutex<Option<(usize, bool)>>,
}

impl ResultSink for LogSink {
    fn publish(&self, result: AggregatedResult) {
        let key = (result.label_index, result.stable);
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        if *last != Some(key) {
            log::info!(
                "result: {} ({:.2}){}",
                result.label,
                result.confidence,
                if result.stable { " [stable]" } else { "" }
            );
            *last = Some(key);
        }
    }

    fn clear(&self, sequence: u64) {
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        if last.take().is_some() {
            log::info!("result: cleared at seq={}", sequence);
        }
    }

    fn fail(&self, error: &PipelineError) {
        log::error!("pipeline failed: {}", error);
    }
}
