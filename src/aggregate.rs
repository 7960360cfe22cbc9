//! Temporal aggregation of per-frame predictions.
//!
//! Raw per-frame classification flickers at camera rates. The aggregator only
//! reports a label as stable once it has topped `dwell_frames` consecutive
//! predictions, and reports confidence as an exponential moving average of the
//! top-label probability over the current run. A prediction under
//! `min_confidence` ends the run; if a label was being reported, the caller is
//! told it is gone (`Cleared`).
//!
//! State machine:
//!
//! ```text
//!            top label differs (run = 1)
//!   Idle ──────────────────────────────► Accumulating(label, run)
//!    ▲                                      │   ▲        │ run reaches dwell
//!    │ top below min_confidence             │   └────────┘ same label: run + 1
//!    └──────────────────────────────────────┤            ▼
//!                                           │       Stable(label)
//!                                           ◄────────────┘ top label differs
//! ```

use std::sync::Arc;

use crate::infer::Prediction;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AggregatorConfig {
    /// Consecutive agreeing predictions before a label is stable.
    pub dwell_frames: u32,
    /// EMA weight of the newest probability, in `(0, 1]`.
    pub smoothing: f32,
    /// Predictions whose top probability is below this reset to `Idle`.
    pub min_confidence: f32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            dwell_frames: 5,
            smoothing: 0.3,
            min_confidence: 0.5,
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.dwell_frames == 0 {
            return Err("dwell_frames must be at least 1".to_string());
        }
        if !(self.smoothing > 0.0 && self.smoothing <= 1.0) {
            return Err(format!("smoothing {} outside (0, 1]", self.smoothing));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(format!(
                "min_confidence {} outside [0, 1]",
                self.min_confidence
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AggregatorState {
    Idle,
    Accumulating { label: Arc<str>, run_length: u32 },
    Stable { label: Arc<str> },
}

/// What the presentation layer receives.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregatedResult {
    pub label: Arc<str>,
    pub label_index: usize,
    /// Smoothed top-label probability.
    pub confidence: f32,
    /// True once the label has held for the dwell window.
    pub stable: bool,
    /// Consecutive predictions agreeing on `label`.
    pub run_length: u32,
    /// Sequence number of the frame that produced this result.
    pub sequence: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    Updated(AggregatedResult),
    /// Top probability under `min_confidence` while already `Idle`.
    Suppressed,
    /// Top probability under `min_confidence` ended a run; state returned to
    /// `Idle` and the previously reported label no longer applies.
    Cleared { sequence: u64 },
    /// Sequence number not newer than the last accepted one.
    OutOfOrder { sequence: u64, last: u64 },
    /// Prediction does not cover the aggregator's label set.
    LabelMismatch { expected: usize, actual: usize },
}

struct Candidate {
    index: usize,
    label: Arc<str>,
    run_length: u32,
    ema: f32,
}

pub struct TemporalAggregator {
    config: AggregatorConfig,
    label_count: usize,
    candidate: Option<Candidate>,
    last_sequence: Option<u64>,
}

impl TemporalAggregator {
    pub fn new(config: AggregatorConfig, label_count: usize) -> Self {
        Self {
            config,
            label_count,
            candidate: None,
            last_sequence: None,
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn state(&self) -> AggregatorState {
        match &self.candidate {
            None => AggregatorState::Idle,
            Some(c) if c.run_length >= self.config.dwell_frames => AggregatorState::Stable {
                label: c.label.clone(),
            },
            Some(c) => AggregatorState::Accumulating {
                label: c.label.clone(),
                run_length: c.run_length,
            },
        }
    }

    /// Feed the next prediction.
    pub fn observe(&mut self, prediction: &Prediction) -> Observation {
        if let Some(last) = self.last_sequence {
            if prediction.sequence <= last {
                log::warn!(
                    "aggregator: dropping out-of-order prediction seq={} (last={})",
                    prediction.sequence,
                    last
                );
                return Observation::OutOfOrder {
                    sequence: prediction.sequence,
                    last,
                };
            }
        }
        let actual = prediction.scores().len();
        if actual != self.label_count {
            log::warn!(
                "aggregator: prediction seq={} has {} classes, expected {}",
                prediction.sequence,
                actual,
                self.label_count
            );
            return Observation::LabelMismatch {
                expected: self.label_count,
                actual,
            };
        }
        let Some(top) = prediction.top() else {
            return Observation::LabelMismatch {
                expected: self.label_count,
                actual,
            };
        };
        self.last_sequence = Some(prediction.sequence);

        if top.probability < self.config.min_confidence {
            return match self.candidate.take() {
                Some(_) => Observation::Cleared {
                    sequence: prediction.sequence,
                },
                None => Observation::Suppressed,
            };
        }

        let alpha = self.config.smoothing;
        let candidate = match self.candidate.take() {
            Some(mut c) if c.index == top.index => {
                c.run_length = c.run_length.saturating_add(1);
                c.ema = alpha * top.probability + (1.0 - alpha) * c.ema;
                c
            }
            _ => Candidate {
                index: top.index,
                label: top.label.clone(),
                run_length: 1,
                ema: top.probability,
            },
        };

        let result = AggregatedResult {
            label: candidate.label.clone(),
            label_index: candidate.index,
            confidence: candidate.ema,
            stable: candidate.run_length >= self.config.dwell_frames,
            run_length: candidate.run_length,
            sequence: prediction.sequence,
        };
        self.candidate = Some(candidate);
        Observation::Updated(result)
    }

    /// Forget the current run and the sequence high-water mark.
    pub fn reset(&mut self) {
        self.candidate = None;
        self.last_sequence = None;
    }
}
