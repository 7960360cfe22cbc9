use std::sync::Arc;

use crate::error::PipelineError;
use crate::infer::LabelSet;

/// Allowed deviation of a distribution's sum from 1.0.
pub const PROBABILITY_TOLERANCE: f32 = 1e-3;

#[derive(Clone, Debug, PartialEq)]
pub struct ClassScore {
    pub index: usize,
    pub label: Arc<str>,
    pub probability: f32,
}

/// Per-frame probability distribution over the full label set, in label order.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    /// Sequence number of the source frame.
    pub sequence: u64,
    scores: Vec<ClassScore>,
}

impl Prediction {
    /// Build a prediction, enforcing the distribution invariants: one entry per
    /// label, every value finite and non-negative, sum within tolerance of 1.
    pub fn new(
        sequence: u64,
        labels: &LabelSet,
        probabilities: &[f32],
    ) -> Result<Self, PipelineError> {
        if probabilities.len() != labels.len() {
            return Err(PipelineError::Inference(format!(
                "expected {} probabilities, got {}",
                labels.len(),
                probabilities.len()
            )));
        }
        if !is_distribution(probabilities) {
            return Err(PipelineError::Inference(
                "output is not a probability distribution".to_string(),
            ));
        }
        let scores = labels
            .iter()
            .zip(probabilities)
            .enumerate()
            .map(|(index, (label, &probability))| ClassScore {
                index,
                label: label.clone(),
                probability,
            })
            .collect();
        Ok(Self { sequence, scores })
    }

    pub fn scores(&self) -> &[ClassScore] {
        &self.scores
    }

    /// Highest-probability class. Ties go to the lowest index.
    pub fn top(&self) -> Option<&ClassScore> {
        let mut best: Option<&ClassScore> = None;
        for score in &self.scores {
            if best.map_or(true, |b| score.probability > b.probability) {
                best = Some(score);
            }
        }
        best
    }
}

pub(crate) fn is_distribution(values: &[f32]) -> bool {
    if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return false;
    }
    let sum: f32 = values.iter().sum();
    (sum - 1.0).abs() <= PROBABILITY_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> LabelSet {
        LabelSet::new(["a", "b", "c"]).expect("labels")
    }

    #[test]
    fn builds_in_label_order() -> Result<(), PipelineError> {
        let p = Prediction::new(7, &labels(), &[0.2, 0.5, 0.3])?;
        assert_eq!(p.sequence, 7);
        let names: Vec<&str> = p.scores().iter().map(|s| &*s.label).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(p.top().map(|s| s.index), Some(1));
        assert_eq!(p.scores()[2].probability, 0.3);
        Ok(())
    }

    #[test]
    fn ties_resolve_to_lowest_index() -> Result<(), PipelineError> {
        let p = Prediction::new(1, &labels(), &[0.4, 0.4, 0.2])?;
        assert_eq!(p.top().map(|s| &*s.label), Some("a"));
        Ok(())
    }

    #[test]
    fn rejects_invalid_distributions() {
        assert!(Prediction::new(1, &labels(), &[0.5, 0.5]).is_err());
        assert!(Prediction::new(1, &labels(), &[0.5, 0.6, 0.1]).is_err());
        assert!(Prediction::new(1, &labels(), &[1.2, -0.1, -0.1]).is_err());
        assert!(Prediction::new(1, &labels(), &[f32::NAN, 0.5, 0.5]).is_err());
        assert!(Prediction::new(1, &labels(), &[0.3334, 0.3333, 0.3333]).is_ok());
    }
}
