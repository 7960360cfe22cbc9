use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

use crate::error::PipelineError;

/// Ordered class labels, index-aligned with the model's output vector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelSet {
    labels: Arc<[Arc<str>]>,
}

impl LabelSet {
    pub fn new<I, S>(labels: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let labels: Vec<Arc<str>> = labels
            .into_iter()
            .map(|label| Arc::from(label.as_ref().trim()))
            .collect();
        if labels.is_empty() {
            return Err(PipelineError::ModelLoad("label set is empty".to_string()));
        }
        if let Some(pos) = labels.iter().position(|label| label.is_empty()) {
            return Err(PipelineError::ModelLoad(format!(
                "label {} is blank",
                pos
            )));
        }
        Ok(Self {
            labels: labels.into(),
        })
    }

    /// One label per line. Trailing blank lines are ignored, interior blank lines
    /// are an error because they would shift every following index.
    pub fn parse(contents: &str) -> Result<Self, PipelineError> {
        let lines: Vec<&str> = contents.lines().collect();
        let end = lines
            .iter()
            .rposition(|line| !line.trim().is_empty())
            .map_or(0, |last| last + 1);
        Self::new(&lines[..end])
    }

    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::ModelLoad(format!("failed to read labels {}: {}", path.display(), e))
        })?;
        let labels = Self::parse(&contents).map_err(|e| match e {
            PipelineError::ModelLoad(msg) => {
                PipelineError::ModelLoad(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;
        log::info!(
            "labels loaded from {} ({} entries, sha256 {})",
            path.display(),
            labels.len(),
            hex::encode(Sha256::digest(contents.as_bytes()))
        );
        Ok(labels)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<str>> {
        self.labels.get(index)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| &**l == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<str>> {
        self.labels.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trims_and_drops_trailing_blank_lines() -> Result<(), PipelineError> {
        let labels = LabelSet::parse("cat\r\n dog \nbird\n\n\n")?;
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.get(1).map(|l| &**l), Some("dog"));
        assert_eq!(labels.index_of("bird"), Some(2));
        Ok(())
    }

    #[test]
    fn interior_blank_line_is_rejected() {
        assert!(matches!(
            LabelSet::parse("cat\n\ndog\n"),
            Err(PipelineError::ModelLoad(_))
        ));
    }

    #[test]
    fn empty_file_is_rejected() {
        assert!(LabelSet::parse("\n\n").is_err());
        assert!(LabelSet::new(Vec::<String>::new()).is_err());
    }

    #[test]
    fn missing_file_is_a_model_load_error() {
        let err = LabelSet::from_file(Path::new("/nonexistent/labels.txt"))
            .err()
            .expect("must fail");
        assert!(matches!(err, PipelineError::ModelLoad(_)));
    }
}
