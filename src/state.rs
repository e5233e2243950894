use crate::config::{LabelsConfig, Validatable};
use std::{
    collections::HashSet,
    fs::File,
    io::{self, BufRead},
    path::Path,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelsError {
    #[error("Failed to read labels file: {0}")]
    Io(#[from] io::Error),
    #[error("Labels file contains no labels")]
    Empty,
    #[error("Duplicate label: {0}")]
    Duplicate(String),
}

/// Ordered class names, index-aligned with the model's output vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassLabels {
    labels: Vec<String>,
}

impl ClassLabels {
    pub fn new(labels: Vec<String>) -> Result<Self, LabelsError> {
        if labels.is_empty() {
            return Err(LabelsError::Empty);
        }

        let mut seen = HashSet::new();
        for label in &labels {
            if !seen.insert(label.as_str()) {
                return Err(LabelsError::Duplicate(label.clone()));
            }
        }

        Ok(Self { labels })
    }

    pub fn from_config(labels_cfg: &LabelsConfig) -> Result<Self, LabelsError> {
        let labels = load_class_labels(&labels_cfg.get_path())?;
        Self::new(labels)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.labels
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// One label per line; surrounding whitespace is trimmed and blank lines skipped.
pub fn load_class_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.trim();
        if label.is_empty() {
            continue;
        }
        labels.push(label.to_string());
    }

    Ok(labels)
}
