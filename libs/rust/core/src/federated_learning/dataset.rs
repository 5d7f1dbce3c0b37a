//! Coordinator-held test set used for centralized evaluation.

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: PathBuf, #[source] source: serde_json::Error },
    #[error("held-out set has no samples")]
    Empty,
    #[error("sample {index} has {found} features, expected {expected}")]
    FeatureWidth { index: usize, expected: usize, found: usize },
    #[error("sample {index} has label {label}, but only {num_classes} classes are declared")]
    LabelOutOfRange { index: usize, label: usize, num_classes: usize },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub features: Vec<f32>,
    pub label: usize,
}

/// Labelled samples plus the class count they were drawn from. Read-only for the run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeldOutSet {
    pub num_classes: usize,
    pub samples: Vec<Sample>,
}

impl HeldOutSet {
    pub fn new(num_classes: usize, samples: Vec<Sample>) -> Result<Self, DatasetError> {
        let set = Self { num_classes, samples };
        set.validate()?;
        Ok(set)
    }

    /// Reads `{"num_classes": N, "samples": [{"features": [...], "label": k}, ...]}`.
    pub fn load_json(path: &Path) -> Result<Self, DatasetError> {
        let bytes = std::fs::read(path).map_err(|source| DatasetError::Io { path: path.to_path_buf(), source })?;
        let set: HeldOutSet = serde_json::from_slice(&bytes).map_err(|source| DatasetError::Parse { path: path.to_path_buf(), source })?;
        set.validate()?;
        Ok(set)
    }

    fn validate(&self) -> Result<(), DatasetError> {
        let expected = self.samples.first().ok_or(DatasetError::Empty)?.features.len();
        for (index, s) in self.samples.iter().enumerate() {
            if s.features.len() != expected { return Err(DatasetError::FeatureWidth { index, expected, found: s.features.len() }); }
            if s.label >= self.num_classes { return Err(DatasetError::LabelOutOfRange { index, label: s.label, num_classes: self.num_classes }); }
        }
        Ok(())
    }

    pub fn len(&self) -> usize { self.samples.len() }
    pub fn is_empty(&self) -> bool { self.samples.is_empty() }
    pub fn feature_dim(&self) -> usize { self.samples.first().map(|s| s.features.len()).unwrap_or(0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_valid_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"num_classes":2,"samples":[{{"features":[0.0,1.0],"label":1}},{{"features":[1.0,0.0],"label":0}}]}}"#).unwrap();
        let set = HeldOutSet::load_json(f.path()).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.feature_dim(), 2);
    }

    #[test]
    fn rejects_ragged_and_out_of_range_samples() {
        let ragged = vec![Sample { features: vec![0.0, 1.0], label: 0 }, Sample { features: vec![0.0], label: 0 }];
        assert!(matches!(HeldOutSet::new(2, ragged), Err(DatasetError::FeatureWidth { index: 1, expected: 2, found: 1 })));
        let bad_label = vec![Sample { features: vec![0.0], label: 3 }];
        assert!(matches!(HeldOutSet::new(2, bad_label), Err(DatasetError::LabelOutOfRange { label: 3, .. })));
        assert!(matches!(HeldOutSet::new(2, vec![]), Err(DatasetError::Empty)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = HeldOutSet::load_json(Path::new("/nonexistent/testset.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/testset.json"));
    }
}
