use std::path::PathBuf;

use thiserror::Error;

use crate::index::IndexError;
use crate::types::{FrameSizeError, SplitName, SplitParseError};

/// Errors surfaced by the batch-generation pipeline.
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("dataset index not loaded; call load() before streaming")]
    NotLoaded,
    #[error("failed to decode image {path}: {reason}")]
    ImageDecode { path: PathBuf, reason: String },
    #[error("unsupported optical flow algorithm {0:?} (expected: lk|pyr_lk|dis)")]
    UnsupportedFlowAlgorithm(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("unknown split {0:?}")]
    UnknownSplit(String),
    #[error("split {0} has no samples")]
    EmptySplit(SplitName),
    #[error("dataset index error: {0}")]
    Index(#[from] IndexError),
    #[error("generator stopped")]
    Stopped,
    #[error("generator aborted after a fatal error: {0}")]
    Aborted(String),
}

impl GeneratorError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        GeneratorError::InvalidConfiguration(reason.into())
    }

    pub fn decode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        GeneratorError::ImageDecode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<FrameSizeError> for GeneratorError {
    fn from(err: FrameSizeError) -> Self {
        GeneratorError::InvalidConfiguration(err.to_string())
    }
}

impl From<SplitParseError> for GeneratorError {
    fn from(err: SplitParseError) -> Self {
        GeneratorError::UnknownSplit(err.0)
    }
}
