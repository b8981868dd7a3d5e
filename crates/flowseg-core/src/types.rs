use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Named partition of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitName {
    Train,
    Val,
    Test,
}

impl SplitName {
    pub const ALL: [SplitName; 3] = [SplitName::Train, SplitName::Val, SplitName::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            SplitName::Train => "train",
            SplitName::Val => "val",
            SplitName::Test => "test",
        }
    }
}

impl fmt::Display for SplitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown split {0:?} (expected: train|val|test)")]
pub struct SplitParseError(pub String);

impl FromStr for SplitName {
    type Err = SplitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(SplitName::Train),
            "val" | "valid" | "validation" => Ok(SplitName::Val),
            "test" => Ok(SplitName::Test),
            _ => Err(SplitParseError(s.to_string())),
        }
    }
}

/// One training example: a frame pair and the label of the current frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sample {
    pub prev_frame: PathBuf,
    pub curr_frame: PathBuf,
    pub label: PathBuf,
}

impl Sample {
    pub fn new(
        prev_frame: impl Into<PathBuf>,
        curr_frame: impl Into<PathBuf>,
        label: impl Into<PathBuf>,
    ) -> Self {
        Self {
            prev_frame: prev_frame.into(),
            curr_frame: curr_frame.into(),
            label: label.into(),
        }
    }
}

/// Spatial size in `(height, width)` order, matching the `(B, H, W, C)` batch layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    pub height: u32,
    pub width: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameSizeError {
    #[error("frame size must be non-zero, got {0}")]
    ZeroDimension(FrameSize),
    #[error("scale factor must be > 0")]
    ZeroFactor,
    #[error("frame size {size} is not divisible by scale factor {factor}")]
    NotDivisible { size: FrameSize, factor: u32 },
}

impl FrameSize {
    pub const fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }

    pub fn pixels(&self) -> usize {
        self.height as usize * self.width as usize
    }

    pub fn validate(&self) -> Result<(), FrameSizeError> {
        if self.height == 0 || self.width == 0 {
            return Err(FrameSizeError::ZeroDimension(*self));
        }
        Ok(())
    }

    /// Exact downscale by `factor`. Sizes that do not divide evenly are rejected rather than
    /// truncated.
    pub fn scaled_down(&self, factor: u32) -> Result<FrameSize, FrameSizeError> {
        self.validate()?;
        if factor == 0 {
            return Err(FrameSizeError::ZeroFactor);
        }
        if self.height % factor != 0 || self.width % factor != 0 {
            return Err(FrameSizeError::NotDivisible {
                size: *self,
                factor,
            });
        }
        Ok(FrameSize::new(self.height / factor, self.width / factor))
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_name_parses_aliases() {
        assert_eq!("train".parse::<SplitName>().unwrap(), SplitName::Train);
        assert_eq!(" VAL ".parse::<SplitName>().unwrap(), SplitName::Val);
        assert_eq!("validation".parse::<SplitName>().unwrap(), SplitName::Val);
        assert!("holdout".parse::<SplitName>().is_err());
    }

    #[test]
    fn split_name_display_roundtrips() {
        for split in SplitName::ALL {
            assert_eq!(split.to_string().parse::<SplitName>().unwrap(), split);
        }
    }
}
