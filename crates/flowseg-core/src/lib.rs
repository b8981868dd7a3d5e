#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod cityscapes;
pub mod error;
pub mod index;
pub mod types;

pub use error::GeneratorError;
pub use index::{DatasetIndex, IndexError, ManifestIndex, MemoryIndex};
pub use types::{FrameSize, FrameSizeError, Sample, SplitName, SplitParseError};
