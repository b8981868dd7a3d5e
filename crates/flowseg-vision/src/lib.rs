#![cfg_attr(not(test), forbid(unsafe_code))]
#![cfg_attr(test, deny(unsafe_code))]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Per-sample tensor production: frame preprocessing, dense optical flow and
//! palette-based label encoding.

pub mod flow;
pub mod labels;
pub mod palette;
pub mod preprocess;

pub use flow::{to_visualization, warp, FlowAlgorithm, FlowEstimator, FlowField, FlowParams};
pub use labels::{decode, resolve_class_id, LabelEncoder, LabelImage, LabelPixel, OneHotTensor};
pub use palette::{parse_palette_tsv, LabelKey, Palette, PaletteEntry, PaletteError};
pub use preprocess::{
    denormalize, normalize, to_gray, FsImageReader, ImagePreprocessor, ImageReader,
    MemoryImageReader, ResizeBackend,
};
