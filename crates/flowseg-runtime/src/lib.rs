#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod augment;
pub mod config;
pub mod cursor;
pub mod generator;
pub mod sink;
pub mod source;
pub mod stream;
pub mod synthetic;
pub mod types;

pub use config::{ComputeBackend, FlipPolicy, GeneratorConfig, StreamCaps};
pub use generator::{BatchGenerator, GeneratorMetrics};
pub use stream::{drive_sink, spawn_stream, BatchLease, BatchStream, StopHandle};
pub use types::{Batch, BatchInputs};
