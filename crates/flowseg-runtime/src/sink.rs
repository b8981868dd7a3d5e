use anyhow::Result;

use crate::types::Batch;

/// Consumer of streamed batches (a training step, a writer, a benchmark).
///
/// Delivery is synchronous and runs on a blocking thread; a slow sink holds its batch's
/// inflight bytes and so throttles the producer.
pub trait Sink: Send + Sync + 'static {
    fn deliver(&self, batch: &Batch) -> Result<()>;
}
