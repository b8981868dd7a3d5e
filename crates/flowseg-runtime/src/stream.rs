use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::info;

use flowseg_core::{FrameSize, GeneratorError, SplitName};

use crate::config::StreamCaps;
use crate::generator::{BatchGenerator, GeneratorMetrics};
use crate::sink::Sink;
use crate::types::Batch;

const PERMIT_UNIT_BYTES: u64 = 1024;

/// Shared stop flag. Checked between batches; never interrupts a batch mid-build.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once the flag is set.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// The stream's own handle plus the generator-wide one.
#[derive(Debug, Clone)]
struct StopPair {
    stream: StopHandle,
    generator: StopHandle,
}

impl StopPair {
    fn is_stopped(&self) -> bool {
        self.stream.is_stopped() || self.generator.is_stopped()
    }

    async fn stopped(&self) {
        tokio::select! {
            _ = self.stream.stopped() => {}
            _ = self.generator.stopped() => {}
        }
    }
}

/// A built batch plus its share of the inflight-bytes budget, released on drop.
pub struct BatchLease {
    pub batch: Batch,
    pub bytes: u64,
    metrics: Arc<GeneratorMetrics>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BatchLease {
    fn drop(&mut self) {
        self.metrics.on_inflight_sub(self.bytes);
    }
}

/// Positions the producer claimed but never queued, in claim order. Filled when it exits.
type Undelivered = Arc<Mutex<Vec<Arc<[usize]>>>>;

pub struct BatchStream {
    pub rx: mpsc::Receiver<BatchLease>,
    pub task: JoinHandle<Result<()>>,
    stop: StopHandle,
    generator: Arc<BatchGenerator>,
    split: SplitName,
    undelivered: Undelivered,
}

impl BatchStream {
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stops this stream's producer (the generator keeps running), drains what is queued and
    /// returns the producer's result.
    ///
    /// Every batch claimed by this stream but not yet received is handed back to the split's
    /// cursor, so the next pull from the generator resumes at the first undelivered position.
    pub async fn shutdown(mut self) -> Result<()> {
        self.stop.stop();
        self.rx.close();
        let mut positions = Vec::new();
        while let Some(lease) = self.rx.recv().await {
            positions.extend(lease.batch.positions.iter().copied());
        }
        let res = self.task.await;

        let leftover = std::mem::take(
            &mut *self
                .undelivered
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        positions.extend(leftover.iter().flat_map(|p| p.iter().copied()));
        if !self.generator.is_stopped() {
            self.generator.give_back(self.split, positions)?;
        }
        res?
    }
}

/// Spawns a producer that streams batches of `split` in cursor order.
///
/// Up to `prefetch_batches` batches are built concurrently on blocking threads; they are
/// re-ordered by claim order before being queued, so consumers observe the same order as
/// sequential `next_batch` calls. The producer exits when the stream or the generator is
/// stopped, when every receiver is gone, or on the first build error.
pub fn spawn_stream(
    generator: Arc<BatchGenerator>,
    split: SplitName,
    batch_size: usize,
    target: FrameSize,
    caps: StreamCaps,
) -> Result<BatchStream> {
    caps.validate()?;
    generator.check_request(split, batch_size, target)?;

    let (tx, rx) = mpsc::channel::<BatchLease>(caps.max_queue_batches);
    let stop = StopHandle::new();
    let stops = StopPair {
        stream: stop.clone(),
        generator: generator.stop_handle(),
    };
    let undelivered = Undelivered::default();
    let task = tokio::spawn(run_producer(
        generator.clone(),
        tx,
        stops,
        split,
        batch_size,
        target,
        caps,
        undelivered.clone(),
    ));
    Ok(BatchStream {
        rx,
        task,
        stop,
        generator,
        split,
        undelivered,
    })
}

async fn lease_batch(
    batch: Batch,
    caps: StreamCaps,
    sem: &Arc<Semaphore>,
    metrics: &Arc<GeneratorMetrics>,
) -> Result<BatchLease> {
    let bytes = batch.tensor_bytes();
    anyhow::ensure!(
        bytes <= caps.max_inflight_bytes,
        "batch tensor bytes {} exceeds max_inflight_bytes {}",
        bytes,
        caps.max_inflight_bytes
    );
    let permit_units = bytes.div_ceil(PERMIT_UNIT_BYTES).max(1);
    anyhow::ensure!(
        permit_units <= u32::MAX as u64,
        "batch too large for permit accounting ({} units)",
        permit_units
    );
    let permit = sem.clone().acquire_many_owned(permit_units as u32).await?;
    metrics.on_inflight_add(bytes);
    Ok(BatchLease {
        batch,
        bytes,
        metrics: metrics.clone(),
        _permit: permit,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_producer(
    generator: Arc<BatchGenerator>,
    tx: mpsc::Sender<BatchLease>,
    stop: StopPair,
    split: SplitName,
    batch_size: usize,
    target: FrameSize,
    caps: StreamCaps,
    undelivered: Undelivered,
) -> Result<()> {
    let mut pending: BTreeMap<u64, Arc<[usize]>> = BTreeMap::new();
    let res = produce_batches(
        generator,
        tx,
        stop,
        split,
        batch_size,
        target,
        caps,
        &mut pending,
    )
    .await;
    *undelivered.lock().unwrap_or_else(PoisonError::into_inner) =
        pending.into_values().collect();
    res
}

/// `pending` tracks the positions of every claimed batch until it is queued.
#[allow(clippy::too_many_arguments)]
async fn produce_batches(
    generator: Arc<BatchGenerator>,
    tx: mpsc::Sender<BatchLease>,
    stop: StopPair,
    split: SplitName,
    batch_size: usize,
    target: FrameSize,
    caps: StreamCaps,
    pending: &mut BTreeMap<u64, Arc<[usize]>>,
) -> Result<()> {
    let prefetch = std::cmp::max(1, caps.prefetch_batches);
    let max_units = caps.max_inflight_bytes.div_ceil(PERMIT_UNIT_BYTES).max(1);
    let sem = Arc::new(Semaphore::new(
        usize::try_from(max_units).unwrap_or(Semaphore::MAX_PERMITS),
    ));
    let metrics = generator.metrics();

    info!(
        target: "flowseg_proof",
        event = "stream_started",
        split = %split,
        batch_size = batch_size as u64,
        target_h = target.height,
        target_w = target.width,
        prefetch_batches = prefetch as u64,
        max_queue_batches = caps.max_queue_batches as u64,
        "stream started"
    );

    let mut joinset = JoinSet::new();
    let mut buffer: BTreeMap<u64, Batch> = BTreeMap::new();
    let mut next_to_send: u64 = 0;
    let mut next_batch_id: u64 = 0;
    let mut sent: u64 = 0;

    'produce: loop {
        while !stop.is_stopped() && !tx.is_closed() && joinset.len() < prefetch {
            let claimed = match generator.claim(split, batch_size) {
                Ok(claimed) => claimed,
                // Stopped between the check above and the claim.
                Err(GeneratorError::Stopped) => break 'produce,
                Err(e) => return Err(e.into()),
            };
            let batch_id = next_batch_id;
            next_batch_id = next_batch_id.saturating_add(1);
            pending.insert(batch_id, claimed.samples.iter().map(|s| s.position).collect());
            let generator = generator.clone();
            joinset.spawn_blocking(move || (batch_id, generator.build(&claimed, target)));
        }

        let Some(res) = joinset.join_next().await else {
            break;
        };
        let (batch_id, built) = res.map_err(anyhow::Error::from)?;
        buffer.insert(batch_id, built?);

        while let Some(batch) = buffer.remove(&next_to_send) {
            let lease = tokio::select! {
                biased;
                _ = stop.stopped() => break 'produce,
                leased = lease_batch(batch, caps, &sem, &metrics) => leased?,
            };
            let delivered = tokio::select! {
                biased;
                _ = stop.stopped() => break 'produce,
                res = tx.send(lease) => res.is_ok(),
            };
            if !delivered {
                break 'produce;
            }
            pending.remove(&next_to_send);
            next_to_send = next_to_send.saturating_add(1);
            sent = sent.saturating_add(1);
        }
    }

    info!(
        target: "flowseg_proof",
        event = "stream_stopped",
        split = %split,
        batches_sent = sent,
        stopped = stop.is_stopped(),
        receivers_closed = tx.is_closed(),
        "stream stopped"
    );
    if let Some(reason) = generator.failure() {
        anyhow::bail!("generator aborted: {reason}");
    }
    Ok(())
}

/// Drains `stream` into `sink` until the producer ends or `limit` batches were delivered.
///
/// Delivery runs on a blocking thread and the lease is held until the sink returns, so a slow
/// sink exerts backpressure through both the queue and the inflight-bytes budget.
pub async fn drive_sink<S: Sink>(
    mut stream: BatchStream,
    sink: Arc<S>,
    metrics: Arc<GeneratorMetrics>,
    limit: Option<u64>,
) -> Result<u64> {
    let mut delivered: u64 = 0;
    while limit.map_or(true, |l| delivered < l) {
        let Some(inflight) = stream.rx.recv().await else {
            break;
        };
        let bytes = inflight.bytes;
        let sample_count = inflight.batch.sample_count() as u64;
        let sink = sink.clone();
        tokio::task::spawn_blocking(move || {
            let res = sink.deliver(&inflight.batch);
            drop(inflight);
            res
        })
        .await
        .map_err(anyhow::Error::from)??;

        delivered += 1;
        metrics.delivered_batches_total.inc();
        metrics.delivered_samples_total.inc_by(sample_count);
        info!(
            target: "flowseg_proof",
            event = "delivered",
            batch_bytes = bytes,
            inflight_bytes = metrics.inflight_bytes.get(),
            "delivered batch"
        );
    }

    if limit.is_some_and(|l| delivered >= l) {
        stream.shutdown().await?;
    } else {
        stream.task.await??;
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_handle_wakes_waiters() {
        let stop = StopHandle::new();
        assert!(!stop.is_stopped());
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.stopped().await })
        };
        stop.stop();
        waiter.await.unwrap();
        assert!(stop.is_stopped());
    }
}
