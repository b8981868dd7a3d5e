#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{info, info_span, warn, Instrument};

use flowseg_core::cityscapes::CityscapesConfig;
use flowseg_core::{DatasetIndex, FrameSize, SplitName};
use flowseg_observe::metrics::{Counter, Gauge};
use flowseg_runtime::sink::Sink;
use flowseg_runtime::source::{open_palette, DatasetSource};
use flowseg_runtime::synthetic::SyntheticClip;
use flowseg_runtime::{
    drive_sink, spawn_stream, Batch, BatchGenerator, ComputeBackend, FlipPolicy,
    GeneratorConfig, GeneratorMetrics, StreamCaps,
};
use flowseg_vision::{FsImageReader, ImageReader, LabelKey};

#[derive(Debug, Parser)]
#[command(name = "flowseg-demo")]
struct Args {
    #[arg(long, env = "FLOWSEG_MANIFEST")]
    manifest: Option<PathBuf>,

    #[arg(long, env = "FLOWSEG_CITYSCAPES_ROOT")]
    cityscapes_root: Option<PathBuf>,

    #[arg(long, env = "FLOWSEG_PREV_SKIP", default_value_t = 0)]
    prev_skip: u32,

    #[arg(long, env = "FLOWSEG_DEBUG_SAMPLES", default_value_t = 0)]
    debug_samples: usize,

    #[arg(long, env = "FLOWSEG_SYNTHETIC_SAMPLES", default_value_t = 32)]
    synthetic_samples: usize,

    #[arg(long, env = "FLOWSEG_SPLIT", default_value = "train")]
    split: String,

    #[arg(long, env = "FLOWSEG_TARGET_HEIGHT", default_value_t = 128)]
    height: u32,

    #[arg(long, env = "FLOWSEG_TARGET_WIDTH", default_value_t = 256)]
    width: u32,

    #[arg(long, env = "FLOWSEG_BATCH_SIZE", default_value_t = 4)]
    batch_size: usize,

    /// Independent consumers pulling from one generator (direct mode).
    #[arg(long, env = "FLOWSEG_CONSUMERS", default_value_t = 2)]
    consumers: usize,

    #[arg(long, env = "FLOWSEG_BATCHES_PER_CONSUMER", default_value_t = 8)]
    batches_per_consumer: u64,

    /// Feed one sink through the prefetching channel producer instead of direct pulls.
    #[arg(long, env = "FLOWSEG_STREAM", default_value_t = false)]
    stream: bool,

    #[arg(long, env = "FLOWSEG_FLOW_ALGORITHM", default_value = "dis")]
    flow_algorithm: String,

    #[arg(long, env = "FLOWSEG_FLIP_POLICY", default_value = "random")]
    flip_policy: String,

    #[arg(long, env = "FLOWSEG_SEED")]
    seed: Option<u64>,

    /// Label downscale factors, e.g. `4,8,16`.
    #[arg(long, env = "FLOWSEG_LABEL_SCALES", value_delimiter = ',', default_value = "1")]
    label_scales: Vec<u32>,

    #[arg(long, env = "FLOWSEG_WITH_DIFF", default_value_t = false)]
    with_diff: bool,

    /// Rayon threads per batch (0 = sequential).
    #[arg(long, env = "FLOWSEG_COMPUTE_THREADS", default_value_t = 0)]
    compute_threads: usize,

    #[arg(long, env = "FLOWSEG_PALETTE")]
    palette: Option<PathBuf>,

    #[arg(long, env = "FLOWSEG_MAX_QUEUE_BATCHES", default_value_t = 4)]
    max_queue_batches: usize,

    #[arg(long, env = "FLOWSEG_PREFETCH_BATCHES", default_value_t = 2)]
    prefetch_batches: usize,

    #[arg(long, env = "FLOWSEG_MAX_INFLIGHT_BYTES", default_value_t = 512 * 1024 * 1024)]
    max_inflight_bytes: u64,

    /// Artificially slow down delivery to show backpressure.
    #[arg(long, env = "FLOWSEG_SINK_SLEEP_MS", default_value_t = 0)]
    sink_sleep_ms: u64,

    /// Periodically emit a metrics snapshot (0 disables).
    #[arg(long, env = "FLOWSEG_METRICS_SNAPSHOT_INTERVAL_MS", default_value_t = 1000)]
    metrics_snapshot_interval_ms: u64,
}

struct SlowSink {
    sleep: Duration,
    delivered_batches_total: Counter,
    delivered_samples_total: Counter,
    flipped_samples_total: Counter,
    last_tensor_bytes: Gauge,
}

impl SlowSink {
    fn new(sleep: Duration) -> Self {
        Self {
            sleep,
            delivered_batches_total: Counter::default(),
            delivered_samples_total: Counter::default(),
            flipped_samples_total: Counter::default(),
            last_tensor_bytes: Gauge::default(),
        }
    }
}

impl Sink for SlowSink {
    fn deliver(&self, batch: &Batch) -> Result<()> {
        if !self.sleep.is_zero() {
            std::thread::sleep(self.sleep);
        }
        self.delivered_batches_total.inc();
        self.delivered_samples_total
            .inc_by(batch.sample_count() as u64);
        self.flipped_samples_total
            .inc_by(batch.flipped.iter().filter(|f| **f).count() as u64);
        self.last_tensor_bytes.set(batch.tensor_bytes());
        Ok(())
    }
}

fn emit_metrics_snapshot(metrics: &GeneratorMetrics, sink: &SlowSink, split: SplitName) {
    let flow = metrics.flow.snapshot();
    let decode = metrics.decode.snapshot();
    let encode = metrics.encode.snapshot();
    let build = metrics.batch_build.snapshot();
    tracing::info!(
        target: "flowseg_metrics",
        split = %split,
        batches_built_total = metrics.batches_built_total.get(),
        samples_built_total = metrics.samples_built_total.get(),
        unresolved_label_pixels_total = metrics.unresolved_label_pixels_total.get(),
        decode_avg_ms = decode.avg_ms(),
        flow_avg_ms = flow.avg_ms(),
        flow_max_ms = flow.max_ns as f64 / 1_000_000.0,
        encode_avg_ms = encode.avg_ms(),
        batch_build_avg_ms = build.avg_ms(),
        delivered_batches_total = metrics.delivered_batches_total.get(),
        returned_positions_total = metrics.returned_positions_total.get(),
        inflight_bytes = metrics.inflight_bytes.get(),
        inflight_bytes_high_water = metrics.inflight_bytes_high_water.get(),
        sink_delivered_batches_total = sink.delivered_batches_total.get(),
        sink_delivered_samples_total = sink.delivered_samples_total.get(),
        sink_flipped_samples_total = sink.flipped_samples_total.get(),
        sink_last_tensor_bytes = sink.last_tensor_bytes.get(),
        "metrics"
    );
}

fn open_dataset(
    args: &Args,
    split: SplitName,
    target: FrameSize,
) -> Result<(Arc<dyn DatasetIndex>, Arc<dyn ImageReader>)> {
    let fs: Arc<dyn ImageReader> = Arc::new(FsImageReader);
    if let Some(path) = &args.manifest {
        return Ok((DatasetSource::Manifest(path.clone()).open()?, fs));
    }
    if let Some(root) = &args.cityscapes_root {
        let mut cs = CityscapesConfig::new(root);
        cs.prev_skip = args.prev_skip;
        cs.debug_samples = args.debug_samples;
        return Ok((DatasetSource::Cityscapes(cs).open()?, fs));
    }
    let clip = SyntheticClip {
        size: target,
        samples: args.synthetic_samples.max(1),
        speed: 2,
    };
    let (index, reader) = clip.build(&[split]);
    let index: Arc<dyn DatasetIndex> = Arc::new(index);
    let reader: Arc<dyn ImageReader> = Arc::new(reader);
    Ok((index, reader))
}

/// `consumers` workers each pull `batches` batches straight from the shared cursor.
async fn run_direct(
    generator: Arc<BatchGenerator>,
    sink: Arc<SlowSink>,
    split: SplitName,
    batch_size: usize,
    target: FrameSize,
    consumers: usize,
    batches: u64,
) -> Result<()> {
    let mut workers = tokio::task::JoinSet::new();
    for consumer in 0..consumers.max(1) {
        let generator = generator.clone();
        let sink = sink.clone();
        workers.spawn_blocking(move || -> Result<()> {
            let metrics = generator.metrics();
            for _ in 0..batches {
                if generator.is_stopped() {
                    break;
                }
                let batch = generator.next_batch(split, batch_size, target)?;
                sink.deliver(&batch)?;
                metrics.delivered_batches_total.inc();
                metrics
                    .delivered_samples_total
                    .inc_by(batch.sample_count() as u64);
            }
            info!(consumer = consumer as u64, "consumer finished");
            Ok(())
        });
    }
    while let Some(res) = workers.join_next().await {
        res??;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    flowseg_observe::logging::init_tracing();
    let args = Args::parse();

    let span = info_span!(
        "flowseg-demo",
        split = %args.split,
        batch_size = args.batch_size,
        target_h = args.height,
        target_w = args.width,
        consumers = args.consumers,
        batches_per_consumer = args.batches_per_consumer,
        stream = args.stream,
        flow_algorithm = %args.flow_algorithm,
        sink_sleep_ms = args.sink_sleep_ms,
    );

    async move {
        let split: SplitName = args.split.parse()?;
        let target = FrameSize::new(args.height, args.width);

        let config = GeneratorConfig {
            flip_policy: FlipPolicy::from_name(&args.flip_policy)?,
            seed: args.seed,
            flow_algorithm: args.flow_algorithm.clone(),
            label_scales: args.label_scales.clone(),
            with_diff: args.with_diff,
            compute: if args.compute_threads == 0 {
                ComputeBackend::Sequential
            } else {
                ComputeBackend::Rayon {
                    threads: args.compute_threads,
                }
            },
            ..GeneratorConfig::default()
        };

        let (index, reader) = open_dataset(&args, split, target)?;
        let palette = open_palette(args.palette.as_ref(), LabelKey::ClassId)?;
        let generator = Arc::new(BatchGenerator::new(index, reader, palette, config)?);
        generator.load()?;
        info!(
            split_len = generator.split_len(split)? as u64,
            steps_per_epoch = generator.steps_per_epoch(split, args.batch_size, args.consumers.max(1))? as u64,
            "generator loaded"
        );

        let metrics = generator.metrics();
        let sink = Arc::new(SlowSink::new(Duration::from_millis(args.sink_sleep_ms)));

        let metrics_task = if args.metrics_snapshot_interval_ms > 0 {
            let interval_ms = std::cmp::max(1, args.metrics_snapshot_interval_ms);
            let metrics = metrics.clone();
            let sink = sink.clone();
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    ticker.tick().await;
                    emit_metrics_snapshot(&metrics, &sink, split);
                }
            }))
        } else {
            None
        };

        let start = Instant::now();
        let total_batches = args.batches_per_consumer.saturating_mul(args.consumers.max(1) as u64);

        tokio::select! {
            res = async {
                if args.stream {
                    info!("starting prefetching stream");
                    let caps = StreamCaps {
                        max_queue_batches: args.max_queue_batches,
                        prefetch_batches: args.prefetch_batches,
                        max_inflight_bytes: args.max_inflight_bytes,
                    };
                    let stream = spawn_stream(generator.clone(), split, args.batch_size, target, caps)?;
                    drive_sink(stream, sink.clone(), metrics.clone(), Some(total_batches))
                        .await
                        .map(|_| ())
                } else {
                    info!("starting direct consumers");
                    run_direct(
                        generator.clone(),
                        sink.clone(),
                        split,
                        args.batch_size,
                        target,
                        args.consumers,
                        args.batches_per_consumer,
                    )
                    .await
                }
            } => {
                res?;
            }
            _ = signal::ctrl_c() => {
                warn!("ctrl-c received; stopping generator");
                generator.stop();
            }
        }

        if let Some(task) = metrics_task {
            task.abort();
        }

        let elapsed = start.elapsed();
        emit_metrics_snapshot(&metrics, &sink, split);

        let delivered_samples = sink.delivered_samples_total.get();
        let throughput = if elapsed.as_secs_f64() > 0.0 {
            delivered_samples as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            delivered_samples = delivered_samples,
            inflight_bytes_high_water = metrics.inflight_bytes_high_water.get(),
            samples_per_sec = throughput,
            "demo complete"
        );

        Ok::<(), anyhow::Error>(())
    }
    .instrument(span)
    .await
}
