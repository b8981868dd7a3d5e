use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use ndarray::{Array3, Array4, ArrayView3, Axis};
use rayon::prelude::*;
use tracing::{debug, error, info};

use flowseg_core::{DatasetIndex, FrameSize, GeneratorError, Sample, SplitName};
use flowseg_observe::metrics::{Counter, DurationAgg, Gauge, ScopedTimer};
use flowseg_observe::time::elapsed_us;
use flowseg_vision::{
    normalize, FlowAlgorithm, FlowEstimator, ImagePreprocessor, ImageReader, LabelEncoder,
    Palette,
};

use crate::augment::AugmentationPolicy;
use crate::config::{ComputeBackend, FlipPolicy, GeneratorConfig};
use crate::cursor::SplitCursor;
use crate::stream::StopHandle;
use crate::types::{Batch, BatchInputs};

#[derive(Debug, Default)]
pub struct GeneratorMetrics {
    pub batches_built_total: Counter,
    pub samples_built_total: Counter,
    pub unresolved_label_pixels_total: Counter,
    pub decode: DurationAgg,
    pub flow: DurationAgg,
    pub encode: DurationAgg,
    pub batch_build: DurationAgg,
    pub delivered_batches_total: Counter,
    pub delivered_samples_total: Counter,
    pub returned_positions_total: Counter,
    pub inflight_bytes: Gauge,
    pub inflight_bytes_high_water: Gauge,
}

impl GeneratorMetrics {
    pub(crate) fn on_inflight_add(&self, delta: u64) {
        let now = self.inflight_bytes.add(delta);
        self.inflight_bytes_high_water.max(now);
    }

    pub(crate) fn on_inflight_sub(&self, delta: u64) {
        self.inflight_bytes.sub(delta);
    }
}

#[derive(Debug)]
struct LoadedSplit {
    samples: Arc<[Sample]>,
    cursor: Mutex<SplitCursor>,
}

/// A sample reserved for a batch, with its flip already decided.
#[derive(Debug, Clone)]
pub struct ClaimedSample {
    pub position: usize,
    pub sample_index: usize,
    pub sample: Sample,
    pub flip: bool,
}

/// Sample set of one batch. Claiming is the only step that touches shared state.
#[derive(Debug, Clone)]
pub struct ClaimedBatch {
    pub split: SplitName,
    pub samples: Vec<ClaimedSample>,
}

struct SampleTensors {
    old: Array3<f32>,
    new: Array3<f32>,
    flow: Array3<f32>,
    diff: Option<Array3<f32>>,
    targets: Vec<Array3<f32>>,
    unresolved: u64,
}

fn stack_views(views: &[ArrayView3<'_, f32>]) -> Result<Array4<f32>, GeneratorError> {
    ndarray::stack(Axis(0), views)
        .map_err(|e| GeneratorError::invalid_config(format!("stack batch: {e}")))
}

fn stack_field<'a>(
    per_sample: &'a [SampleTensors],
    pick: impl Fn(&'a SampleTensors) -> ArrayView3<'a, f32>,
) -> Result<Array4<f32>, GeneratorError> {
    let views: Vec<ArrayView3<'a, f32>> = per_sample.iter().map(pick).collect();
    stack_views(&views)
}

/// Turns a dataset index into an endless, thread-safe sequence of training batches.
///
/// Lifecycle: construct, [`load`](Self::load), then pull with [`next_batch`](Self::next_batch)
/// or [`flow`](Self::flow), or hand the generator to [`crate::stream::spawn_stream`].
/// Pulling ends when [`stop`](Self::stop) is called.
pub struct BatchGenerator {
    index: Arc<dyn DatasetIndex>,
    preprocessor: ImagePreprocessor,
    flow: FlowEstimator,
    labels: LabelEncoder,
    augment: AugmentationPolicy,
    config: GeneratorConfig,
    pool: Option<rayon::ThreadPool>,
    splits: RwLock<Option<Arc<BTreeMap<SplitName, Arc<LoadedSplit>>>>>,
    metrics: Arc<GeneratorMetrics>,
    stop: StopHandle,
    failure: Mutex<Option<String>>,
}

impl std::fmt::Debug for BatchGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchGenerator")
            .field("dataset", &self.index.name())
            .field("flow", &self.flow)
            .field("config", &self.config)
            .field("loaded", &self.is_loaded())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl BatchGenerator {
    pub fn new(
        index: Arc<dyn DatasetIndex>,
        reader: Arc<dyn ImageReader>,
        palette: Arc<Palette>,
        config: GeneratorConfig,
    ) -> Result<Self, GeneratorError> {
        config.validate()?;
        let flow = FlowEstimator::new(FlowAlgorithm::from_name(&config.flow_algorithm)?)
            .with_params(config.flow_params)?;
        let pool = match config.compute {
            ComputeBackend::Sequential => None,
            ComputeBackend::Rayon { threads } => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("flowseg-worker-{i}"))
                    .build()
                    .map_err(|e| {
                        GeneratorError::invalid_config(format!("compute pool: {e}"))
                    })?,
            ),
        };

        info!(
            target: "flowseg_proof",
            event = "generator_created",
            dataset = index.name(),
            flow_algorithm = flow.algorithm().as_str(),
            flip_policy = ?config.flip_policy,
            label_scales = ?config.label_scales,
            n_classes = palette.n_classes(),
            compute = ?config.compute,
            "generator created"
        );

        Ok(Self {
            index,
            preprocessor: ImagePreprocessor::new(reader).with_backend(config.resize_backend),
            flow,
            labels: LabelEncoder::new(palette),
            augment: AugmentationPolicy::new(config.flip_policy, config.seed),
            config,
            pool,
            splits: RwLock::new(None),
            metrics: Arc::new(GeneratorMetrics::default()),
            stop: StopHandle::new(),
            failure: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<GeneratorMetrics> {
        self.metrics.clone()
    }

    pub fn palette(&self) -> &Palette {
        self.labels.palette()
    }

    pub fn flow_estimator(&self) -> &FlowEstimator {
        &self.flow
    }

    pub fn flip_policy(&self) -> FlipPolicy {
        self.augment.policy()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Ends every iterator and stream pulling from this generator at its next batch boundary.
    pub fn stop(&self) {
        if !self.stop.is_stopped() {
            info!(target: "flowseg_proof", event = "generator_stopped", "generator stopped");
        }
        self.stop.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// The error that aborted the generator, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Latches the first fatal build error and stops the generator.
    fn fail(&self, err: &GeneratorError) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            error!(
                target: "flowseg_proof",
                event = "generator_aborted",
                error = %err,
                "generator aborted"
            );
            *failure = Some(err.to_string());
        }
        drop(failure);
        self.stop();
    }

    fn ensure_running(&self) -> Result<(), GeneratorError> {
        if let Some(reason) = self.failure() {
            return Err(GeneratorError::Aborted(reason));
        }
        if self.is_stopped() {
            return Err(GeneratorError::Stopped);
        }
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.splits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Reads every split from the index and resets all cursors.
    pub fn load(&self) -> Result<(), GeneratorError> {
        let per_sample = self.config.flip_policy.positions_per_sample();
        let mut loaded = BTreeMap::new();
        for split in SplitName::ALL {
            let samples: Arc<[Sample]> = self.index.load(split)?.into();
            info!(
                target: "flowseg_proof",
                event = "split_loaded",
                split = %split,
                samples = samples.len() as u64,
                "split loaded"
            );
            let cursor = Mutex::new(SplitCursor::new(samples.len() * per_sample));
            loaded.insert(split, Arc::new(LoadedSplit { samples, cursor }));
        }
        *self.splits.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(loaded));
        Ok(())
    }

    fn split(&self, split: SplitName) -> Result<Arc<LoadedSplit>, GeneratorError> {
        let guard = self.splits.read().unwrap_or_else(PoisonError::into_inner);
        let splits = guard.as_ref().ok_or(GeneratorError::NotLoaded)?;
        splits
            .get(&split)
            .cloned()
            .ok_or(GeneratorError::EmptySplit(split))
    }

    pub fn split_len(&self, split: SplitName) -> Result<usize, GeneratorError> {
        Ok(self.split(split)?.samples.len())
    }

    /// `ceil(len / (batch_size * replicas))`, doubled under [`FlipPolicy::Alternate`].
    pub fn steps_per_epoch(
        &self,
        split: SplitName,
        batch_size: usize,
        replicas: usize,
    ) -> Result<usize, GeneratorError> {
        let loaded = self.split(split)?;
        if batch_size == 0 || replicas == 0 {
            return Err(GeneratorError::invalid_config(
                "batch_size and replicas must be > 0",
            ));
        }
        let steps = loaded.samples.len().div_ceil(batch_size * replicas);
        Ok(steps * self.config.flip_policy.positions_per_sample())
    }

    /// Validates a pull request without touching any cursor.
    pub fn check_request(
        &self,
        split: SplitName,
        batch_size: usize,
        target: FrameSize,
    ) -> Result<(), GeneratorError> {
        let loaded = self.split(split)?;
        if batch_size == 0 {
            return Err(GeneratorError::invalid_config("batch_size must be > 0"));
        }
        self.config.check_target(target)?;
        if loaded.samples.is_empty() {
            return Err(GeneratorError::EmptySplit(split));
        }
        Ok(())
    }

    /// Atomically reserves the next `batch_size` positions of `split` and decides their flips.
    pub fn claim(&self, split: SplitName, batch_size: usize) -> Result<ClaimedBatch, GeneratorError> {
        let loaded = self.split(split)?;
        if loaded.samples.is_empty() {
            return Err(GeneratorError::EmptySplit(split));
        }
        self.ensure_running()?;
        let per_sample = self.config.flip_policy.positions_per_sample();

        let mut cursor = loaded.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let samples = cursor
            .claim(batch_size)
            .into_iter()
            .map(|position| {
                let sample_index = position / per_sample;
                ClaimedSample {
                    position,
                    sample_index,
                    sample: loaded.samples[sample_index].clone(),
                    flip: self.augment.decide(position),
                }
            })
            .collect();
        drop(cursor);

        Ok(ClaimedBatch { split, samples })
    }

    /// Hands claimed-but-undelivered positions back to `split`'s cursor, in claim order.
    ///
    /// They are served again before the cursor advances, so abandoning a prefetched batch
    /// never skips samples.
    pub fn give_back(
        &self,
        split: SplitName,
        positions: impl IntoIterator<Item = usize>,
    ) -> Result<(), GeneratorError> {
        let loaded = self.split(split)?;
        let mut cursor = loaded.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let before = cursor.returned();
        cursor.give_back(positions);
        let returned = (cursor.returned() - before) as u64;
        drop(cursor);

        if returned > 0 {
            self.metrics.returned_positions_total.inc_by(returned);
            info!(
                target: "flowseg_proof",
                event = "positions_returned",
                split = %split,
                positions = returned,
                "positions returned"
            );
        }
        Ok(())
    }

    /// Builds the tensors of a claimed batch. Touches no shared state besides metrics.
    ///
    /// A failure here (an undecodable image, say) is fatal: it is latched and the generator
    /// stops, so every later pull reports [`GeneratorError::Aborted`].
    pub fn build(&self, claimed: &ClaimedBatch, target: FrameSize) -> Result<Batch, GeneratorError> {
        self.config.check_target(target)?;
        self.build_checked(claimed, target).inspect_err(|e| self.fail(e))
    }

    fn build_checked(
        &self,
        claimed: &ClaimedBatch,
        target: FrameSize,
    ) -> Result<Batch, GeneratorError> {
        let started = Instant::now();
        let _timer = ScopedTimer::new(&self.metrics.batch_build);

        let per_sample: Vec<SampleTensors> = match &self.pool {
            Some(pool) => pool.install(|| {
                claimed
                    .samples
                    .par_iter()
                    .map(|s| self.build_sample(s, target))
                    .collect::<Result<Vec<_>, _>>()
            })?,
            None => claimed
                .samples
                .iter()
                .map(|s| self.build_sample(s, target))
                .collect::<Result<Vec<_>, _>>()?,
        };

        let old_frames = stack_field(&per_sample, |s| s.old.view())?;
        let new_frames = stack_field(&per_sample, |s| s.new.view())?;
        let flow = stack_field(&per_sample, |s| s.flow.view())?;
        let diff = if self.config.with_diff {
            let views: Vec<ArrayView3<'_, f32>> = per_sample
                .iter()
                .filter_map(|s| s.diff.as_ref().map(|d| d.view()))
                .collect();
            Some(stack_views(&views)?)
        } else {
            None
        };
        let targets = (0..self.config.label_scales.len())
            .map(|i| stack_field(&per_sample, |s| s.targets[i].view()))
            .collect::<Result<Vec<_>, _>>()?;

        let unresolved: u64 = per_sample.iter().map(|s| s.unresolved).sum();
        let batch = Batch {
            split: claimed.split,
            positions: claimed.samples.iter().map(|s| s.position).collect(),
            sample_indices: claimed.samples.iter().map(|s| s.sample_index).collect(),
            flipped: claimed.samples.iter().map(|s| s.flip).collect(),
            inputs: BatchInputs {
                old_frames,
                new_frames,
                flow,
                diff,
            },
            targets,
            unresolved_label_pixels: unresolved,
        };

        self.metrics.batches_built_total.inc();
        self.metrics
            .samples_built_total
            .inc_by(batch.sample_count() as u64);
        debug!(
            split = %claimed.split,
            batch_size = batch.sample_count() as u64,
            target_h = target.height,
            target_w = target.width,
            first_position = batch.positions.first().copied().unwrap_or_default() as u64,
            unresolved_label_pixels = unresolved,
            build_us = elapsed_us(started),
            "built batch"
        );
        Ok(batch)
    }

    fn build_sample(
        &self,
        claimed: &ClaimedSample,
        target: FrameSize,
    ) -> Result<SampleTensors, GeneratorError> {
        let sample = &claimed.sample;
        let (old_img, new_img, label_raw) = {
            let _t = ScopedTimer::new(&self.metrics.decode);
            (
                self.preprocessor
                    .prepare(&sample.prev_frame, target, claimed.flip)?,
                self.preprocessor
                    .prepare(&sample.curr_frame, target, claimed.flip)?,
                self.preprocessor.load_raw(&sample.label)?,
            )
        };

        let flow = {
            let _t = ScopedTimer::new(&self.metrics.flow);
            self.flow.estimate(&old_img, &new_img)?
        };

        let old = normalize(&old_img);
        let new = normalize(&new_img);
        let diff = self.config.with_diff.then(|| &new - &old);

        let encoded = {
            let _t = ScopedTimer::new(&self.metrics.encode);
            let label = self.labels.read(&label_raw)?;
            self.labels
                .encode_multi_scale(&label, target, &self.config.label_scales, claimed.flip)?
        };
        let unresolved: u64 = encoded.iter().map(|t| t.unresolved_pixels).sum();
        if unresolved > 0 {
            self.metrics.unresolved_label_pixels_total.inc_by(unresolved);
            debug!(
                position = claimed.position as u64,
                label = %sample.label.display(),
                unresolved_pixels = unresolved,
                "label pixels outside palette"
            );
        }

        Ok(SampleTensors {
            old,
            new,
            flow,
            diff,
            targets: encoded.into_iter().map(|t| t.data).collect(),
            unresolved,
        })
    }

    /// Claims and builds one batch. Safe to call from any number of threads at once.
    ///
    /// Fails with [`GeneratorError::Stopped`] once stopped, and with
    /// [`GeneratorError::Aborted`] after any earlier build failed.
    pub fn next_batch(
        &self,
        split: SplitName,
        batch_size: usize,
        target: FrameSize,
    ) -> Result<Batch, GeneratorError> {
        self.check_request(split, batch_size, target)?;
        let claimed = self.claim(split, batch_size)?;
        self.build(&claimed, target)
    }

    /// Endless batch iterator; ends only once the generator is stopped.
    ///
    /// Fails up front when the generator is not loaded or the request is invalid.
    pub fn flow(
        &self,
        split: SplitName,
        batch_size: usize,
        target: FrameSize,
    ) -> Result<BatchIter<'_>, GeneratorError> {
        self.check_request(split, batch_size, target)?;
        Ok(BatchIter {
            generator: self,
            split,
            batch_size,
            target,
            done: false,
        })
    }
}

#[derive(Debug)]
pub struct BatchIter<'a> {
    generator: &'a BatchGenerator,
    split: SplitName,
    batch_size: usize,
    target: FrameSize,
    done: bool,
}

/// Fused: yields `None` once the generator is stopped or after the first error.
impl Iterator for BatchIter<'_> {
    type Item = Result<Batch, GeneratorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.generator.is_stopped() {
            self.done = true;
            return None;
        }
        let res = self
            .generator
            .next_batch(self.split, self.batch_size, self.target);
        self.done = res.is_err();
        Some(res)
    }
}

impl std::iter::FusedIterator for BatchIter<'_> {}
