#![deny(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ndarray::{s, Axis};
use tracing::{info, info_span};

use flowseg_core::cityscapes::CityscapesConfig;
use flowseg_core::{DatasetIndex, FrameSize, SplitName};
use flowseg_runtime::source::{open_palette, DatasetSource};
use flowseg_runtime::synthetic::SyntheticClip;
use flowseg_runtime::{BatchGenerator, GeneratorConfig};
use flowseg_vision::{
    denormalize, to_visualization, warp, FsImageReader, ImageReader, LabelKey,
};

/// Writes the frames, flow, warped prediction and decoded label of a few batches as PNGs.
#[derive(Debug, Parser)]
#[command(name = "flowseg-inspect")]
struct Args {
    /// TSV manifest (`schema_version=0`). Takes precedence over `--cityscapes-root`.
    #[arg(long, env = "FLOWSEG_MANIFEST")]
    manifest: Option<PathBuf>,

    #[arg(long, env = "FLOWSEG_CITYSCAPES_ROOT")]
    cityscapes_root: Option<PathBuf>,

    #[arg(long, env = "FLOWSEG_PREV_SKIP", default_value_t = 0)]
    prev_skip: u32,

    /// Uses an in-memory drifting clip when no dataset is given.
    #[arg(long, env = "FLOWSEG_SYNTHETIC_SAMPLES", default_value_t = 4)]
    synthetic_samples: usize,

    #[arg(long, env = "FLOWSEG_SPLIT", default_value = "val")]
    split: String,

    #[arg(long, env = "FLOWSEG_TARGET_HEIGHT", default_value_t = 256)]
    height: u32,

    #[arg(long, env = "FLOWSEG_TARGET_WIDTH", default_value_t = 512)]
    width: u32,

    /// `lk`, `pyr_lk` or `dis`. Falls back to the config file, then to `dis`.
    #[arg(long, env = "FLOWSEG_FLOW_ALGORITHM")]
    flow_algorithm: Option<String>,

    /// `disabled`, `random` or `alternate`. Falls back to the config file, then to `disabled`.
    #[arg(long, env = "FLOWSEG_FLIP_POLICY")]
    flip_policy: Option<String>,

    /// Optional JSON `GeneratorConfig`; explicit flags override its flow and flip settings.
    #[arg(long, env = "FLOWSEG_CONFIG")]
    config: Option<PathBuf>,

    /// `labels.tsv`; the built-in Cityscapes palette is used when absent.
    #[arg(long, env = "FLOWSEG_PALETTE")]
    palette: Option<PathBuf>,

    /// Treat labels as RGB color images instead of class-id images.
    #[arg(long, env = "FLOWSEG_COLOR_LABELS", default_value_t = false)]
    color_labels: bool,

    #[arg(long, env = "FLOWSEG_INSPECT_BATCHES", default_value_t = 1)]
    batches: usize,

    #[arg(long, env = "FLOWSEG_OUT_DIR", default_value = "flowseg-inspect")]
    out_dir: PathBuf,
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
        return Ok((DatasetSource::Cityscapes(cs).open()?, fs));
    }

    info!("no dataset given; using a synthetic clip");
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

fn main() -> Result<()> {
    flowseg_observe::logging::init_tracing();
    let args = Args::parse();

    let span = info_span!(
        "flowseg-inspect",
        split = %args.split,
        target_h = args.height,
        target_w = args.width,
        flow_algorithm = args.flow_algorithm.as_deref().unwrap_or("config"),
        out_dir = %args.out_dir.display(),
    );
    let _enter = span.enter();

    let split: SplitName = args.split.parse()?;
    let target = FrameSize::new(args.height, args.width);
    let key = if args.color_labels {
        LabelKey::Color
    } else {
        LabelKey::ClassId
    };

    let config = match &args.config {
        Some(path) => GeneratorConfig::load(path)?,
        None => GeneratorConfig::default(),
    }
    .with_overrides(args.flow_algorithm.as_deref(), args.flip_policy.as_deref())?;

    let (index, reader) = open_dataset(&args, split, target)?;

    let palette = open_palette(args.palette.as_ref(), key)?;
    let generator = BatchGenerator::new(index, reader, palette, config)?;
    generator.load()?;

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("create {}", args.out_dir.display()))?;

    for (b, batch) in generator
        .flow(split, 1, target)?
        .take(args.batches)
        .enumerate()
    {
        let batch = batch?;
        let old = batch.inputs.old_frames.index_axis(Axis(0), 0).to_owned();
        let new = batch.inputs.new_frames.index_axis(Axis(0), 0).to_owned();
        let flow = batch.inputs.flow.index_axis(Axis(0), 0).to_owned();
        let label = batch
            .targets
            .first()
            .context("batch has no targets")?
            .slice(s![0, .., .., ..])
            .to_owned();

        let warped = warp(&old, &flow)?;
        let out = |name: &str| args.out_dir.join(format!("{b:03}_{name}.png"));

        denormalize(&old)?.save(out("old"))?;
        denormalize(&new)?.save(out("new"))?;
        to_visualization(&flow)?.save(out("flow"))?;
        denormalize(&warped)?.save(out("warped"))?;
        flowseg_vision::decode(&label, generator.palette())?.save(out("label"))?;

        let warp_error = (&warped - &new).mapv(f32::abs).mean().unwrap_or_default();
        let frame_error = (&old - &new).mapv(f32::abs).mean().unwrap_or_default();
        info!(
            target: "flowseg_proof",
            event = "inspected",
            batch = b as u64,
            sample_index = batch.sample_indices.first().copied().unwrap_or_default() as u64,
            flipped = batch.flipped.first().copied().unwrap_or_default(),
            unresolved_label_pixels = batch.unresolved_label_pixels,
            frame_error = frame_error,
            warp_error = warp_error,
            "wrote inspection images"
        );
    }

    generator.stop();
    Ok(())
}
