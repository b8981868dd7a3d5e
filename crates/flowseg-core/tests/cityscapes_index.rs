use std::path::{Path, PathBuf};

use anyhow::Result;

use flowseg_core::cityscapes::{CityscapesConfig, CityscapesIndex};
use flowseg_core::{DatasetIndex, IndexError, SplitName};

fn temp_dir(test_name: &str) -> Result<PathBuf> {
    let mut root = std::env::temp_dir();
    root.push(format!(
        "flowseg-core-{test_name}-{}-{}",
        std::process::id(),
        flowseg_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, b"")?;
    Ok(())
}

fn write_labels(root: &Path, split: &str, city: &str, frames: &[&str]) -> Result<()> {
    for frame in frames {
        touch(
            &root
                .join("gtFine")
                .join(split)
                .join(city)
                .join(format!("{city}_000001_{frame}_gtFine_labelIds.png")),
        )?;
    }
    Ok(())
}

#[test]
fn cityscapes_pairs_label_with_previous_frame() -> Result<()> {
    let root = temp_dir("cityscapes-pairs")?;
    write_labels(&root, "train", "aachen", &["000019"])?;
    // Non-label files next to labels are ignored.
    touch(&root.join("gtFine/train/aachen/aachen_000001_000019_gtFine_color.png"))?;

    let idx = CityscapesIndex::new(CityscapesConfig::new(&root));
    let train = idx.load(SplitName::Train)?;
    assert_eq!(train.len(), 1);

    let frames = root.join("leftImg8bit_sequence/train/aachen");
    assert_eq!(
        train[0].curr_frame,
        frames.join("aachen_000001_000019_leftImg8bit.png")
    );
    assert_eq!(
        train[0].prev_frame,
        frames.join("aachen_000001_000018_leftImg8bit.png")
    );
    Ok(())
}

#[test]
fn cityscapes_respects_prev_skip_and_sorting() -> Result<()> {
    let root = temp_dir("cityscapes-skip")?;
    write_labels(&root, "val", "lindau", &["000019"])?;
    write_labels(&root, "val", "frankfurt", &["000029", "000009"])?;

    let mut cfg = CityscapesConfig::new(&root);
    cfg.prev_skip = 2;
    let idx = CityscapesIndex::new(cfg);
    let val = idx.load(SplitName::Val)?;

    let names: Vec<String> = val
        .iter()
        .map(|s| s.curr_frame.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "frankfurt_000001_000009_leftImg8bit.png",
            "frankfurt_000001_000029_leftImg8bit.png",
            "lindau_000001_000019_leftImg8bit.png",
        ]
    );
    assert!(val[0]
        .prev_frame
        .ends_with("frankfurt_000001_000006_leftImg8bit.png"));
    Ok(())
}

#[test]
fn cityscapes_debug_samples_caps_split() -> Result<()> {
    let root = temp_dir("cityscapes-debug")?;
    write_labels(&root, "train", "bonn", &["000010", "000011", "000012"])?;

    let mut cfg = CityscapesConfig::new(&root);
    cfg.debug_samples = 2;
    let idx = CityscapesIndex::new(cfg);
    assert_eq!(idx.load(SplitName::Train)?.len(), 2);
    Ok(())
}

#[test]
fn cityscapes_missing_split_is_empty() -> Result<()> {
    let root = temp_dir("cityscapes-missing")?;
    let idx = CityscapesIndex::new(CityscapesConfig::new(&root));
    assert!(idx.load(SplitName::Test)?.is_empty());
    Ok(())
}

#[test]
fn cityscapes_frame_without_predecessor_is_layout_error() -> Result<()> {
    let root = temp_dir("cityscapes-first")?;
    write_labels(&root, "train", "ulm", &["000000"])?;
    let idx = CityscapesIndex::new(CityscapesConfig::new(&root));
    let err = idx.load(SplitName::Train).unwrap_err();
    assert!(matches!(err, IndexError::Layout(_)));
    Ok(())
}
