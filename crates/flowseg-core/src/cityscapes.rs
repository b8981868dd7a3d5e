use std::path::{Path, PathBuf};

use tracing::debug;

use crate::index::{DatasetIndex, IndexError};
use crate::types::{Sample, SplitName};

/// Directory and file-name conventions of a Cityscapes-style video dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CityscapesLayout {
    pub frames_dir: String,
    pub labels_dir: String,
    pub frame_suffix: String,
    pub label_suffix: String,
}

impl Default for CityscapesLayout {
    fn default() -> Self {
        Self {
            frames_dir: "leftImg8bit_sequence".to_string(),
            labels_dir: "gtFine".to_string(),
            frame_suffix: "_leftImg8bit.png".to_string(),
            label_suffix: "_gtFine_labelIds.png".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CityscapesConfig {
    pub root: PathBuf,
    /// Frames skipped between the previous and the current frame (0 = adjacent frames).
    pub prev_skip: u32,
    /// Cap on samples per split; 0 keeps every labelled frame.
    pub debug_samples: usize,
    pub layout: CityscapesLayout,
}

impl CityscapesConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            prev_skip: 0,
            debug_samples: 0,
            layout: CityscapesLayout::default(),
        }
    }

    pub fn frame_gap(&self) -> u32 {
        self.prev_skip.saturating_add(1)
    }
}

/// Index over `<root>/<labels_dir>/<split>/<city>/<city>_<seq>_<frame><label_suffix>`.
///
/// The current frame lives under `<frames_dir>` with the same `<city>_<seq>_<frame>` stem;
/// the previous frame is `frame - (prev_skip + 1)` with the same zero padding.
#[derive(Debug, Clone)]
pub struct CityscapesIndex {
    cfg: CityscapesConfig,
}

impl CityscapesIndex {
    pub fn new(cfg: CityscapesConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &CityscapesConfig {
        &self.cfg
    }

    fn sample_for_label(
        &self,
        split: SplitName,
        city: &str,
        label_path: &Path,
    ) -> Result<Sample, IndexError> {
        let layout = &self.cfg.layout;
        let file_name = label_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| IndexError::Layout(format!("bad file name {}", label_path.display())))?;
        let stem = file_name
            .strip_suffix(layout.label_suffix.as_str())
            .ok_or_else(|| IndexError::Layout(format!("unexpected label name {file_name}")))?;
        let (prefix, frame_str) = stem
            .rsplit_once('_')
            .ok_or_else(|| IndexError::Layout(format!("missing frame number in {file_name}")))?;
        let frame: u32 = frame_str
            .parse()
            .map_err(|_| IndexError::Layout(format!("bad frame number in {file_name}")))?;
        let gap = self.cfg.frame_gap();
        let prev = frame.checked_sub(gap).ok_or_else(|| {
            IndexError::Layout(format!(
                "{file_name}: frame {frame} has no predecessor at gap {gap}"
            ))
        })?;

        let width = frame_str.len();
        let frames = self
            .cfg
            .root
            .join(&layout.frames_dir)
            .join(split.as_str())
            .join(city);
        let frame_path = |n: u32| frames.join(format!("{prefix}_{n:0width$}{}", layout.frame_suffix));

        Ok(Sample::new(
            frame_path(prev),
            frame_path(frame),
            label_path.to_path_buf(),
        ))
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, IndexError> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| IndexError::io(dir, e))? {
        let entry = entry.map_err(|e| IndexError::io(dir, e))?;
        out.push(entry.path());
    }
    out.sort();
    Ok(out)
}

impl DatasetIndex for CityscapesIndex {
    fn load(&self, split: SplitName) -> Result<Vec<Sample>, IndexError> {
        let layout = &self.cfg.layout;
        let split_dir = self.cfg.root.join(&layout.labels_dir).join(split.as_str());
        if !split_dir.is_dir() {
            debug!(split = %split, dir = %split_dir.display(), "split directory missing");
            return Ok(Vec::new());
        }

        let mut samples = Vec::new();
        'cities: for city_dir in sorted_entries(&split_dir)? {
            if !city_dir.is_dir() {
                continue;
            }
            let Some(city) = city_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            for label in sorted_entries(&city_dir)? {
                let is_label = label
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(layout.label_suffix.as_str()));
                if !is_label {
                    continue;
                }
                samples.push(self.sample_for_label(split, city, &label)?);
                if self.cfg.debug_samples > 0 && samples.len() >= self.cfg.debug_samples {
                    break 'cities;
                }
            }
        }

        debug!(split = %split, samples = samples.len(), "indexed cityscapes split");
        Ok(samples)
    }

    fn name(&self) -> &str {
        "cityscapes"
    }
}
