use std::path::PathBuf;
use std::sync::Arc;

use flowseg_core::cityscapes::{CityscapesConfig, CityscapesIndex};
use flowseg_core::{DatasetIndex, GeneratorError, ManifestIndex};
use flowseg_vision::{LabelKey, Palette};

/// Where a tool reads its samples from.
#[derive(Debug, Clone)]
pub enum DatasetSource {
    Manifest(PathBuf),
    Cityscapes(CityscapesConfig),
}

impl DatasetSource {
    pub fn open(&self) -> Result<Arc<dyn DatasetIndex>, GeneratorError> {
        Ok(match self {
            DatasetSource::Manifest(path) => Arc::new(ManifestIndex::open(path)?),
            DatasetSource::Cityscapes(cfg) => Arc::new(CityscapesIndex::new(cfg.clone())),
        })
    }
}

/// A `labels.tsv` when given, the built-in Cityscapes table otherwise.
pub fn open_palette(path: Option<&PathBuf>, key: LabelKey) -> Result<Arc<Palette>, GeneratorError> {
    let palette = match path {
        Some(path) => Palette::load(path, key)
            .map_err(|e| GeneratorError::invalid_config(format!("palette: {e}")))?,
        None => Palette::cityscapes(key),
    };
    Ok(Arc::new(palette))
}
