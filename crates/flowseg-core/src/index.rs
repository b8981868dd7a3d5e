use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::{Sample, SplitName};

/// v0 manifest schema version for [`ManifestIndex`].
pub const MANIFEST_SCHEMA_VERSION: u32 = 0;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest not utf-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("empty manifest")]
    EmptyManifest,
    #[error("manifest header must be schema_version=<n>")]
    MissingSchemaVersion,
    #[error("unsupported manifest schema_version {0}")]
    UnsupportedSchemaVersion(u32),
    #[error("manifest line {line}: {reason}")]
    Line { line: usize, reason: String },
    #[error("dataset layout error: {0}")]
    Layout(String),
}

impl IndexError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        IndexError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Source of ordered sample descriptors per split.
///
/// Implementations must be deterministic given unchanged storage: the generator calls
/// `load` once per split and treats the result as the canonical stream order.
pub trait DatasetIndex: Send + Sync + 'static {
    /// Ordered samples of `split`. A split the dataset does not have yields an empty list.
    fn load(&self, split: SplitName) -> Result<Vec<Sample>, IndexError>;

    fn name(&self) -> &str {
        "dataset"
    }
}

/// Splits held in memory, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryIndex {
    splits: BTreeMap<SplitName, Vec<Sample>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_split(mut self, split: SplitName, samples: Vec<Sample>) -> Self {
        self.splits.insert(split, samples);
        self
    }

    pub fn insert(&mut self, split: SplitName, samples: Vec<Sample>) {
        self.splits.insert(split, samples);
    }
}

impl DatasetIndex for MemoryIndex {
    fn load(&self, split: SplitName) -> Result<Vec<Sample>, IndexError> {
        Ok(self.splits.get(&split).cloned().unwrap_or_default())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Index backed by a TSV manifest:
///
/// ```text
/// schema_version=0
/// train<TAB>prev.png<TAB>curr.png<TAB>label.png
/// ```
///
/// Relative paths are resolved against the manifest's directory.
#[derive(Debug, Clone)]
pub struct ManifestIndex {
    source: PathBuf,
    splits: BTreeMap<SplitName, Vec<Sample>>,
}

impl ManifestIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| IndexError::io(path, e))?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let splits = parse_manifest_tsv(&bytes, base)?;
        Ok(Self {
            source: path.to_path_buf(),
            splits,
        })
    }

    pub fn from_bytes(bytes: &[u8], base_dir: impl AsRef<Path>) -> Result<Self, IndexError> {
        let splits = parse_manifest_tsv(bytes, base_dir.as_ref())?;
        Ok(Self {
            source: base_dir.as_ref().to_path_buf(),
            splits,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

impl DatasetIndex for ManifestIndex {
    fn load(&self, split: SplitName) -> Result<Vec<Sample>, IndexError> {
        Ok(self.splits.get(&split).cloned().unwrap_or_default())
    }

    fn name(&self) -> &str {
        "manifest"
    }
}

pub fn parse_manifest_tsv(
    bytes: &[u8],
    base_dir: &Path,
) -> Result<BTreeMap<SplitName, Vec<Sample>>, IndexError> {
    let s = std::str::from_utf8(bytes)?;

    let mut lines = s.lines().enumerate();
    let (_, first) = lines
        .by_ref()
        .find(|(_, l)| !l.trim().is_empty())
        .ok_or(IndexError::EmptyManifest)?;

    let Some((k, v)) = first.split_once('=') else {
        return Err(IndexError::MissingSchemaVersion);
    };
    if k.trim() != "schema_version" {
        return Err(IndexError::MissingSchemaVersion);
    }
    let schema_version: u32 = v
        .trim()
        .parse()
        .map_err(|_| IndexError::MissingSchemaVersion)?;
    if schema_version != MANIFEST_SCHEMA_VERSION {
        return Err(IndexError::UnsupportedSchemaVersion(schema_version));
    }

    let resolve = |raw: &str| -> PathBuf {
        let p = Path::new(raw);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            base_dir.join(p)
        }
    };

    let mut splits: BTreeMap<SplitName, Vec<Sample>> = BTreeMap::new();
    for (i, raw) in lines {
        let line_no = i + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cols: Vec<&str> = line.split('\t').map(str::trim).collect();
        if cols.len() != 4 {
            return Err(IndexError::Line {
                line: line_no,
                reason: format!("expected 4 columns, found {}", cols.len()),
            });
        }
        let split: SplitName = cols[0].parse().map_err(|e| IndexError::Line {
            line: line_no,
            reason: format!("{e}"),
        })?;
        if let Some(empty) = cols[1..].iter().position(|c| c.is_empty()) {
            return Err(IndexError::Line {
                line: line_no,
                reason: format!("column {} must be non-empty", empty + 2),
            });
        }
        splits.entry(split).or_default().push(Sample::new(
            resolve(cols[1]),
            resolve(cols[2]),
            resolve(cols[3]),
        ));
    }

    Ok(splits)
}
