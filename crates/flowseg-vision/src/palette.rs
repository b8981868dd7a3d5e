use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PALETTE_SCHEMA_VERSION: u32 = 1;

/// How label pixels are keyed into the palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelKey {
    /// Single-channel images whose value is the class id (Cityscapes `labelIds`).
    #[default]
    ClassId,
    /// RGB images painted with the palette colors.
    Color,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaletteEntry {
    pub id: u8,
    pub name: String,
    pub color: [u8; 3],
}

#[derive(Debug, Error)]
pub enum PaletteError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("labels file not utf-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("empty labels file")]
    Empty,
    #[error("labels header must be schema_version=<n>")]
    MissingSchemaVersion,
    #[error("unsupported labels schema_version {0}")]
    UnsupportedSchemaVersion(u32),
    #[error("labels line {line}: {reason}")]
    Line { line: usize, reason: String },
    #[error("duplicate label_id {0}")]
    DuplicateId(u8),
    #[error("palette has no classes")]
    NoClasses,
}

/// Class table: channel `i` of a one-hot tensor is the `i`-th entry in ascending id order.
#[derive(Debug, Clone)]
pub struct Palette {
    key: LabelKey,
    entries: Vec<PaletteEntry>,
    by_id: HashMap<u8, usize>,
    by_color: HashMap<[u8; 3], usize>,
}

impl Palette {
    pub fn new(key: LabelKey, mut entries: Vec<PaletteEntry>) -> Result<Self, PaletteError> {
        if entries.is_empty() {
            return Err(PaletteError::NoClasses);
        }
        entries.sort_by_key(|e| e.id);
        if let Some(pair) = entries.windows(2).find(|p| p[0].id == p[1].id) {
            return Err(PaletteError::DuplicateId(pair[0].id));
        }
        Ok(Self::from_sorted(key, entries))
    }

    fn from_sorted(key: LabelKey, entries: Vec<PaletteEntry>) -> Self {
        let by_id = entries.iter().enumerate().map(|(ch, e)| (e.id, ch)).collect();
        let mut by_color = HashMap::new();
        for (ch, e) in entries.iter().enumerate() {
            // Several ids share a color (void classes, pole/polegroup); the lowest id wins.
            by_color.entry(e.color).or_insert(ch);
        }
        Self {
            key,
            entries,
            by_id,
            by_color,
        }
    }

    /// The 34 Cityscapes `labelIds` classes.
    pub fn cityscapes(key: LabelKey) -> Self {
        let entries = CITYSCAPES
            .iter()
            .map(|&(id, name, color)| PaletteEntry {
                id,
                name: name.to_string(),
                color,
            })
            .collect();
        Self::from_sorted(key, entries)
    }

    pub fn load(path: impl AsRef<Path>, key: LabelKey) -> Result<Self, PaletteError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| PaletteError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(key, parse_palette_tsv(&bytes)?)
    }

    pub fn key(&self) -> LabelKey {
        self.key
    }

    pub fn n_classes(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[PaletteEntry] {
        &self.entries
    }

    pub fn channel_for_id(&self, id: u8) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    pub fn channel_for_color(&self, color: [u8; 3]) -> Option<usize> {
        self.by_color.get(&color).copied()
    }

    pub fn color(&self, channel: usize) -> Option<[u8; 3]> {
        self.entries.get(channel).map(|e| e.color)
    }

    pub fn name(&self, channel: usize) -> Option<&str> {
        self.entries.get(channel).map(|e| e.name.as_str())
    }
}

fn percent_decode(s: &str) -> Result<String, String> {
    let bytes = s.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let v = bytes
                    .get(i + 1..i + 3)
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| "bad percent-encoding".to_string())?;
                out.push(v);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|e| e.to_string())
}

fn parse_color(s: &str) -> Result<[u8; 3], String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [r, g, b] = parts.as_slice() else {
        return Err(format!("color must be r,g,b, got {s:?}"));
    };
    let channel = |c: &str| c.parse::<u8>().map_err(|_| format!("bad color channel {c:?}"));
    Ok([channel(*r)?, channel(*g)?, channel(*b)?])
}

/// Parses `labels.tsv`:
///
/// ```text
/// schema_version=1
/// 7<TAB>road<TAB>128,64,128
/// ```
///
/// Names may be percent-encoded. Entries are returned in ascending id order.
pub fn parse_palette_tsv(bytes: &[u8]) -> Result<Vec<PaletteEntry>, PaletteError> {
    let s = std::str::from_utf8(bytes)?;
    let mut lines = s.lines().enumerate();
    let (_, first) = lines
        .by_ref()
        .find(|(_, l)| !l.trim().is_empty())
        .ok_or(PaletteError::Empty)?;

    let Some((k, v)) = first.split_once('=') else {
        return Err(PaletteError::MissingSchemaVersion);
    };
    if k.trim() != "schema_version" {
        return Err(PaletteError::MissingSchemaVersion);
    }
    let schema_version: u32 = v
        .trim()
        .parse()
        .map_err(|_| PaletteError::MissingSchemaVersion)?;
    if schema_version != PALETTE_SCHEMA_VERSION {
        return Err(PaletteError::UnsupportedSchemaVersion(schema_version));
    }

    let mut items: Vec<PaletteEntry> = Vec::new();
    for (i, raw) in lines {
        let line_no = i + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line_err = |reason: String| PaletteError::Line {
            line: line_no,
            reason,
        };
        let cols: Vec<&str> = line.split('\t').map(str::trim).collect();
        let [id_s, name_enc, color_s] = cols.as_slice() else {
            return Err(line_err(format!(
                "expected id<TAB>name<TAB>r,g,b, found {} columns",
                cols.len()
            )));
        };
        let id: u8 = id_s
            .parse()
            .map_err(|_| line_err(format!("bad label_id {id_s:?}")))?;
        let name = percent_decode(name_enc).map_err(line_err)?;
        let color = parse_color(color_s).map_err(line_err)?;
        items.push(PaletteEntry { id, name, color });
    }

    items.sort_by_key(|e| e.id);
    if let Some(pair) = items.windows(2).find(|p| p[0].id == p[1].id) {
        return Err(PaletteError::DuplicateId(pair[0].id));
    }
    Ok(items)
}

const CITYSCAPES: [(u8, &str, [u8; 3]); 34] = [
    (0, "unlabeled", [0, 0, 0]),
    (1, "ego vehicle", [0, 0, 0]),
    (2, "rectification border", [0, 0, 0]),
    (3, "out of roi", [0, 0, 0]),
    (4, "static", [0, 0, 0]),
    (5, "dynamic", [111, 74, 0]),
    (6, "ground", [81, 0, 81]),
    (7, "road", [128, 64, 128]),
    (8, "sidewalk", [244, 35, 232]),
    (9, "parking", [250, 170, 160]),
    (10, "rail track", [230, 150, 140]),
    (11, "building", [70, 70, 70]),
    (12, "wall", [102, 102, 156]),
    (13, "fence", [190, 153, 153]),
    (14, "guard rail", [180, 165, 180]),
    (15, "bridge", [150, 100, 100]),
    (16, "tunnel", [150, 120, 90]),
    (17, "pole", [153, 153, 153]),
    (18, "polegroup", [153, 153, 153]),
    (19, "traffic light", [250, 170, 30]),
    (20, "traffic sign", [220, 220, 0]),
    (21, "vegetation", [107, 142, 35]),
    (22, "terrain", [152, 251, 152]),
    (23, "sky", [70, 130, 180]),
    (24, "person", [220, 20, 60]),
    (25, "rider", [255, 0, 0]),
    (26, "car", [0, 0, 142]),
    (27, "truck", [0, 0, 70]),
    (28, "bus", [0, 60, 100]),
    (29, "caravan", [0, 0, 90]),
    (30, "trailer", [0, 0, 110]),
    (31, "train", [0, 80, 100]),
    (32, "motorcycle", [0, 0, 230]),
    (33, "bicycle", [119, 11, 32]),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cityscapes_has_34_classes_in_id_order() {
        let p = Palette::cityscapes(LabelKey::ClassId);
        assert_eq!(p.n_classes(), 34);
        assert_eq!(p.channel_for_id(7), Some(7));
        assert_eq!(p.name(26), Some("car"));
        assert_eq!(p.color(23), Some([70, 130, 180]));
        assert_eq!(p.channel_for_id(34), None);
    }

    #[test]
    fn shared_colors_resolve_to_lowest_id() {
        let p = Palette::cityscapes(LabelKey::Color);
        assert_eq!(p.channel_for_color([0, 0, 0]), Some(0));
        assert_eq!(p.channel_for_color([153, 153, 153]), Some(17));
        assert_eq!(p.channel_for_color([1, 2, 3]), None);
    }

    #[test]
    fn parses_sparse_ids_into_dense_channels() {
        let tsv = b"schema_version=1\n\n# comment\n9\tsky\t70,130,180\n2\ttraffic%20light\t250,170,30\n";
        let p = Palette::new(LabelKey::ClassId, parse_palette_tsv(tsv).unwrap()).unwrap();
        assert_eq!(p.n_classes(), 2);
        assert_eq!(p.channel_for_id(2), Some(0));
        assert_eq!(p.channel_for_id(9), Some(1));
        assert_eq!(p.name(0), Some("traffic light"));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let tsv = b"schema_version=1\n1\ta\t0,0,0\n1\tb\t1,1,1\n";
        assert!(matches!(
            parse_palette_tsv(tsv),
            Err(PaletteError::DuplicateId(1))
        ));
    }

    #[test]
    fn reports_bad_lines_with_numbers() {
        let tsv = b"schema_version=1\n1\ta\t0,0\n";
        match parse_palette_tsv(tsv) {
            Err(PaletteError::Line { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            parse_palette_tsv(b"schema_version=2\n"),
            Err(PaletteError::UnsupportedSchemaVersion(2))
        ));
        assert!(matches!(parse_palette_tsv(b""), Err(PaletteError::Empty)));
    }

    #[test]
    fn empty_palette_is_rejected() {
        assert!(matches!(
            Palette::new(LabelKey::Color, Vec::new()),
            Err(PaletteError::NoClasses)
        ));
    }
}
