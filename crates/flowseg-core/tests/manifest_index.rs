use std::path::PathBuf;

use anyhow::Result;

use flowseg_core::index::IndexError;
use flowseg_core::{DatasetIndex, ManifestIndex, SplitName};

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

#[test]
fn manifest_preserves_line_order_per_split() -> Result<()> {
    let manifest = "schema_version=0\n\
# comment lines are ignored\n\
train\tf/0.png\tf/1.png\tl/1.png\n\
val\tf/10.png\tf/11.png\tl/11.png\n\
\n\
train\tf/1.png\tf/2.png\tl/2.png\n";
    let idx = ManifestIndex::from_bytes(manifest.as_bytes(), "/data")?;

    let train = idx.load(SplitName::Train)?;
    assert_eq!(train.len(), 2);
    assert_eq!(train[0].curr_frame, PathBuf::from("/data/f/1.png"));
    assert_eq!(train[1].curr_frame, PathBuf::from("/data/f/2.png"));
    assert_eq!(train[1].label, PathBuf::from("/data/l/2.png"));

    assert_eq!(idx.load(SplitName::Val)?.len(), 1);
    assert!(idx.load(SplitName::Test)?.is_empty());
    Ok(())
}

#[test]
fn manifest_keeps_absolute_paths() -> Result<()> {
    let manifest = "schema_version=0\ntest\t/abs/a.png\trel/b.png\t/abs/l.png\n";
    let idx = ManifestIndex::from_bytes(manifest.as_bytes(), "/root")?;
    let test = idx.load(SplitName::Test)?;
    assert_eq!(test[0].prev_frame, PathBuf::from("/abs/a.png"));
    assert_eq!(test[0].curr_frame, PathBuf::from("/root/rel/b.png"));
    Ok(())
}

#[test]
fn manifest_reports_line_numbers() {
    let manifest = "schema_version=0\ntrain\ta\tb\tc\nholdout\ta\tb\tc\n";
    let err = ManifestIndex::from_bytes(manifest.as_bytes(), "/d").unwrap_err();
    match err {
        IndexError::Line { line, reason } => {
            assert_eq!(line, 3);
            assert!(reason.contains("holdout"), "{reason}");
        }
        other => panic!("unexpected error {other:?}"),
    }

    let manifest = "schema_version=0\ntrain\ta\tb\n";
    let err = ManifestIndex::from_bytes(manifest.as_bytes(), "/d").unwrap_err();
    assert!(matches!(err, IndexError::Line { line: 2, .. }));
}

#[test]
fn manifest_open_resolves_against_its_directory() -> Result<()> {
    let root = temp_dir("manifest-open")?;
    let path = root.join("index.tsv");
    std::fs::write(&path, "schema_version=0\ntrain\ta.png\tb.png\tc.png\n")?;

    let idx = ManifestIndex::open(&path)?;
    let train = idx.load(SplitName::Train)?;
    assert_eq!(train[0].prev_frame, root.join("a.png"));
    assert_eq!(idx.source(), path.as_path());
    Ok(())
}

#[test]
fn manifest_open_missing_file_is_io_error() {
    let err = ManifestIndex::open("/definitely/not/here.tsv").unwrap_err();
    assert!(matches!(err, IndexError::Io { .. }));
}
