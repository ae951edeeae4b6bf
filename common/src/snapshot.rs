//! Snapshot files: naming, writing and listing the flat image store.
//!
//! Snapshots are append-only.  A file is written under a `.part` name and
//! renamed into place, so listings never see a half-written image.
//!
//! File names follow the pattern:
//!   `snapshot_20240603_090000.jpg`
//!   `snapshot_20240603_090000_1.jpg`   (second capture in the same second)

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const PART_SUFFIX: &str = ".part";

/// One image in the snapshot area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub name: String,
    pub modified: SystemTime,
    pub size: u64,
}

/// Image count and newest file of the snapshot area.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageStats {
    pub count: u64,
    pub latest: Option<SnapshotFile>,
}

/// Base file name for a capture taken at `at`.
pub fn snapshot_filename<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("snapshot_{}.jpg", at.format("%Y%m%d_%H%M%S"))
}

/// Recover the capture time encoded in a snapshot file name.
pub fn parse_capture_time(name: &str) -> Option<NaiveDateTime> {
    let stem = Path::new(name).file_stem()?.to_str()?;
    let rest = stem.strip_prefix("snapshot_")?;
    let stamp = rest.get(..15)?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S").ok()
}

/// True for names a client may use to address a snapshot.
pub fn is_safe_image_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
        && has_image_extension(Path::new(name))
}

/// Persist image bytes captured at `at` into `dir`.
///
/// Never overwrites: a same-second collision gets a `_N` suffix.
pub fn write_snapshot<Tz: TimeZone>(dir: &Path, at: &DateTime<Tz>, bytes: &[u8]) -> Result<SnapshotFile>
where
    Tz::Offset: std::fmt::Display,
{
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Cannot create snapshot dir {}", dir.display()))?;

    let base = snapshot_filename(at);
    let stem = base.trim_end_matches(".jpg");
    let mut name = base.clone();
    let mut n = 0;
    while dir.join(&name).exists() {
        n += 1;
        name = format!("{stem}_{n}.jpg");
    }

    let path = dir.join(&name);
    let part = dir.join(format!("{name}{PART_SUFFIX}"));
    std::fs::write(&part, bytes).with_context(|| format!("Cannot write {}", part.display()))?;
    std::fs::rename(&part, &path)
        .with_context(|| format!("Cannot move snapshot into place: {}", path.display()))?;

    let meta = std::fs::metadata(&path)?;
    Ok(SnapshotFile {
        path,
        name,
        modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        size: meta.len(),
    })
}

/// List image files directly inside `dir` (no recursion).
///
/// A missing directory is an empty store, not an error.
pub fn list_snapshots(dir: &Path) -> Result<Vec<SnapshotFile>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Cannot list {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !has_image_extension(&path) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        files.push(SnapshotFile {
            name: entry.file_name().to_string_lossy().to_string(),
            path,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: meta.len(),
        });
    }
    Ok(files)
}

/// Deterministic render order: modification time, then file name.
pub fn order_for_render(files: &mut [SnapshotFile]) {
    files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
}

/// Keep files modified within `[low, high]`.  A missing bound is open.
pub fn retain_between(files: &mut Vec<SnapshotFile>, low: Option<SystemTime>, high: Option<SystemTime>) {
    files.retain(|f| {
        low.map_or(true, |l| f.modified >= l) && high.map_or(true, |h| f.modified <= h)
    });
}

/// Count images and find the newest one.
pub fn image_stats(dir: &Path) -> Result<ImageStats> {
    let files = list_snapshots(dir)?;
    let count = files.len() as u64;
    let latest = files
        .into_iter()
        .max_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
    Ok(ImageStats { count, latest })
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}
