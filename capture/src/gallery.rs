//! Removing snapshots from the flat image store.

use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use lapse_common::protocol::RangeDeleted;
use lapse_common::snapshot::{self, SnapshotFile};

#[derive(Debug, Error)]
pub enum GalleryError {
    #[error("Invalid picture name")]
    InvalidName,
    #[error("Both start and end are required")]
    MissingBounds,
    #[error("Picture not found: {0}")]
    NotFound(String),
    #[error("Picture could not be deleted")]
    Io(#[from] std::io::Error),
}

impl GalleryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidName => "invalid_name",
            Self::MissingBounds => "start_end_required",
            Self::NotFound(_) => "not_found",
            Self::Io(_) => "delete_failed",
        }
    }
}

/// Delete one snapshot.
pub fn delete_picture(dir: &Path, name: &str) -> Result<(), GalleryError> {
    let file = find(dir, name)?;
    std::fs::remove_file(&file.path)?;
    info!("Deleted snapshot {}", file.name);
    Ok(())
}

/// Snapshots modified between the snapshots `start` and `end` (inclusive,
/// either order).
pub fn range(dir: &Path, start: &str, end: &str) -> Result<Vec<SnapshotFile>, GalleryError> {
    let (start, end) = (start.trim(), end.trim());
    if start.is_empty() || end.is_empty() {
        return Err(GalleryError::MissingBounds);
    }
    let a = find(dir, start)?.modified;
    let b = find(dir, end)?.modified;

    let mut files = list(dir)?;
    snapshot::retain_between(&mut files, Some(a.min(b)), Some(a.max(b)));
    snapshot::order_for_render(&mut files);
    Ok(files)
}

/// Delete every snapshot in [`range`].  Individual failures are counted,
/// not fatal.
pub fn delete_range(dir: &Path, start: &str, end: &str) -> Result<RangeDeleted, GalleryError> {
    let files = range(dir, start, end)?;
    let mut deleted = 0;
    let mut failed = 0;
    for file in &files {
        match std::fs::remove_file(&file.path) {
            Ok(()) => deleted += 1,
            Err(e) => {
                warn!("Cannot delete {}: {e}", file.name);
                failed += 1;
            }
        }
    }
    info!("Deleted {deleted} snapshots ({failed} failed)");
    Ok(RangeDeleted {
        ok: failed == 0,
        deleted,
        failed,
    })
}

fn find(dir: &Path, name: &str) -> Result<SnapshotFile, GalleryError> {
    if !snapshot::is_safe_image_name(name) {
        return Err(GalleryError::InvalidName);
    }
    list(dir)?
        .into_iter()
        .find(|f| f.name == name)
        .ok_or_else(|| GalleryError::NotFound(name.to_string()))
}

fn list(dir: &Path) -> Result<Vec<SnapshotFile>, GalleryError> {
    snapshot::list_snapshots(dir).map_err(|e| {
        warn!("Cannot list snapshots: {e:#}");
        GalleryError::Io(std::io::Error::other("cannot list snapshots"))
    })
}
