//! Depth-first tree traversal shared by the pattern walk and the verification scan
//!
//! The walk is single-threaded, top-down and deterministic: entries of a
//! directory are visited in file name order, and a directory is always visited
//! before its contents. That ordering is what makes pruning predictable: the
//! caller's selector sees a directory first and can keep the walker out of it.
//!
//! Symbolic links are never followed. Directories on a different device than
//! the walk's root are recorded but not descended into, so a walk never crosses
//! a mount point. Per-entry I/O errors are collected into the result instead of
//! aborting the walk.

use crate::error::{BackstopError, Result};
use crate::path::{ensure_native_root, get_path_from_native_path, VirtualPath};
use crate::types::{ScanError, ScanResult};
use std::fs::{self, FileType};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, trace, warn};
use walkdir::{DirEntry, WalkDir};

/// What the walker should do with a visited entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Selection {
    /// Record the entry by kind and descend into it if it is a directory
    Record,
    /// Put the entry in the ignored bucket and do not descend
    Ignore,
    /// Drop the entry and its subtree silently
    Prune,
}

/// Walk `root`, letting `select` decide per entry, and bucket what is recorded
///
/// The root itself is not passed to `select`; callers decide about `/`
/// before walking. The root must be an existing directory.
pub(crate) fn walk_tree<F>(root: &Path, mut select: F) -> Result<ScanResult>
where
    F: FnMut(&VirtualPath, FileType) -> Selection,
{
    let start = Instant::now();
    ensure_native_root(root)?;
    let root_metadata = fs::metadata(root)?;
    if !root_metadata.is_dir() {
        return Err(BackstopError::invalid_path(
            root.to_string_lossy(),
            "the root is not a directory",
        ));
    }
    let root_device = device_of(&root_metadata);

    let mut result = ScanResult::default();
    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Walk error: {}", e);
                result.errors.push(ScanError::from_walk_error(root, &e));
                continue;
            }
        };
        let file_type = entry.file_type();

        let vpath = match get_path_from_native_path(root, entry.path()) {
            Ok(vpath) => vpath,
            Err(e) => {
                warn!("Skipping {:?}: {}", entry.path(), e);
                result.errors.push(ScanError {
                    path: None,
                    message: e.to_string(),
                });
                if file_type.is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
        };

        match select(&vpath, file_type) {
            Selection::Prune => {
                trace!("Pruned {}", vpath);
                if file_type.is_dir() {
                    walker.skip_current_dir();
                }
            }
            Selection::Ignore => {
                trace!("Ignored {}", vpath);
                if file_type.is_dir() {
                    walker.skip_current_dir();
                }
                result.ignored.push(vpath);
            }
            Selection::Record => {
                // A link may point at either kind, so it is checked first.
                if file_type.is_symlink() {
                    result.symlinks.push(vpath);
                } else if file_type.is_file() {
                    result.files.push(vpath);
                } else if file_type.is_dir() {
                    match crosses_device(&entry, root_device) {
                        Ok(true) => {
                            debug!("Not descending into mount point {}", vpath);
                            walker.skip_current_dir();
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!("Could not stat {}: {}", vpath, e);
                            result.errors.push(ScanError {
                                path: Some(vpath.clone()),
                                message: e.to_string(),
                            });
                            walker.skip_current_dir();
                        }
                    }
                    result.directories.push(vpath);
                } else {
                    result.ignored.push(vpath);
                }
            }
        }
    }

    debug!(
        "Walked {:?}: {} files, {} symlinks, {} directories, {} ignored, {} errors in {:?}",
        root,
        result.files.len(),
        result.symlinks.len(),
        result.directories.len(),
        result.ignored.len(),
        result.errors.len(),
        start.elapsed()
    );
    Ok(result)
}

#[cfg(unix)]
fn device_of(metadata: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.dev())
}

#[cfg(not(unix))]
fn device_of(_metadata: &fs::Metadata) -> Option<u64> {
    None
}

fn crosses_device(entry: &DirEntry, root_device: Option<u64>) -> std::result::Result<bool, walkdir::Error> {
    let Some(root_device) = root_device else {
        return Ok(false);
    };
    let metadata = entry.metadata()?;
    Ok(device_of(&metadata).is_some_and(|device| device != root_device))
}
