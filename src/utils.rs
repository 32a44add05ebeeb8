//! Utility functions for Backstop
//!
//! Small helpers shared across modules: atomic file replacement for documents
//! Backstop writes (snapshots, configuration, the store layout marker) and
//! human-readable byte formatting for reports.

use crate::error::{BackstopError, Result};
use std::io::Write;
use std::path::Path;
use tracing::trace;

/// Replace the file at `path` with `content` atomically
///
/// The content is written to a temporary file in the same directory, flushed,
/// and renamed over `path`, so a reader sees either the old or the new content
/// and never a partial write.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|e| BackstopError::Io(e.error))?;

    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// Format a byte count for display ("1.50 KB")
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
