//! Drift detection against a saved snapshot
//!
//! Verification answers one question: does the tree below a root still look
//! the way a snapshot recorded it?
//!
//! ## Process
//!
//! 1. [`scan_backup`] walks the whole tree with no rules. The reserved control
//!    path [`CONTROL_PATH`] is always put into the ignored bucket and never
//!    entered.
//! 2. Every scanned file is hashed again through a [`DigestSource`].
//! 3. The snapshot and the live tree are flattened to path-keyed maps and
//!    compared:
//!    - **missing**: recorded but no longer present
//!    - **unexpected**: present but never recorded, plus everything the scan
//!      ignored or could not read
//!    - **changed**: present on both sides but failing [`lenient_match`]
//!
//! ## Lenient matching
//!
//! Timestamps, ownership and permission strings drift for reasons that have
//! nothing to do with content (restores, `chown`, `touch`), so they are never
//! compared. What is compared is the entry kind and name, file digest and size,
//! symlink target, and for directories the set of child names. Directory
//! attributes on their own never make a directory count as changed.
//!
//! ## Unreadable files
//!
//! Hash the live tree with
//! [`HashPolicy::ReportFailures`](crate::hashing::HashPolicy::ReportFailures): a file that cannot
//! be read is reported in `scan_errors` (and therefore in `unexpected`) and
//! left out of change detection, instead of aborting the whole run.
//!
//! ```rust,no_run
//! use backstop::hashing::{HashOptions, HashPolicy, ParallelHasher};
//! use backstop::snapshot::Snapshot;
//! use backstop::verification::verify_backup;
//! use std::path::Path;
//!
//! # fn main() -> backstop::Result<()> {
//! let snapshot = Snapshot::load(Path::new("/backups/host/snapshot.json"))?;
//! let hasher = ParallelHasher::new(HashOptions {
//!     policy: HashPolicy::ReportFailures,
//!     ..Default::default()
//! });
//! let result = verify_backup(Path::new("/restore/host"), &snapshot, &hasher)?;
//! println!("{}", result.summary());
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use crate::hashing::DigestSource;
use crate::identity::IdentityTable;
use crate::metadata::{get_directory_node, get_file_node, get_symlink_node, Node, NodeKind};
use crate::path::VirtualPath;
use crate::snapshot::Snapshot;
use crate::types::{ScanError, ScanResult};
use crate::walk::{walk_tree, Selection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Reserved virtual path that scans never descend into
pub const CONTROL_PATH: &str = "/.backstop";

/// Outcome of comparing a live tree with a snapshot
///
/// Every path list is sorted and free of duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Present on both sides with different content
    pub changed: Vec<VirtualPath>,
    /// Recorded in the snapshot but absent from the tree
    pub missing: Vec<VirtualPath>,
    /// Present in the tree but not recorded, ignored by the scan, or unreadable
    pub unexpected: Vec<VirtualPath>,
    /// I/O problems hit while scanning or hashing
    pub scan_errors: Vec<ScanError>,
    /// Entries compared
    pub entries_checked: usize,
    /// Time taken in milliseconds
    pub verification_time_ms: u64,
}

impl VerificationResult {
    /// True when nothing changed, nothing is missing or unexpected, and the
    /// scan had no errors
    pub fn is_clean(&self) -> bool {
        self.changed.is_empty()
            && self.missing.is_empty()
            && self.unexpected.is_empty()
            && self.scan_errors.is_empty()
    }

    /// One-line description of the outcome
    pub fn summary(&self) -> String {
        if self.is_clean() {
            return format!(
                "Tree matches snapshot ({} entries checked in {}ms)",
                self.entries_checked, self.verification_time_ms
            );
        }

        let issues = [
            (self.changed.len(), "changed"),
            (self.missing.len(), "missing"),
            (self.unexpected.len(), "unexpected"),
            (self.scan_errors.len(), "scan errors"),
        ]
        .into_iter()
        .filter(|(count, _)| *count > 0)
        .map(|(count, label)| format!("{} {}", count, label))
        .collect::<Vec<_>>()
        .join(", ");

        format!(
            "Tree differs from snapshot: {} ({} entries checked)",
            issues, self.entries_checked
        )
    }
}

/// Walk every entry below `root`, skipping only [`CONTROL_PATH`]
///
/// The root is always recorded as `/`.
pub fn scan_backup(root: &Path) -> Result<ScanResult> {
    let mut result = walk_tree(root, |vpath, _| {
        if vpath.as_str() == CONTROL_PATH {
            Selection::Ignore
        } else {
            Selection::Record
        }
    })?;
    result.directories.insert(0, VirtualPath::root());

    info!(
        "Scanned {:?}: {} entries, {} ignored, {} errors",
        root,
        result.recorded_count(),
        result.ignored.len(),
        result.errors.len()
    );
    Ok(result)
}

/// Compare the attributes that matter, ignoring directory children
fn same_entry(a: &Node, b: &Node) -> bool {
    if a.name() != b.name() {
        return false;
    }
    match (&a.kind, &b.kind) {
        (
            NodeKind::File { digest, size },
            NodeKind::File {
                digest: other_digest,
                size: other_size,
            },
        ) => digest == other_digest && size == other_size,
        (NodeKind::Symlink { target }, NodeKind::Symlink { target: other_target }) => {
            target == other_target
        }
        (NodeKind::Directory { .. }, NodeKind::Directory { .. }) => true,
        _ => false,
    }
}

/// Whether two nodes describe the same entry, ignoring volatile attributes
///
/// Access, change and modify times, owner, group and permissions are not
/// compared. Directories match when they have the same set of child names;
/// the children themselves are not compared.
pub fn lenient_match(a: &Node, b: &Node) -> bool {
    same_entry(a, b)
        && match (a.children(), b.children()) {
            (Some(left), Some(right)) => left.keys().eq(right.keys()),
            _ => true,
        }
}

/// Check the tree below `root` against `snapshot`
///
/// Digests come from `source`. With a source that reports failures per path,
/// unreadable files end up in `scan_errors`; with a strict source the first
/// unreadable file fails the call.
pub fn verify_backup(
    root: &Path,
    snapshot: &Snapshot,
    source: &dyn DigestSource,
) -> Result<VerificationResult> {
    let start = Instant::now();
    let ids = IdentityTable::capture();
    let scan = scan_backup(root)?;
    let mut scan_errors = scan.errors;

    let batch = source.compute(root, &scan.files)?;
    debug!(
        "{} hashed {} live files ({} failures)",
        source.name(),
        batch.digests.len(),
        batch.failures.len()
    );
    scan_errors.extend(batch.failures.into_iter().map(|failure| ScanError {
        path: Some(failure.path),
        message: failure.message,
    }));

    let live_paths: BTreeSet<&VirtualPath> = scan
        .files
        .iter()
        .chain(&scan.symlinks)
        .chain(&scan.directories)
        .collect();

    // Names of every live entry below each live directory.
    let mut live_children: BTreeMap<VirtualPath, BTreeSet<&str>> = BTreeMap::new();
    for path in &live_paths {
        if let Some(parent) = path.parent() {
            live_children
                .entry(parent)
                .or_default()
                .insert(path.file_name());
        }
    }

    let mut live: BTreeMap<&VirtualPath, Node> = BTreeMap::new();
    let mut capture = |path: &VirtualPath, node: Result<Node>| match node {
        Ok(node) => Some(node),
        Err(e) => {
            warn!("Could not stat {}: {}", path, e);
            scan_errors.push(ScanError {
                path: Some(path.clone()),
                message: e.to_string(),
            });
            None
        }
    };
    for path in &scan.files {
        // Files that failed to hash are left out of change detection.
        if batch.digests.contains_key(path) {
            if let Some(node) = capture(path, get_file_node(root, path, &batch.digests, &ids)) {
                live.insert(path, node);
            }
        }
    }
    for path in &scan.symlinks {
        if let Some(node) = capture(path, get_symlink_node(root, path, &ids)) {
            live.insert(path, node);
        }
    }
    for path in &scan.directories {
        if let Some(node) = capture(path, get_directory_node(root, path, &ids)) {
            live.insert(path, node);
        }
    }

    let recorded = snapshot.flatten();

    let missing: Vec<VirtualPath> = recorded
        .keys()
        .filter(|path| !live_paths.contains(path))
        .cloned()
        .collect();

    let mut unexpected: BTreeSet<VirtualPath> = live_paths
        .iter()
        .filter(|path| !recorded.contains_key(**path))
        .map(|path| (*path).clone())
        .collect();
    unexpected.extend(scan.ignored.iter().cloned());
    unexpected.extend(scan_errors.iter().filter_map(|error| error.path.clone()));

    let no_children = BTreeSet::new();
    let mut changed = Vec::new();
    let mut entries_checked = 0;
    for (path, recorded_node) in &recorded {
        let Some(live_node) = live.get(path) else {
            continue;
        };
        entries_checked += 1;

        let children_match = match recorded_node.children() {
            Some(children) => {
                let live_names = live_children.get(path).unwrap_or(&no_children);
                children.keys().map(String::as_str).eq(live_names.iter().copied())
            }
            None => true,
        };
        if !same_entry(recorded_node, live_node) || !children_match {
            debug!("Changed: {} ({})", path, recorded_node.kind_name());
            changed.push(path.clone());
        }
    }

    let result = VerificationResult {
        changed,
        missing,
        unexpected: unexpected.into_iter().collect(),
        scan_errors,
        entries_checked,
        verification_time_ms: start.elapsed().as_millis() as u64,
    };
    info!("{}", result.summary());
    Ok(result)
}
