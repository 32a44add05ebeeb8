//! Snapshots: the recorded tree of one backup run
//!
//! A [`Snapshot`] is a single rooted directory [`Node`]. It is built once, from
//! the paths a walk selected plus their digests, and is read-only afterwards.
//!
//! ## Tree assembly
//!
//! Nodes are first collected in an index keyed by full virtual path. Every
//! ancestor a recorded entry needs but that was not itself selected is added
//! to the index as an implicit directory, so the finished tree is connected
//! from `/` to every leaf. The index is then drained deepest-first: a path
//! always sorts after its ancestors, so popping from the back hands each node
//! to its parent only once all of its own children are attached.
//!
//! ## On-disk format
//!
//! Snapshots are stored as a JSON [`SnapshotDocument`] with exactly three
//! top-level collections, `files`, `symlinks` and `directories`, each a list of
//! flat records carrying the entry's path. Loading rebuilds the tree with the
//! same index algorithm and rejects documents with any other key set, records
//! whose parent directory is absent, or no root record.
//!
//! ```rust,no_run
//! use backstop::snapshot::Snapshot;
//! use std::path::Path;
//!
//! # fn main() -> backstop::Result<()> {
//! let snapshot = Snapshot::load(Path::new("/backups/host/snapshot.json"))?;
//! let stats = snapshot.stats();
//! println!("{} files, {} bytes", stats.files, stats.total_bytes);
//! # Ok(())
//! # }
//! ```

use crate::error::{BackstopError, Result};
use crate::hashing::{Digest, DigestMap};
use crate::identity::IdentityTable;
use crate::metadata::{
    get_directory_node, get_file_node, get_symlink_node, EntryMetadata, Node, NodeKind,
};
use crate::path::VirtualPath;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// A file entry in a snapshot document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Virtual path of the file
    pub path: VirtualPath,
    /// Shared attributes
    #[serde(flatten)]
    pub meta: EntryMetadata,
    /// Content digest
    pub digest: Digest,
    /// Size in bytes
    pub size: u64,
}

/// A symlink entry in a snapshot document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkRecord {
    /// Virtual path of the link
    pub path: VirtualPath,
    /// Shared attributes
    #[serde(flatten)]
    pub meta: EntryMetadata,
    /// Link target, unresolved
    pub target: String,
}

/// A directory entry in a snapshot document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    /// Virtual path of the directory
    pub path: VirtualPath,
    /// Shared attributes
    #[serde(flatten)]
    pub meta: EntryMetadata,
}

/// Flat, serializable form of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotDocument {
    /// File records
    pub files: Vec<FileRecord>,
    /// Symlink records
    pub symlinks: Vec<SymlinkRecord>,
    /// Directory records, including `/`
    pub directories: Vec<DirectoryRecord>,
}

/// Entry counts for a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStats {
    /// Number of files
    pub files: usize,
    /// Number of symlinks
    pub symlinks: usize,
    /// Number of directories, including `/`
    pub directories: usize,
    /// Sum of file sizes
    pub total_bytes: u64,
}

/// The complete recorded state of one backup run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    root: Node,
}

/// Path-keyed node index used while assembling a tree
#[derive(Default)]
struct NodeIndex {
    nodes: BTreeMap<VirtualPath, Node>,
}

impl NodeIndex {
    fn insert(&mut self, path: VirtualPath, node: Node) -> Result<()> {
        if self.nodes.contains_key(&path) {
            return Err(BackstopError::invalid_snapshot(format!(
                "{} is recorded more than once",
                path
            )));
        }
        self.nodes.insert(path, node);
        Ok(())
    }

    /// Ancestors some entry needs that are not in the index yet, root first
    fn missing_ancestors(&self) -> BTreeSet<VirtualPath> {
        let mut missing = BTreeSet::new();
        for path in self.nodes.keys() {
            let mut current = path.parent();
            while let Some(parent) = current {
                if self.nodes.contains_key(&parent) || missing.contains(&parent) {
                    break;
                }
                current = parent.parent();
                missing.insert(parent);
            }
        }
        missing
    }

    /// Attach every node to its parent and return the root
    fn into_tree(mut self) -> Result<Node> {
        while let Some((path, node)) = self.nodes.pop_last() {
            let Some(parent_path) = path.parent() else {
                if !node.is_directory() {
                    return Err(BackstopError::invalid_snapshot(
                        "the root entry is not a directory",
                    ));
                }
                return Ok(node);
            };

            let parent = self.nodes.get_mut(&parent_path).ok_or_else(|| {
                BackstopError::invalid_snapshot(format!(
                    "{} has no parent directory record",
                    path
                ))
            })?;
            match &mut parent.kind {
                NodeKind::Directory { children } => {
                    children.insert(path.file_name().to_string(), node);
                }
                _ => {
                    return Err(BackstopError::invalid_snapshot(format!(
                        "{} is below {} which is not a directory",
                        path, parent_path
                    )))
                }
            }
        }
        Err(BackstopError::invalid_snapshot("no root directory record"))
    }
}

/// Build the snapshot for a set of selected paths below `root`
///
/// `digests` must hold a digest for every path in `files`. Ancestors of any
/// entry that are missing from `directories` are captured from disk as
/// implicit directories. A path listed twice, in one list or across lists, is
/// an error.
pub fn build_snapshot(
    root: &Path,
    files: &[VirtualPath],
    symlinks: &[VirtualPath],
    directories: &[VirtualPath],
    digests: &DigestMap,
    ids: &IdentityTable,
) -> Result<Snapshot> {
    let mut index = NodeIndex::default();
    for path in files {
        index.insert(path.clone(), get_file_node(root, path, digests, ids)?)?;
    }
    for path in symlinks {
        index.insert(path.clone(), get_symlink_node(root, path, ids)?)?;
    }
    for path in directories {
        index.insert(path.clone(), get_directory_node(root, path, ids)?)?;
    }
    if !index.nodes.contains_key(&VirtualPath::root()) {
        index.insert(
            VirtualPath::root(),
            get_directory_node(root, &VirtualPath::root(), ids)?,
        )?;
    }

    let implicit = index.missing_ancestors();
    debug!("Synthesizing {} implicit directories", implicit.len());
    for path in implicit {
        let node = get_directory_node(root, &path, ids)?;
        index.insert(path, node)?;
    }

    let snapshot = Snapshot {
        root: index.into_tree()?,
    };
    let stats = snapshot.stats();
    info!(
        "Built snapshot: {} files, {} symlinks, {} directories ({})",
        stats.files,
        stats.symlinks,
        stats.directories,
        utils::format_bytes(stats.total_bytes)
    );
    Ok(snapshot)
}

impl Snapshot {
    /// Wrap a root node; it must be a directory named `""`
    pub fn new(root: Node) -> Result<Self> {
        if !root.is_directory() || !root.name().is_empty() {
            return Err(BackstopError::invalid_snapshot(
                "the root must be an unnamed directory",
            ));
        }
        Ok(Self { root })
    }

    /// The root directory node
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Look up the node at `path`
    pub fn get(&self, path: &VirtualPath) -> Option<&Node> {
        path.parts()
            .into_iter()
            .try_fold(&self.root, |node, part| node.children()?.get(part))
    }

    /// Every node keyed by its full virtual path, `/` included
    pub fn flatten(&self) -> BTreeMap<VirtualPath, &Node> {
        let mut flat = BTreeMap::new();
        let mut stack = vec![(VirtualPath::root(), &self.root)];
        while let Some((path, node)) = stack.pop() {
            if let Some(children) = node.children() {
                for (name, child) in children {
                    // Names came from validated paths or from join below.
                    if let Ok(child_path) = path.join(name) {
                        stack.push((child_path, child));
                    }
                }
            }
            flat.insert(path, node);
        }
        flat
    }

    /// Entry counts and total file size
    pub fn stats(&self) -> SnapshotStats {
        let mut stats = SnapshotStats::default();
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            match &node.kind {
                NodeKind::File { size, .. } => {
                    stats.files += 1;
                    stats.total_bytes += size;
                }
                NodeKind::Symlink { .. } => stats.symlinks += 1,
                NodeKind::Directory { children } => {
                    stats.directories += 1;
                    stack.extend(children.values());
                }
            }
        }
        stats
    }

    /// Flatten into the on-disk document form, each collection in path order
    pub fn to_document(&self) -> SnapshotDocument {
        let mut document = SnapshotDocument::default();
        for (path, node) in self.flatten() {
            let meta = node.meta.clone();
            match &node.kind {
                NodeKind::File { digest, size } => document.files.push(FileRecord {
                    path,
                    meta,
                    digest: digest.clone(),
                    size: *size,
                }),
                NodeKind::Symlink { target } => document.symlinks.push(SymlinkRecord {
                    path,
                    meta,
                    target: target.clone(),
                }),
                NodeKind::Directory { .. } => {
                    document.directories.push(DirectoryRecord { path, meta })
                }
            }
        }
        document
    }

    /// Rebuild a snapshot from its document form
    ///
    /// Every record's `name` must be its path's base name, every record except
    /// `/` needs a directory record for its parent, and there must be a root.
    pub fn from_document(document: SnapshotDocument) -> Result<Self> {
        let mut index = NodeIndex::default();

        let mut add = |path: VirtualPath, meta: EntryMetadata, kind: NodeKind| {
            if meta.name != path.file_name() {
                return Err(BackstopError::invalid_snapshot(format!(
                    "record for {} is named '{}'",
                    path, meta.name
                )));
            }
            index.insert(path, Node { meta, kind })
        };
        for record in document.files {
            add(
                record.path,
                record.meta,
                NodeKind::File {
                    digest: record.digest,
                    size: record.size,
                },
            )?;
        }
        for record in document.symlinks {
            add(
                record.path,
                record.meta,
                NodeKind::Symlink {
                    target: record.target,
                },
            )?;
        }
        for record in document.directories {
            add(
                record.path,
                record.meta,
                NodeKind::Directory {
                    children: BTreeMap::new(),
                },
            )?;
        }

        Ok(Self {
            root: index.into_tree()?,
        })
    }

    /// Serialize as pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_document())?)
    }

    /// Parse a JSON snapshot document
    pub fn from_json(json: &str) -> Result<Self> {
        let document: SnapshotDocument = serde_json::from_str(json)
            .map_err(|e| BackstopError::invalid_snapshot(e.to_string()))?;
        Self::from_document(document)
    }

    /// Write the snapshot to `path`, replacing any previous file atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        utils::atomic_write(path, self.to_json()?.as_bytes())?;
        debug!("Saved snapshot to {:?}", path);
        Ok(())
    }

    /// Read a snapshot from `path`
    pub fn load(path: &Path) -> Result<Self> {
        let snapshot = Self::from_json(&fs::read_to_string(path)?)?;
        debug!("Loaded snapshot from {:?}", path);
        Ok(snapshot)
    }
}
