//! Per-entry metadata capture
//!
//! Every recorded entry becomes a [`Node`]: the attributes all entries share
//! ([`EntryMetadata`]) plus the fields that only make sense for its kind
//! ([`NodeKind`]). Directories own their children by name, so a tree of nodes
//! is the whole recorded state of a backup.
//!
//! Metadata is always read with `lstat` semantics: symbolic links are described
//! as links and never followed.

use crate::error::{BackstopError, Result};
use crate::hashing::{Digest, DigestMap};
use crate::identity::IdentityTable;
use crate::path::{build_native_path, VirtualPath};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::trace;

/// Attributes recorded for every kind of entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Base name; empty for the root
    pub name: String,
    /// Last access time
    pub atime: DateTime<Utc>,
    /// Last status change time
    pub ctime: DateTime<Utc>,
    /// Last modification time
    pub mtime: DateTime<Utc>,
    /// Owner name, or the numeric uid when it has no name
    pub user: String,
    /// Group name, or the numeric gid when it has no name
    pub group: String,
    /// Long-listing permission string, e.g. `drwxr-xr-x`
    pub permissions: String,
}

/// Kind-specific part of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// A regular file
    File {
        /// Content digest
        digest: Digest,
        /// Size in bytes
        size: u64,
    },
    /// A directory and the entries recorded below it, keyed by base name
    Directory {
        /// Child nodes
        children: BTreeMap<String, Node>,
    },
    /// A symbolic link
    Symlink {
        /// Link target as stored in the link, unresolved
        target: String,
    },
}

/// One recorded entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Shared attributes
    pub meta: EntryMetadata,
    /// Kind-specific fields
    pub kind: NodeKind,
}

impl Node {
    /// Base name of the entry
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Short label for the kind: `file`, `directory` or `symlink`
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            NodeKind::File { .. } => "file",
            NodeKind::Directory { .. } => "directory",
            NodeKind::Symlink { .. } => "symlink",
        }
    }

    /// Whether this is a file node
    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    /// Whether this is a directory node
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    /// Whether this is a symlink node
    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, NodeKind::Symlink { .. })
    }

    /// Children of a directory node, `None` for other kinds
    pub fn children(&self) -> Option<&BTreeMap<String, Node>> {
        match &self.kind {
            NodeKind::Directory { children } => Some(children),
            _ => None,
        }
    }
}

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

const S_ISUID: u32 = 0o4000;
const S_ISGID: u32 = 0o2000;
const S_ISVTX: u32 = 0o1000;

/// Render a raw `st_mode` the way `ls -l` does
///
/// One type character followed by three `rwx` triplets. The set-user-id,
/// set-group-id and sticky bits take over the matching execute slot as `s`/`t`
/// when execute is also set and `S`/`T` when it is not.
pub fn format_permissions(mode: u32) -> String {
    let type_char = match mode & S_IFMT {
        S_IFREG => '-',
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        S_IFIFO => 'p',
        S_IFSOCK => 's',
        S_IFCHR => 'c',
        S_IFBLK => 'b',
        _ => '?',
    };

    let triplet = |read: u32, write: u32, exec: u32, special: u32, on: char, off: char| {
        let x = match (mode & exec != 0, mode & special != 0) {
            (true, true) => on,
            (false, true) => off,
            (true, false) => 'x',
            (false, false) => '-',
        };
        [
            if mode & read != 0 { 'r' } else { '-' },
            if mode & write != 0 { 'w' } else { '-' },
            x,
        ]
    };

    let mut rendered = String::with_capacity(10);
    rendered.push(type_char);
    rendered.extend(triplet(0o400, 0o200, 0o100, S_ISUID, 's', 'S'));
    rendered.extend(triplet(0o040, 0o020, 0o010, S_ISGID, 's', 'S'));
    rendered.extend(triplet(0o004, 0o002, 0o001, S_ISVTX, 't', 'T'));
    rendered
}

#[cfg(unix)]
fn timestamps(metadata: &fs::Metadata) -> Result<[DateTime<Utc>; 3]> {
    use std::os::unix::fs::MetadataExt;

    let at = |secs: i64, nanos: i64| {
        DateTime::from_timestamp(secs, nanos as u32).ok_or_else(|| {
            BackstopError::internal(format!("timestamp {}.{} out of range", secs, nanos))
        })
    };
    Ok([
        at(metadata.atime(), metadata.atime_nsec())?,
        at(metadata.ctime(), metadata.ctime_nsec())?,
        at(metadata.mtime(), metadata.mtime_nsec())?,
    ])
}

#[cfg(not(unix))]
fn timestamps(metadata: &fs::Metadata) -> Result<[DateTime<Utc>; 3]> {
    let modified: DateTime<Utc> = metadata.modified()?.into();
    let accessed = metadata.accessed().map(DateTime::from).unwrap_or(modified);
    let created = metadata.created().map(DateTime::from).unwrap_or(modified);
    Ok([accessed, created, modified])
}

#[cfg(unix)]
fn ownership(metadata: &fs::Metadata, ids: &IdentityTable) -> (String, String, String) {
    use std::os::unix::fs::MetadataExt;

    (
        ids.user_name(metadata.uid()),
        ids.group_name(metadata.gid()),
        format_permissions(metadata.mode()),
    )
}

#[cfg(not(unix))]
fn ownership(metadata: &fs::Metadata, _ids: &IdentityTable) -> (String, String, String) {
    let file_type = metadata.file_type();
    let mut mode = if file_type.is_dir() {
        S_IFDIR | 0o755
    } else if file_type.is_symlink() {
        S_IFLNK | 0o777
    } else {
        S_IFREG | 0o644
    };
    if metadata.permissions().readonly() {
        mode &= !0o222;
    }
    (String::new(), String::new(), format_permissions(mode))
}

fn stat(
    root: &Path,
    path: &VirtualPath,
    ids: &IdentityTable,
) -> Result<(EntryMetadata, fs::Metadata)> {
    let native = build_native_path(root, path)?;
    let metadata = fs::symlink_metadata(&native)?;
    let [atime, ctime, mtime] = timestamps(&metadata)?;
    let (user, group, permissions) = ownership(&metadata, ids);

    let meta = EntryMetadata {
        name: path.file_name().to_string(),
        atime,
        ctime,
        mtime,
        user,
        group,
        permissions,
    };
    Ok((meta, metadata))
}

/// Capture the shared attributes of the entry at `path` below `root`
pub fn get_default_metadata(
    root: &Path,
    path: &VirtualPath,
    ids: &IdentityTable,
) -> Result<EntryMetadata> {
    stat(root, path, ids).map(|(meta, _)| meta)
}

/// Build a file node; the digest must already be in `digests`
pub fn get_file_node(
    root: &Path,
    path: &VirtualPath,
    digests: &DigestMap,
    ids: &IdentityTable,
) -> Result<Node> {
    let digest = digests
        .get(path)
        .cloned()
        .ok_or_else(|| BackstopError::internal(format!("no digest computed for {}", path)))?;
    let (meta, metadata) = stat(root, path, ids)?;
    trace!("File node {} ({} bytes)", path, metadata.len());
    Ok(Node {
        meta,
        kind: NodeKind::File {
            digest,
            size: metadata.len(),
        },
    })
}

/// Build a symlink node; the link is read, never followed
pub fn get_symlink_node(
    root: &Path,
    path: &VirtualPath,
    ids: &IdentityTable,
) -> Result<Node> {
    let (meta, _) = stat(root, path, ids)?;
    let target = fs::read_link(build_native_path(root, path)?)?;
    let target = target
        .to_str()
        .ok_or_else(|| {
            BackstopError::invalid_path(target.to_string_lossy(), "link target is not valid UTF-8")
        })?
        .to_string();
    trace!("Symlink node {} -> {}", path, target);
    Ok(Node {
        meta,
        kind: NodeKind::Symlink { target },
    })
}

/// Build a directory node with no children
pub fn get_directory_node(
    root: &Path,
    path: &VirtualPath,
    ids: &IdentityTable,
) -> Result<Node> {
    let (meta, _) = stat(root, path, ids)?;
    Ok(Node {
        meta,
        kind: NodeKind::Directory {
            children: BTreeMap::new(),
        },
    })
}
