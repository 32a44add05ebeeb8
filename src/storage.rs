//! Content-addressable storage for Backstop
//!
//! Blobs are stored whole, keyed by the SHA-256 [`Digest`] of their content, in a
//! directory tree sharded by digest prefix. Identical content is stored once no
//! matter how many paths or backup runs refer to it.
//!
//! ## Layout
//!
//! With sharding depth `D` (default 2) and two hex characters per shard, the
//! first `2·D` characters of the digest name `D` nested directories and the
//! remainder is the blob's file name:
//!
//! ```text
//! cas_root/
//! ├── layout.json            # {"sharding_depth": 2, "nibbles_per_shard": 2}
//! ├── 00/
//! │   ├── 00/
//! │   ...
//! └── ba/
//!     └── 78/
//!         └── 16bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad
//! ```
//!
//! The depth is fixed for the lifetime of a store. Changing it orphans every
//! blob stored before the change, so `layout.json` records it and
//! [`Cas::prepare`] refuses to run against a store laid out differently. A depth
//! change means building a fresh store and copying content across.
//!
//! ## Write-once
//!
//! [`Cas::store`] streams content into a private temporary file inside the
//! destination shard and publishes it with an atomic no-clobber link. Readers
//! never observe a partially written blob, an existing blob is never
//! overwritten, and of several concurrent writers of one digest exactly one
//! succeeds while the rest get [`BackstopError::AlreadyExists`]. No locks are
//! involved.
//!
//! The digest passed to `store` is trusted: the store does not re-hash content.
//!
//! ## Example
//!
//! ```rust,no_run
//! use backstop::hashing::hash_bytes;
//! use backstop::storage::Cas;
//! use std::io::Read;
//!
//! # fn main() -> backstop::Result<()> {
//! let cas = Cas::new("/var/backups/cas", 2)?;
//! cas.prepare()?;
//!
//! let content = b"go-backup is\na backup tool";
//! let digest = hash_bytes(content);
//! cas.store(&content[..], &digest)?;
//!
//! let mut retrieved = Vec::new();
//! cas.retrieve(&digest)?.read_to_end(&mut retrieved)?;
//! assert_eq!(retrieved, content);
//! # Ok(())
//! # }
//! ```

use crate::error::{BackstopError, Result};
use crate::hashing::Digest;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};
use walkdir::WalkDir;

/// Hex characters per shard directory name
pub const NIBBLES_PER_SHARD: usize = 2;

/// Sharding depth used when none is configured
pub const DEFAULT_SHARDING_DEPTH: usize = 2;

/// Deepest supported sharding
///
/// [`Cas::prepare`] creates every shard directory up front, 65,536 leaves at
/// depth 2. One more level would mean 16.7 million directories.
pub const MAX_SHARDING_DEPTH: usize = 2;

const LAYOUT_FILE: &str = "layout.json";
const TEMP_PREFIX: &str = ".incoming-";

/// Layout parameters recorded at the root of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasLayout {
    /// Number of shard directory levels
    pub sharding_depth: usize,
    /// Hex characters per shard level
    pub nibbles_per_shard: usize,
}

/// Summary of a store's contents
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CasStats {
    /// Number of blobs
    pub blob_count: usize,
    /// Total size of all blobs in bytes
    pub total_bytes: u64,
}

/// Filesystem-backed content-addressable store
#[derive(Debug, Clone)]
pub struct Cas {
    root: PathBuf,
    sharding_depth: usize,
}

impl Cas {
    /// Create a handle on a store rooted at `root` with the given sharding depth
    ///
    /// Nothing is touched on disk; call [`Cas::prepare`] to create the layout.
    ///
    /// # Errors
    ///
    /// - [`BackstopError::InvalidConfiguration`] if the depth exceeds
    ///   [`MAX_SHARDING_DEPTH`]
    pub fn new(root: impl Into<PathBuf>, sharding_depth: usize) -> Result<Self> {
        if sharding_depth > MAX_SHARDING_DEPTH {
            return Err(BackstopError::invalid_configuration(format!(
                "sharding depth {} exceeds the maximum of {}",
                sharding_depth, MAX_SHARDING_DEPTH
            )));
        }
        Ok(Self {
            root: root.into(),
            sharding_depth,
        })
    }

    /// Open an existing store, taking the depth from its recorded layout
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let layout_path = root.join(LAYOUT_FILE);
        if !layout_path.exists() {
            return Err(BackstopError::invalid_configuration(format!(
                "no content store at {:?} (missing {})",
                root, LAYOUT_FILE
            )));
        }
        let layout: CasLayout = serde_json::from_str(&fs::read_to_string(&layout_path)?)?;
        if layout.nibbles_per_shard != NIBBLES_PER_SHARD {
            return Err(BackstopError::invalid_configuration(format!(
                "store at {:?} uses {} nibbles per shard, expected {}",
                root, layout.nibbles_per_shard, NIBBLES_PER_SHARD
            )));
        }
        Self::new(root, layout.sharding_depth)
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of shard levels
    pub fn sharding_depth(&self) -> usize {
        self.sharding_depth
    }

    fn layout(&self) -> CasLayout {
        CasLayout {
            sharding_depth: self.sharding_depth,
            nibbles_per_shard: NIBBLES_PER_SHARD,
        }
    }

    /// Create the layout marker and every shard directory
    ///
    /// Idempotent: existing directories are left alone, so this is safe to
    /// re-run and safe to run while other processes store blobs.
    ///
    /// # Errors
    ///
    /// - [`BackstopError::InvalidConfiguration`] if the store was prepared with
    ///   a different layout
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;

        let layout_path = self.root.join(LAYOUT_FILE);
        if layout_path.exists() {
            let existing: CasLayout = serde_json::from_str(&fs::read_to_string(&layout_path)?)?;
            if existing != self.layout() {
                return Err(BackstopError::invalid_configuration(format!(
                    "store at {:?} was prepared with sharding depth {}, refusing to use depth {}",
                    self.root, existing.sharding_depth, self.sharding_depth
                )));
            }
        } else {
            utils::atomic_write(&layout_path, serde_json::to_string_pretty(&self.layout())?.as_bytes())?;
        }

        create_shard_level(&self.root, self.sharding_depth)?;
        info!(
            "Prepared content store at {:?} (sharding depth {})",
            self.root, self.sharding_depth
        );
        Ok(())
    }

    fn path_components<'d>(&self, digest: &'d Digest) -> Vec<&'d str> {
        let hex = digest.as_str();
        let split = self.sharding_depth * NIBBLES_PER_SHARD;
        let mut components: Vec<&str> = (0..self.sharding_depth)
            .map(|level| &hex[level * NIBBLES_PER_SHARD..(level + 1) * NIBBLES_PER_SHARD])
            .collect();
        components.push(&hex[split..]);
        components
    }

    /// Native path at which the blob for `digest` lives
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(self.path_components(digest));
        path
    }

    /// Whether a blob for `digest` is present
    pub fn has_file(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blob_path(digest).try_exists()?)
    }

    /// Store `content` under the caller-asserted `digest`, returning its size
    ///
    /// # Errors
    ///
    /// - [`BackstopError::AlreadyExists`] if a blob is already present; the
    ///   existing blob is left untouched
    /// - [`BackstopError::Io`] if reading `content` or writing the blob fails;
    ///   nothing is published in that case
    pub fn store<R: Read>(&self, mut content: R, digest: &Digest) -> Result<u64> {
        let destination = self.blob_path(digest);
        if destination.try_exists()? {
            return Err(BackstopError::AlreadyExists(digest.clone()));
        }

        let shard_dir = destination
            .parent()
            .ok_or_else(|| BackstopError::internal("blob path has no parent"))?;
        fs::create_dir_all(shard_dir)?;

        let mut incoming = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(shard_dir)?;
        let written = io::copy(&mut content, incoming.as_file_mut())?;
        incoming.as_file().sync_all()?;

        let mut permissions = incoming.as_file().metadata()?.permissions();
        permissions.set_readonly(true);
        incoming.as_file().set_permissions(permissions)?;

        match incoming.persist_noclobber(&destination) {
            Ok(_) => {
                trace!("Stored blob {} ({} bytes)", digest.short(), written);
                Ok(written)
            }
            // Dropping the returned temp file removes it.
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                Err(BackstopError::AlreadyExists(digest.clone()))
            }
            Err(e) => Err(e.error.into()),
        }
    }

    /// Store the content of the native file at `path`, returning the bytes written
    pub fn store_file(&self, path: &Path, digest: &Digest) -> Result<u64> {
        self.store(File::open(path)?, digest)
    }

    /// Open the blob for `digest` for reading
    ///
    /// # Errors
    ///
    /// - [`BackstopError::NotFound`] if no blob is stored under `digest`
    pub fn retrieve(&self, digest: &Digest) -> Result<File> {
        match File::open(self.blob_path(digest)) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BackstopError::NotFound(digest.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every digest stored in the store, in no particular order
    ///
    /// Entries that are not well-formed blobs (in-flight temporary files, the
    /// layout marker) are skipped.
    pub fn list(&self) -> Result<Vec<Digest>> {
        let mut digests = Vec::new();
        if !self.root.exists() {
            return Ok(digests);
        }

        let leaf_depth = self.sharding_depth + 1;
        for entry in WalkDir::new(&self.root)
            .min_depth(leaf_depth)
            .max_depth(leaf_depth)
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(digest) = self.digest_from_entry(entry.path()) {
                digests.push(digest);
            }
        }

        debug!("Listed {} blobs in {:?}", digests.len(), self.root);
        Ok(digests)
    }

    fn digest_from_entry(&self, path: &Path) -> Option<Digest> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut hex = String::new();
        for (level, component) in relative.components().enumerate() {
            let name = component.as_os_str().to_str()?;
            if level < self.sharding_depth && name.len() != NIBBLES_PER_SHARD {
                return None;
            }
            hex.push_str(name);
        }
        Digest::parse(hex).ok()
    }

    /// Count blobs and their total size
    pub fn stats(&self) -> Result<CasStats> {
        let mut stats = CasStats::default();
        for digest in self.list()? {
            stats.blob_count += 1;
            stats.total_bytes += fs::metadata(self.blob_path(&digest))?.len();
        }
        Ok(stats)
    }
}

fn shard_names() -> impl Iterator<Item = String> {
    let dirs_per_shard = 16usize.pow(NIBBLES_PER_SHARD as u32);
    (0..dirs_per_shard).map(|i| format!("{:0width$x}", i, width = NIBBLES_PER_SHARD))
}

fn create_shard_level(dir: &Path, remaining: usize) -> Result<()> {
    if remaining == 0 {
        return Ok(());
    }
    for name in shard_names() {
        let shard = dir.join(name);
        fs::create_dir_all(&shard)?;
        create_shard_level(&shard, remaining - 1)?;
    }
    Ok(())
}
