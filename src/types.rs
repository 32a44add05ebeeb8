//! Core data types shared across Backstop
//!
//! - **Traversal**: [`ScanResult`], [`ScanError`] - what a tree walk found
//! - **Configuration**: [`BackstopConfig`], [`DigestSourceKind`] - run settings
//!   loadable from a JSON file

use crate::error::{BackstopError, Result};
use crate::hashing::{CancelToken, HashOptions, HashPolicy};
use crate::path::{get_path_from_native_path, VirtualPath};
use crate::storage::{DEFAULT_SHARDING_DEPTH, MAX_SHARDING_DEPTH};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// An I/O problem hit while walking a tree
///
/// Traversal errors never abort a walk; they are collected here and reported
/// with the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanError {
    /// Virtual path of the entry, when it could be determined
    pub path: Option<VirtualPath>,
    /// Error description
    pub message: String,
}

impl ScanError {
    /// Build a scan error from a walkdir error below `root`
    pub fn from_walk_error(root: &Path, error: &walkdir::Error) -> Self {
        let path = error
            .path()
            .and_then(|native| get_path_from_native_path(root, native).ok());
        let message = match error.path() {
            Some(native) if path.is_none() => format!("{}: {}", native.display(), error),
            _ => error.to_string(),
        };
        Self { path, message }
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {}", path, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Entries found by one traversal, bucketed by kind
///
/// Buckets hold virtual paths in visit order (depth-first, top-down, sorted by
/// name within a directory).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Regular files
    pub files: Vec<VirtualPath>,
    /// Symbolic links (never followed)
    pub symlinks: Vec<VirtualPath>,
    /// Directories, including the root when it was visited
    pub directories: Vec<VirtualPath>,
    /// Per-entry I/O errors
    pub errors: Vec<ScanError>,
    /// Entries that were visited but are not backed up (sockets, devices, the
    /// control directory)
    pub ignored: Vec<VirtualPath>,
}

impl ScanResult {
    /// Number of entries that will be recorded (files, symlinks, directories)
    pub fn recorded_count(&self) -> usize {
        self.files.len() + self.symlinks.len() + self.directories.len()
    }

    /// Iterate over every recorded path
    pub fn recorded_paths(&self) -> impl Iterator<Item = &VirtualPath> {
        self.files
            .iter()
            .chain(self.symlinks.iter())
            .chain(self.directories.iter())
    }
}

/// Where file digests come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestSourceKind {
    /// In-process parallel SHA-256
    #[default]
    Builtin,
    /// The external `hashdeep` tool
    Hashdeep,
}

/// Settings for backup and verify runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackstopConfig {
    /// Shard levels in the content store
    pub sharding_depth: usize,
    /// Worker threads for hashing
    pub hash_workers: usize,
    /// Failure policy for hashing during backups
    pub hash_policy: HashPolicy,
    /// Digest source
    pub digest_source: DigestSourceKind,
}

impl Default for BackstopConfig {
    fn default() -> Self {
        Self {
            sharding_depth: DEFAULT_SHARDING_DEPTH,
            hash_workers: num_cpus::get(),
            hash_policy: HashPolicy::Strict,
            digest_source: DigestSourceKind::Builtin,
        }
    }
}

impl BackstopConfig {
    /// Load a configuration file; missing keys take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        utils::atomic_write(path, serde_json::to_string_pretty(self)?.as_bytes())
    }

    /// Reject settings no run can use
    pub fn validate(&self) -> Result<()> {
        if self.sharding_depth > MAX_SHARDING_DEPTH {
            return Err(BackstopError::invalid_configuration(format!(
                "sharding_depth must be at most {}, got {}",
                MAX_SHARDING_DEPTH, self.sharding_depth
            )));
        }
        if self.hash_workers == 0 {
            return Err(BackstopError::invalid_configuration(
                "hash_workers must be at least 1",
            ));
        }
        if self.digest_source == DigestSourceKind::Hashdeep
            && self.hash_policy == HashPolicy::ReportFailures
        {
            return Err(BackstopError::invalid_configuration(
                "hashdeep cannot report unreadable files; use hash_policy \"strict\" or the builtin digest source",
            ));
        }
        Ok(())
    }

    /// Hash batch options for this configuration
    pub fn hash_options(&self, cancel: CancelToken) -> HashOptions {
        HashOptions {
            workers: self.hash_workers,
            policy: self.hash_policy,
            cancel,
        }
    }
}
