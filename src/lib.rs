//! # Backstop - rule-driven filesystem backups with verifiable snapshots
//!
//! Backstop backs up a selected part of a directory tree. It records what it
//! saw in a snapshot, keeps file content in a deduplicating content-addressable
//! store, and can later tell you exactly how a tree has drifted from what was
//! recorded.
//!
//! ## Overview
//!
//! - **Selection**: ordered `+`/`-` rules decide which paths are backed up;
//!   the last matching rule wins
//! - **Content storage**: every file is stored once per distinct content,
//!   keyed by its SHA-256 digest, in a sharded write-once store
//! - **Snapshots**: one tree per run recording each entry's metadata, digest,
//!   size or link target
//! - **Verification**: a full re-scan compared against a snapshot, reporting
//!   changed, missing and unexpected paths
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use backstop::{parse_pattern_file, BackupBuilder, Cas, Snapshot};
//! use std::path::{Path, PathBuf};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // A store with two levels of shard directories
//! let cas = Cas::new("/backups/cas", 2)?;
//! cas.prepare()?;
//!
//! // Back up /etc, except private keys
//! let rules = parse_pattern_file("- /\n+ /etc\n- /etc/ssl/private\n")?;
//! let backup = BackupBuilder::new()
//!     .rules(rules)
//!     .build(PathBuf::from("/"), cas)?;
//! let report = backup.run()?;
//! report.snapshot.save(Path::new("/backups/etc.json"))?;
//!
//! // Later: has anything drifted?
//! let snapshot = Snapshot::load(Path::new("/backups/etc.json"))?;
//! let result = backup.verify(&snapshot)?;
//! println!("{}", result.summary());
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Virtual paths
//!
//! Entries are named by [`VirtualPath`]: absolute paths relative to the backup
//! root, so `/etc/hosts` is the same entry whether the root is `/` or a
//! mounted disk image. Virtual paths are validated and never normalized;
//! `/etc//hosts` is an error, not an alias.
//!
//! ### Content-addressable storage
//!
//! Blobs live at `<root>/<2 hex>/.../<rest of digest>`, with a fixed number of
//! shard levels recorded in `layout.json`. Blobs are published atomically and
//! never overwritten, so concurrent writers of the same content are safe.
//!
//! ### Digest sources
//!
//! Digests come from a [`DigestSource`]: either the in-process
//! [`ParallelHasher`] or the external `hashdeep` tool. What happens when a file
//! cannot be read is an explicit [`HashPolicy`].
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`] with [`BackstopError`]. Malformed input
//! (paths, pattern lines, snapshot documents, digests) is always rejected with
//! the offending text. Per-entry I/O problems during a walk are collected in
//! [`ScanResult::errors`] instead of failing the walk.
//!
//! ## Module Organization
//!
//! - [`path`]: virtual paths and native path translation
//! - [`pattern`]: rule parsing, decisions and the rule-driven walk
//! - [`storage`]: the content-addressable store
//! - [`hashing`]: digests, hashing batches and the digest source seam
//! - [`hashdeep`]: the external hashdeep digest source
//! - [`identity`]: user and group name tables
//! - [`metadata`]: per-entry metadata and snapshot nodes
//! - [`snapshot`]: snapshot trees and their on-disk documents
//! - [`verification`]: live scans and drift detection
//! - [`backup`]: backup runs
//! - [`types`]: scan results and configuration
//! - [`error`]: error types and handling

// Public API modules
pub mod backup;
pub mod error;
pub mod hashdeep;
pub mod hashing;
pub mod identity;
pub mod metadata;
pub mod path;
pub mod pattern;
pub mod snapshot;
pub mod storage;
pub mod types;
pub mod utils;
pub mod verification;

// Internal modules
mod walk;

// Re-export main types for convenience
pub use backup::{Backup, BackupBuilder, BackupReport};
pub use error::{BackstopError, Result};
pub use hashing::{CancelToken, Digest, DigestSource, HashOptions, HashPolicy, ParallelHasher};
pub use identity::IdentityTable;
pub use metadata::{EntryMetadata, Node, NodeKind};
pub use path::VirtualPath;
pub use pattern::{parse_pattern_file, Decision, PatternRule, PatternSet};
pub use snapshot::{build_snapshot, Snapshot};
pub use storage::Cas;
pub use types::*;
pub use verification::{scan_backup, verify_backup, VerificationResult};
