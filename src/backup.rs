//! Backup runs
//!
//! [`Backup`] ties the pieces together for one root directory and one content
//! store. A run goes through four stages:
//!
//! 1. **Select**: walk the root under the pattern rules ([`assemble_paths`])
//! 2. **Hash**: compute a digest for every selected file
//! 3. **Store**: copy each file's content into the [`Cas`] under its digest;
//!    content already present is deduplicated
//! 4. **Record**: build the [`Snapshot`] tree from the selected paths
//!
//! The snapshot is returned in a [`BackupReport`] and can be saved with
//! [`Snapshot::save`]. A later [`Backup::verify`] compares a tree against it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use backstop::{BackupBuilder, Cas, PatternSet};
//! use std::path::{Path, PathBuf};
//!
//! # fn main() -> backstop::Result<()> {
//! let cas = Cas::open("/backups/cas")?;
//! let rules = PatternSet::from_file(Path::new("/etc/backstop/home.rules"))?;
//!
//! let backup = BackupBuilder::new()
//!     .rules(rules.rules().to_vec())
//!     .hash_workers(8)
//!     .build(PathBuf::from("/home"), cas)?;
//!
//! let report = backup.run()?;
//! report.snapshot.save(Path::new("/backups/home.json"))?;
//! println!("{} new blobs, {} deduplicated", report.blobs_stored, report.blobs_deduplicated);
//! # Ok(())
//! # }
//! ```

use crate::error::{BackstopError, Result};
use crate::hashdeep::Hashdeep;
use crate::hashing::{CancelToken, DigestSource, HashOptions, HashPolicy, ParallelHasher};
use crate::identity::IdentityTable;
use crate::path::{build_native_path, ensure_native_root, VirtualPath};
use crate::pattern::{assemble_paths, Decision, PatternRule};
use crate::snapshot::{build_snapshot, Snapshot};
use crate::storage::Cas;
use crate::types::{BackstopConfig, DigestSourceKind, ScanError};
use crate::verification::{verify_backup, VerificationResult, CONTROL_PATH};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// What one backup run did
#[derive(Debug, Clone)]
pub struct BackupReport {
    /// The recorded tree
    pub snapshot: Snapshot,
    /// Per-entry problems from the walk and, under
    /// [`HashPolicy::ReportFailures`], files that could not be hashed
    pub errors: Vec<ScanError>,
    /// Entries the walk saw but does not back up
    pub ignored: Vec<VirtualPath>,
    /// Blobs newly written to the store
    pub blobs_stored: usize,
    /// Files whose content was already in the store
    pub blobs_deduplicated: usize,
    /// Bytes written to the store
    pub bytes_stored: u64,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

/// Builder for [`Backup`]
#[derive(Debug, Clone)]
pub struct BackupBuilder {
    rules: Vec<PatternRule>,
    hash_workers: usize,
    hash_policy: HashPolicy,
    digest_source: DigestSourceKind,
    cancel: CancelToken,
}

impl Default for BackupBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupBuilder {
    /// Builder with no rules (everything included), strict hashing and one
    /// hashing worker per CPU
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            hash_workers: num_cpus::get(),
            hash_policy: HashPolicy::Strict,
            digest_source: DigestSourceKind::Builtin,
            cancel: CancelToken::new(),
        }
    }

    /// Start from a configuration file's settings
    pub fn from_config(config: &BackstopConfig) -> Self {
        Self::new()
            .hash_workers(config.hash_workers)
            .hash_policy(config.hash_policy)
            .digest_source(config.digest_source)
    }

    /// Set the ordered selection rules
    ///
    /// The control directory `/.backstop` is always excluded on top of these.
    pub fn rules(mut self, rules: Vec<PatternRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Set the number of hashing threads (minimum 1)
    pub fn hash_workers(mut self, count: usize) -> Self {
        self.hash_workers = count.max(1);
        self
    }

    /// Set what happens when a selected file cannot be hashed
    pub fn hash_policy(mut self, policy: HashPolicy) -> Self {
        self.hash_policy = policy;
        self
    }

    /// Choose between in-process hashing and hashdeep
    pub fn digest_source(mut self, kind: DigestSourceKind) -> Self {
        self.digest_source = kind;
        self
    }

    /// Share a cancellation token with the run
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Create the backup for `root`, storing content in `cas`
    ///
    /// # Errors
    ///
    /// - `root` is not an absolute, normalized path to a directory
    /// - hashdeep was requested but no supported version is installed
    pub fn build(self, root: PathBuf, cas: Cas) -> Result<Backup> {
        ensure_native_root(&root)?;
        if !fs::metadata(&root)?.is_dir() {
            return Err(BackstopError::invalid_path(
                root.to_string_lossy(),
                "the backup root is not a directory",
            ));
        }
        if self.digest_source == DigestSourceKind::Hashdeep {
            if self.hash_policy == HashPolicy::ReportFailures {
                return Err(BackstopError::invalid_configuration(
                    "hashdeep cannot report unreadable files, only fail the whole batch",
                ));
            }
            Hashdeep::detect(Some(self.hash_workers))?;
        }

        let mut rules = self.rules;
        rules.push(PatternRule::new(
            Decision::Exclude,
            VirtualPath::new(CONTROL_PATH)?,
        ));

        Ok(Backup {
            root,
            cas,
            rules,
            hash_workers: self.hash_workers,
            hash_policy: self.hash_policy,
            digest_source: self.digest_source,
            cancel: self.cancel,
        })
    }
}

/// Backup of one root directory into one content store
#[derive(Debug)]
pub struct Backup {
    root: PathBuf,
    cas: Cas,
    rules: Vec<PatternRule>,
    hash_workers: usize,
    hash_policy: HashPolicy,
    digest_source: DigestSourceKind,
    cancel: CancelToken,
}

impl Backup {
    /// Directory being backed up
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store receiving file content
    pub fn cas(&self) -> &Cas {
        &self.cas
    }

    /// Effective rules, including the control directory exclusion
    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    fn source(&self, policy: HashPolicy) -> Box<dyn DigestSource> {
        match self.digest_source {
            DigestSourceKind::Builtin => Box::new(ParallelHasher::new(HashOptions {
                workers: self.hash_workers,
                policy,
                cancel: self.cancel.clone(),
            })),
            DigestSourceKind::Hashdeep => Box::new(
                Hashdeep::new(Some(self.hash_workers)).cancel_token(self.cancel.clone()),
            ),
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BackstopError::Cancelled);
        }
        Ok(())
    }

    /// Select, hash, store and record
    ///
    /// Accumulated walk errors do not fail the run; they are returned in the
    /// report. Under [`HashPolicy::Strict`] any unreadable selected file fails
    /// the run; under [`HashPolicy::ReportFailures`] it is left out of the
    /// snapshot and reported.
    #[instrument(skip(self))]
    pub fn run(&self) -> Result<BackupReport> {
        let start = Instant::now();
        info!("Starting backup of {:?}", self.root);

        let scan = assemble_paths(&self.root, &self.rules)?;
        for error in &scan.errors {
            warn!("Walk error: {}", error);
        }
        self.check_cancelled()?;

        let ids = IdentityTable::capture();
        let source = self.source(self.hash_policy);
        let batch = source.compute(&self.root, &scan.files)?;
        self.check_cancelled()?;

        let mut errors = scan.errors;
        let unreadable: BTreeSet<VirtualPath> =
            batch.failures.iter().map(|f| f.path.clone()).collect();
        errors.extend(batch.failures.into_iter().map(|failure| ScanError {
            path: Some(failure.path),
            message: failure.message,
        }));
        let files: Vec<VirtualPath> = scan
            .files
            .into_iter()
            .filter(|path| !unreadable.contains(path))
            .collect();

        let mut blobs_stored = 0;
        let mut blobs_deduplicated = 0;
        let mut bytes_stored = 0;
        for path in &files {
            self.check_cancelled()?;
            let digest = batch.digests.get(path).ok_or_else(|| {
                BackstopError::internal(format!("{} returned no digest for {}", source.name(), path))
            })?;
            if self.cas.has_file(digest)? {
                trace!("Already stored: {} ({})", path, digest.short());
                blobs_deduplicated += 1;
                continue;
            }

            let native = build_native_path(&self.root, path)?;
            match self.cas.store_file(&native, digest) {
                Ok(written) => {
                    trace!("Stored {} as {}", path, digest.short());
                    blobs_stored += 1;
                    bytes_stored += written;
                }
                Err(BackstopError::AlreadyExists(_)) => blobs_deduplicated += 1,
                Err(e) => return Err(e),
            }
        }
        debug!(
            "Stored {} new blobs, {} deduplicated",
            blobs_stored, blobs_deduplicated
        );

        let snapshot = build_snapshot(
            &self.root,
            &files,
            &scan.symlinks,
            &scan.directories,
            &batch.digests,
            &ids,
        )?;

        let report = BackupReport {
            snapshot,
            errors,
            ignored: scan.ignored,
            blobs_stored,
            blobs_deduplicated,
            bytes_stored,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            "Backup finished in {}ms: {} stored, {} deduplicated, {} errors",
            report.duration_ms,
            report.blobs_stored,
            report.blobs_deduplicated,
            report.errors.len()
        );
        Ok(report)
    }

    /// Compare the root against `snapshot`
    ///
    /// With the builtin hasher, unreadable files are reported in the result
    /// instead of failing it. hashdeep has no per-file failures, so with it an
    /// unreadable file fails the call.
    pub fn verify(&self, snapshot: &Snapshot) -> Result<VerificationResult> {
        let source = self.source(HashPolicy::ReportFailures);
        verify_backup(&self.root, snapshot, source.as_ref())
    }
}
