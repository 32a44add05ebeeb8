//! Content hashing for Backstop
//!
//! All content identity in Backstop is SHA-256, rendered as 64 lowercase hex
//! characters and wrapped in [`Digest`]. Everything else in the crate goes
//! through this module instead of touching `sha2` directly.
//!
//! ## Streaming
//!
//! [`hash_reader`] reads in [`READ_BLOCK_SIZE`] blocks, so large files are never
//! held in memory.
//!
//! ## Batches
//!
//! [`hash_many`] computes digests for a set of virtual paths on a rayon pool that
//! lives exactly as long as the call. Results are keyed by path, so completion
//! order does not matter. What happens when one file cannot be read is decided
//! by [`HashPolicy`]:
//!
//! - [`HashPolicy::Strict`] fails the whole batch with
//!   [`BackstopError::HashFailed`].
//! - [`HashPolicy::ReportFailures`] leaves the path out of
//!   [`HashBatch::digests`] and records it in [`HashBatch::failures`].
//!
//! ## Cancellation
//!
//! A [`CancelToken`] is checked before each file and between blocks. Once it
//! fires, in-flight digests are dropped and the batch returns
//! [`BackstopError::Cancelled`]; nothing partial is emitted.

use crate::error::{BackstopError, Result};
use crate::path::{build_native_path, VirtualPath};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Block size used when streaming content through the hash (1 MiB)
pub const READ_BLOCK_SIZE: usize = 1024 * 1024;

/// Length of a hex-encoded SHA-256 digest
pub const DIGEST_HEX_LEN: usize = 64;

/// Hex-encoded SHA-256 of a file's full content
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse a digest, requiring exactly 64 lowercase hex characters
    pub fn parse(hex: impl Into<String>) -> Result<Self> {
        let hex = hex.into();
        let well_formed = hex.len() == DIGEST_HEX_LEN
            && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !well_formed {
            return Err(BackstopError::InvalidDigest(hex));
        }
        Ok(Self(hex))
    }

    /// Borrow the hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = BackstopError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

impl std::str::FromStr for Digest {
    type Err = BackstopError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Path-keyed digests produced by a batch
pub type DigestMap = BTreeMap<VirtualPath, Digest>;

/// Cooperative cancellation flag shared between a caller and hashing workers
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that has not fired
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a batch does when a single file cannot be hashed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashPolicy {
    /// Any failure aborts the whole batch
    #[default]
    Strict,
    /// Failures are reported per path and excluded from the digests
    ReportFailures,
}

/// Settings for one hashing batch
#[derive(Debug, Clone)]
pub struct HashOptions {
    /// Worker threads in the per-batch pool
    pub workers: usize,
    /// Failure policy
    pub policy: HashPolicy,
    /// Cancellation flag checked by the workers
    pub cancel: CancelToken,
}

impl Default for HashOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            policy: HashPolicy::default(),
            cancel: CancelToken::new(),
        }
    }
}

/// A file that could not be hashed under [`HashPolicy::ReportFailures`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashFailure {
    /// Virtual path of the file
    pub path: VirtualPath,
    /// Error description
    pub message: String,
}

/// Result of hashing a set of paths
#[derive(Debug, Clone, Default)]
pub struct HashBatch {
    /// Digests for every file that was hashed successfully
    pub digests: DigestMap,
    /// Files that could not be read
    pub failures: Vec<HashFailure>,
}

/// Anything that can turn a set of virtual paths into digests
///
/// Implemented in-process by [`ParallelHasher`] and out-of-process by
/// [`crate::hashdeep::Hashdeep`].
pub trait DigestSource: Send + Sync + fmt::Debug {
    /// Compute digests for `paths` below `root`
    fn compute(&self, root: &Path, paths: &[VirtualPath]) -> Result<HashBatch>;

    /// Short name for logs and reports
    fn name(&self) -> &'static str;
}

/// In-process digest source backed by [`hash_many`]
#[derive(Debug, Clone, Default)]
pub struct ParallelHasher {
    options: HashOptions,
}

impl ParallelHasher {
    /// Create a hasher with the given batch options
    pub fn new(options: HashOptions) -> Self {
        Self { options }
    }

    /// Batch options in use
    pub fn options(&self) -> &HashOptions {
        &self.options
    }
}

impl DigestSource for ParallelHasher {
    fn compute(&self, root: &Path, paths: &[VirtualPath]) -> Result<HashBatch> {
        hash_many(root, paths, &self.options)
    }

    fn name(&self) -> &'static str {
        "builtin"
    }
}

/// Digest of an in-memory byte slice
pub fn hash_bytes(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest(hex::encode(hasher.finalize()))
}

/// Digest of everything readable from `reader`, streamed in blocks
pub fn hash_reader<R: Read>(reader: R) -> Result<Digest> {
    stream_digest(reader, None)
}

/// Digest of a file's content
pub fn hash_file(path: &Path) -> Result<Digest> {
    hash_reader(File::open(path)?)
}

fn stream_digest<R: Read>(mut reader: R, cancel: Option<&CancelToken>) -> Result<Digest> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BLOCK_SIZE];

    loop {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(BackstopError::Cancelled);
        }
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(Digest(hex::encode(hasher.finalize())))
}

/// Hash every path in `paths` (virtual, below `root`) on a per-call worker pool
///
/// # Errors
///
/// - [`BackstopError::Cancelled`] if the token fires before the batch completes
/// - [`BackstopError::HashFailed`] for the first unreadable file under
///   [`HashPolicy::Strict`]
/// - [`BackstopError::ThreadPool`] if the pool cannot be created
pub fn hash_many(root: &Path, paths: &[VirtualPath], options: &HashOptions) -> Result<HashBatch> {
    let start = Instant::now();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.workers.max(1))
        .thread_name(|i| format!("backstop-hash-{}", i))
        .build()
        .map_err(|e| BackstopError::ThreadPool(e.to_string()))?;

    let digests = Mutex::new(DigestMap::new());
    let failures = Mutex::new(Vec::new());

    let outcome = pool.install(|| {
        paths.par_iter().try_for_each(|vpath| -> Result<()> {
            if options.cancel.is_cancelled() {
                return Err(BackstopError::Cancelled);
            }
            let native = build_native_path(root, vpath)?;
            let digest = File::open(&native)
                .map_err(BackstopError::from)
                .and_then(|file| stream_digest(file, Some(&options.cancel)));

            match digest {
                Ok(digest) => {
                    trace!("Hashed {} -> {}", vpath, digest.short());
                    digests.lock().insert(vpath.clone(), digest);
                    Ok(())
                }
                Err(BackstopError::Io(source)) => match options.policy {
                    HashPolicy::Strict => Err(BackstopError::HashFailed { path: native, source }),
                    HashPolicy::ReportFailures => {
                        warn!("Could not hash {}: {}", vpath, source);
                        failures.lock().push(HashFailure {
                            path: vpath.clone(),
                            message: source.to_string(),
                        });
                        Ok(())
                    }
                },
                Err(e) => Err(e),
            }
        })
    });
    // The pool is torn down here whether or not the batch succeeded.
    drop(pool);
    outcome?;

    if options.cancel.is_cancelled() {
        return Err(BackstopError::Cancelled);
    }

    let mut failures = failures.into_inner();
    failures.sort_by(|a, b| a.path.cmp(&b.path));
    let batch = HashBatch {
        digests: digests.into_inner(),
        failures,
    };

    debug!(
        "Hashed {} files ({} failures) with {} workers in {:?}",
        batch.digests.len(),
        batch.failures.len(),
        options.workers,
        start.elapsed()
    );
    Ok(batch)
}
