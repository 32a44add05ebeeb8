//! Out-of-process digests via the `hashdeep` tool
//!
//! `hashdeep` is treated as a black box that turns a list of files into
//! digests. Backstop writes the native paths to a temporary list file, runs
//!
//! ```text
//! hashdeep -c sha1,sha256 -f <list> -l [-j <threads>]
//! ```
//!
//! and parses the plain-text report it prints:
//!
//! ```text
//! %%%% HASHDEEP-1.0
//! %%%% size,sha1,sha256,filename
//! ## Invoked from: /home/user
//! ##
//! 3,a9993e36...,ba7816bf...,/data/abc.txt
//! ```
//!
//! Any problem with the tool is fatal: a missing or unsupported binary, a
//! non-zero exit, a row that does not parse, or a result set that differs from
//! the requested paths in size or membership. Partial results are never used.

use crate::error::{BackstopError, Result};
use crate::hashing::{CancelToken, Digest, DigestSource, HashBatch};
use crate::path::{build_native_path, get_path_from_native_path, VirtualPath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Name of the executable looked up on `PATH`
pub const PROGRAM: &str = "hashdeep";

/// Versions whose output format is known
pub const SUPPORTED_VERSIONS: &[&str] = &["4.2", "4.3", "4.4"];

const SHA1_HEX_LEN: usize = 40;

/// How often a running hashdeep is checked for exit or cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Both digests hashdeep reports for a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestPair {
    /// Hex SHA-1
    pub sha1: String,
    /// Hex SHA-256
    pub sha256: Digest,
}

/// The installed hashdeep version, or `None` if it cannot be run
pub fn version() -> Option<String> {
    let output = Command::new(PROGRAM).arg("-V").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!version.is_empty()).then_some(version)
}

/// Whether `version` produces output this module can parse
pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// Parse hashdeep's text report for files below `root`
pub fn parse_output(root: &Path, output: &str) -> Result<BTreeMap<VirtualPath, DigestPair>> {
    let mut digests = BTreeMap::new();

    for line in output.lines() {
        if line.is_empty() || line.starts_with("%%%%") || line.starts_with("##") {
            continue;
        }
        let malformed = |what: &str| {
            BackstopError::external_tool(format!("{} in hashdeep output line \"{}\"", what, line))
        };

        // The file name comes last and may itself contain commas.
        let mut fields = line.splitn(4, ',');
        let (Some(size), Some(sha1), Some(sha256), Some(name)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed("missing fields"));
        };

        size.parse::<u64>().map_err(|_| malformed("bad size"))?;
        if sha1.len() != SHA1_HEX_LEN
            || !sha1.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(malformed("bad SHA-1"));
        }
        let sha256 = Digest::parse(sha256).map_err(|_| malformed("bad SHA-256"))?;
        let path = get_path_from_native_path(root, Path::new(name))
            .map_err(|e| malformed(&format!("unexpected file name ({})", e)))?;

        let pair = DigestPair {
            sha1: sha1.to_string(),
            sha256,
        };
        if digests.insert(path, pair).is_some() {
            return Err(malformed("duplicate file"));
        }
    }

    Ok(digests)
}

/// Fail unless `digests` covers exactly `requested`
fn ensure_complete(
    requested: &[VirtualPath],
    digests: &BTreeMap<VirtualPath, DigestPair>,
) -> Result<()> {
    if digests.len() != requested.len() {
        return Err(BackstopError::external_tool(format!(
            "hashdeep returned {} digests for {} files",
            digests.len(),
            requested.len()
        )));
    }
    if let Some(path) = requested.iter().find(|path| !digests.contains_key(*path)) {
        return Err(BackstopError::external_tool(format!(
            "hashdeep returned no digest for {}",
            path
        )));
    }
    Ok(())
}

/// Run hashdeep over `paths` below `root`
///
/// `threads` maps to `-j`; `None` leaves the choice to hashdeep. Once `cancel`
/// fires the child is killed and the call returns [`BackstopError::Cancelled`].
pub fn compute_digests(
    root: &Path,
    paths: &[VirtualPath],
    threads: Option<usize>,
    cancel: &CancelToken,
) -> Result<BTreeMap<VirtualPath, DigestPair>> {
    run_tool(OsStr::new(PROGRAM), root, paths, threads, cancel)
}

fn run_tool(
    program: &OsStr,
    root: &Path,
    paths: &[VirtualPath],
    threads: Option<usize>,
    cancel: &CancelToken,
) -> Result<BTreeMap<VirtualPath, DigestPair>> {
    if paths.is_empty() {
        return Ok(BTreeMap::new());
    }
    if cancel.is_cancelled() {
        return Err(BackstopError::Cancelled);
    }
    let start = Instant::now();

    let mut list = tempfile::Builder::new()
        .prefix("backstop-hashdeep-")
        .suffix(".list")
        .tempfile()?;
    for path in paths {
        let native = build_native_path(root, path)?;
        let native = native.to_string_lossy();
        if native.contains('\n') {
            return Err(BackstopError::external_tool(format!(
                "cannot pass {:?} to hashdeep: the name contains a newline",
                native
            )));
        }
        writeln!(list, "{}", native)?;
    }
    list.flush()?;

    // Output goes to files so a large report cannot block the child on a full pipe.
    let mut stdout = tempfile::tempfile()?;
    let mut stderr = tempfile::tempfile()?;

    let mut command = Command::new(program);
    command
        .args(["-c", "sha1,sha256", "-f"])
        .arg(list.path())
        .arg("-l")
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout.try_clone()?))
        .stderr(Stdio::from(stderr.try_clone()?));
    if let Some(threads) = threads {
        command.arg("-j").arg(threads.to_string());
    }
    debug!("Running {:?}", command);

    let mut child = command.spawn().map_err(|e| {
        BackstopError::external_tool(format!("could not run {}: {}", program.to_string_lossy(), e))
    })?;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if cancel.is_cancelled() {
            debug!("Cancelled, killing {}", program.to_string_lossy());
            // The child may have exited between the two checks.
            let _ = child.kill();
            child.wait()?;
            return Err(BackstopError::Cancelled);
        }
        thread::sleep(POLL_INTERVAL);
    };

    if !status.success() {
        let mut message = Vec::new();
        stderr.seek(SeekFrom::Start(0))?;
        stderr.read_to_end(&mut message)?;
        return Err(BackstopError::external_tool(format!(
            "{} exited with {}: {}",
            program.to_string_lossy(),
            status,
            String::from_utf8_lossy(&message).trim()
        )));
    }

    let mut report = Vec::new();
    stdout.seek(SeekFrom::Start(0))?;
    stdout.read_to_end(&mut report)?;
    let report = String::from_utf8(report)
        .map_err(|_| BackstopError::external_tool("hashdeep output is not valid UTF-8"))?;

    let digests = parse_output(root, &report)?;
    ensure_complete(paths, &digests)?;

    info!(
        "hashdeep computed {} digests in {:?}",
        digests.len(),
        start.elapsed()
    );
    Ok(digests)
}

/// [`DigestSource`] backed by the external hashdeep tool
///
/// The tool either hashes every requested file or the whole batch fails, so
/// [`HashBatch::failures`] is always empty.
#[derive(Debug, Clone, Default)]
pub struct Hashdeep {
    threads: Option<usize>,
    cancel: CancelToken,
}

impl Hashdeep {
    /// Use hashdeep with `threads` workers, without checking the installation
    pub fn new(threads: Option<usize>) -> Self {
        Self {
            threads,
            cancel: CancelToken::new(),
        }
    }

    /// Kill the running tool when `cancel` fires
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Check that a supported hashdeep is installed
    pub fn detect(threads: Option<usize>) -> Result<Self> {
        match version() {
            None => Err(BackstopError::external_tool(format!(
                "{} was not found",
                PROGRAM
            ))),
            Some(found) if !is_supported_version(&found) => {
                Err(BackstopError::external_tool(format!(
                    "{} version {} is not supported (need one of {})",
                    PROGRAM,
                    found,
                    SUPPORTED_VERSIONS.join(", ")
                )))
            }
            Some(found) => {
                debug!("Using {} {}", PROGRAM, found);
                Ok(Self::new(threads))
            }
        }
    }
}

impl DigestSource for Hashdeep {
    fn compute(&self, root: &Path, paths: &[VirtualPath]) -> Result<HashBatch> {
        let digests = compute_digests(root, paths, self.threads, &self.cancel)?
            .into_iter()
            .map(|(path, pair)| (path, pair.sha256))
            .collect();
        Ok(HashBatch {
            digests,
            failures: Vec::new(),
        })
    }

    fn name(&self) -> &'static str {
        PROGRAM
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::hash_bytes;

    const ABC_SHA1: &str = "a9993e364706816aba3e25717850c26c9cd0d89d";
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    // A script written while another test forks can fail to exec with ETXTBSY.
    static SPAWN_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::new(s).unwrap()
    }

    fn report(rows: &[String]) -> String {
        let mut text = String::from(
            "%%%% HASHDEEP-1.0\n%%%% size,sha1,sha256,filename\n## Invoked from: /tmp\n## $ hashdeep -c sha1,sha256 -f list -l\n##\n",
        );
        for row in rows {
            text.push_str(row);
            text.push('\n');
        }
        text
    }

    #[test]
    fn test_supported_versions() {
        assert!(is_supported_version("4.4"));
        assert!(is_supported_version("4.2"));
        assert!(!is_supported_version("4.1"));
        assert!(!is_supported_version("4.4 "));
    }

    #[test]
    fn test_parse_output() {
        let text = report(&[
            format!("3,{},{},/data/abc.txt", ABC_SHA1, ABC_SHA256),
            format!("3,{},{},/data/sub/a,b.txt", ABC_SHA1, ABC_SHA256),
        ]);
        let digests = parse_output(Path::new("/data"), &text).unwrap();

        assert_eq!(digests.len(), 2);
        assert_eq!(digests[&vp("/abc.txt")].sha1, ABC_SHA1);
        assert_eq!(digests[&vp("/abc.txt")].sha256, hash_bytes(b"abc"));
        assert!(digests.contains_key(&vp("/sub/a,b.txt")));
    }

    #[test]
    fn test_parse_output_rejects_malformed_rows() {
        let bad_rows = [
            format!("3,{},{}", ABC_SHA1, ABC_SHA256),
            format!("x,{},{},/data/a", ABC_SHA1, ABC_SHA256),
            format!("3,{},{},/data/a", &ABC_SHA1[..39], ABC_SHA256),
            format!("3,{},{},/data/a", ABC_SHA1, ABC_SHA256.to_uppercase()),
            format!("3,{},{},/elsewhere/a", ABC_SHA1, ABC_SHA256),
        ];
        for row in bad_rows {
            let result = parse_output(Path::new("/data"), &report(&[row.clone()]));
            assert!(
                matches!(result, Err(BackstopError::ExternalTool(_))),
                "row {:?} was accepted",
                row
            );
        }

        let duplicated = format!("3,{},{},/data/a", ABC_SHA1, ABC_SHA256);
        assert!(parse_output(Path::new("/data"), &report(&[duplicated.clone(), duplicated])).is_err());
    }

    #[test]
    fn test_result_set_must_match_request() {
        let text = report(&[format!("3,{},{},/data/a", ABC_SHA1, ABC_SHA256)]);
        let digests = parse_output(Path::new("/data"), &text).unwrap();

        assert!(ensure_complete(&[vp("/a")], &digests).is_ok());
        assert!(ensure_complete(&[vp("/a"), vp("/b")], &digests).is_err());
        assert!(ensure_complete(&[vp("/b")], &digests).is_err());
    }

    #[test]
    fn test_empty_request_does_not_run_tool() {
        let digests = compute_digests(Path::new("/data"), &[], None, &CancelToken::new()).unwrap();
        assert!(digests.is_empty());
    }

    #[test]
    fn test_compute_digests_with_installed_tool() {
        let _guard = SPAWN_LOCK.lock();
        if version().is_none() {
            return;
        }
        let temp_dir = tempfile::TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("abc.txt"), b"abc").unwrap();

        let digests =
            compute_digests(temp_dir.path(), &[vp("/abc.txt")], Some(1), &CancelToken::new())
                .unwrap();
        assert_eq!(digests[&vp("/abc.txt")].sha256.as_str(), ABC_SHA256);
        assert_eq!(digests[&vp("/abc.txt")].sha1, ABC_SHA1);
    }

    #[test]
    fn test_cancelled_before_start_does_not_spawn() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = run_tool(
            OsStr::new("/nonexistent/hashdeep"),
            Path::new("/data"),
            &[vp("/a")],
            None,
            &cancel,
        );
        assert!(matches!(result, Err(BackstopError::Cancelled)));
    }

    #[cfg(unix)]
    mod fake_tool {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;
        use std::time::Duration;
        use tempfile::TempDir;

        fn install(dir: &Path, body: &str) -> PathBuf {
            let script = dir.join("fake-hashdeep");
            std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            script
        }

        #[test]
        fn test_report_from_tool_is_parsed() {
            let _guard = SPAWN_LOCK.lock();
            let bin_dir = TempDir::new().unwrap();
            let root = TempDir::new().unwrap();
            std::fs::write(root.path().join("abc.txt"), b"abc").unwrap();
            let body = format!(
                "cat <<'EOF'\n{}EOF",
                report(&[format!(
                    "3,{},{},{}",
                    ABC_SHA1,
                    ABC_SHA256,
                    root.path().join("abc.txt").display()
                )])
            );
            let script = install(bin_dir.path(), &body);

            let digests = run_tool(
                script.as_os_str(),
                root.path(),
                &[vp("/abc.txt")],
                Some(2),
                &CancelToken::new(),
            )
            .unwrap();
            assert_eq!(digests[&vp("/abc.txt")].sha256.as_str(), ABC_SHA256);
        }

        #[test]
        fn test_failing_tool_reports_stderr() {
            let _guard = SPAWN_LOCK.lock();
            let bin_dir = TempDir::new().unwrap();
            let script = install(bin_dir.path(), "echo 'cannot open list' >&2\nexit 3");

            let result = run_tool(
                script.as_os_str(),
                Path::new("/data"),
                &[vp("/a")],
                None,
                &CancelToken::new(),
            );
            match result {
                Err(BackstopError::ExternalTool(msg)) => assert!(msg.contains("cannot open list")),
                other => panic!("expected ExternalTool error, got {:?}", other),
            }
        }

        #[test]
        fn test_cancel_kills_running_tool() {
            let _guard = SPAWN_LOCK.lock();
            let bin_dir = TempDir::new().unwrap();
            let script = install(bin_dir.path(), "sleep 5");

            let cancel = CancelToken::new();
            let canceller = {
                let cancel = cancel.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(100));
                    cancel.cancel();
                })
            };

            let start = Instant::now();
            let result = run_tool(
                script.as_os_str(),
                Path::new("/data"),
                &[vp("/a")],
                None,
                &cancel,
            );
            canceller.join().unwrap();

            assert!(matches!(result, Err(BackstopError::Cancelled)));
            assert!(start.elapsed() < Duration::from_secs(3));
        }
    }
}
