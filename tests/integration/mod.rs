//! Integration tests for backup and verification
//!
//! Each test builds a small tree, backs it up into a fresh store and then
//! perturbs the tree to check what verification reports.

use ::backstop::*;
use filetime::FileTime;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use tempfile::TempDir;

/// A source tree and a prepared store living in one temporary directory
pub struct BackstopTestHarness {
    pub temp_dir: TempDir,
    pub root: PathBuf,
    pub cas: Cas,
}

impl BackstopTestHarness {
    /// Create an empty root and a store with two shard levels
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        fs::create_dir(&root).unwrap();
        let cas = Cas::new(temp_dir.path().join("cas"), 2).unwrap();
        cas.prepare().unwrap();
        Self { temp_dir, root, cas }
    }

    /// Write `content` at `relative`, creating parent directories
    pub fn write(&self, relative: &str, content: &str) {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// A small project: sources, docs, a build directory and a nested empty dir
    pub fn generate_project(&self) {
        self.write("src/main.rs", "fn main() {}\n");
        self.write("src/lib.rs", "pub mod util;\n");
        self.write("src/util.rs", "pub fn helper() {}\n");
        self.write("docs/README.md", "# Project\n");
        self.write("docs/LICENSE", "MIT\n");
        self.write("target/debug/app", "binary");
        self.write("target/debug/app.d", "deps");
        fs::create_dir_all(self.path("assets/empty")).unwrap();
    }

    pub fn backup(&self, rules: &str) -> Backup {
        BackupBuilder::new()
            .rules(parse_pattern_file(rules).unwrap())
            .hash_workers(2)
            .build(self.root.clone(), self.cas.clone())
            .unwrap()
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.temp_dir.path().join("snapshot.json")
    }
}

impl Default for BackstopTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn vp(s: &str) -> VirtualPath {
    VirtualPath::new(s).unwrap()
}

fn vps(paths: &[&str]) -> Vec<VirtualPath> {
    paths.iter().map(|p| vp(p)).collect()
}

fn read_blob(cas: &Cas, digest: &Digest) -> String {
    let mut content = String::new();
    cas.retrieve(digest).unwrap().read_to_string(&mut content).unwrap();
    content
}

fn file_digest(snapshot: &Snapshot, path: &str) -> Digest {
    match &snapshot.get(&vp(path)).unwrap().kind {
        NodeKind::File { digest, .. } => digest.clone(),
        other => panic!("{} is not a file: {:?}", path, other),
    }
}

#[test]
fn test_full_backup_then_clean_verify() {
    let harness = BackstopTestHarness::new();
    harness.generate_project();

    let backup = harness.backup("");
    let report = backup.run().unwrap();
    report.snapshot.save(&harness.snapshot_path()).unwrap();

    let stats = report.snapshot.stats();
    assert_eq!(stats.files, 7);
    // /, src, docs, target, target/debug, assets, assets/empty
    assert_eq!(stats.directories, 7);
    assert!(report.errors.is_empty());

    let loaded = Snapshot::load(&harness.snapshot_path()).unwrap();
    assert_eq!(loaded, report.snapshot);

    let result = backup.verify(&loaded).unwrap();
    assert!(result.is_clean(), "{:?}", result);
    assert_eq!(result.entries_checked, 14);
}

#[test]
fn test_stored_content_matches_files() {
    let harness = BackstopTestHarness::new();
    harness.generate_project();

    let report = harness.backup("").run().unwrap();
    for (relative, expected) in [
        ("/src/main.rs", "fn main() {}\n"),
        ("/docs/LICENSE", "MIT\n"),
        ("/target/debug/app", "binary"),
    ] {
        let digest = file_digest(&report.snapshot, relative);
        assert_eq!(read_blob(&harness.cas, &digest), expected);
    }
    assert_eq!(harness.cas.list().unwrap().len(), 7);
}

#[test]
fn test_rules_select_subtrees() {
    let harness = BackstopTestHarness::new();
    harness.generate_project();

    let rules = "\
# only sources and docs, but not the license
- /
+ /src
+ /docs
- /docs/LICENSE
";
    let report = harness.backup(rules).run().unwrap();
    let snapshot = &report.snapshot;

    assert!(snapshot.get(&vp("/src/util.rs")).is_some());
    assert!(snapshot.get(&vp("/docs/README.md")).is_some());
    assert!(snapshot.get(&vp("/docs/LICENSE")).is_none());
    assert!(snapshot.get(&vp("/target")).is_none());
    assert!(snapshot.get(&vp("/assets")).is_none());

    // Only the selected files reach the store.
    assert_eq!(harness.cas.list().unwrap().len(), 4);
}

#[test]
fn test_verify_reports_drift() {
    let harness = BackstopTestHarness::new();
    harness.generate_project();

    let backup = harness.backup("");
    let snapshot = backup.run().unwrap().snapshot;

    harness.write("src/main.rs", "fn main() { println!(\"changed\"); }\n");
    fs::remove_file(harness.path("docs/LICENSE")).unwrap();
    harness.write("assets/empty/new.png", "png");

    let result = backup.verify(&snapshot).unwrap();
    assert_eq!(
        result.changed,
        vps(&["/assets/empty", "/docs", "/src/main.rs"])
    );
    assert_eq!(result.missing, vps(&["/docs/LICENSE"]));
    assert_eq!(result.unexpected, vps(&["/assets/empty/new.png"]));
    assert!(result.scan_errors.is_empty());
    assert!(!result.is_clean());
}

#[test]
fn test_timestamp_changes_are_not_drift() {
    let harness = BackstopTestHarness::new();
    harness.generate_project();

    let backup = harness.backup("");
    let snapshot = backup.run().unwrap().snapshot;

    let past = FileTime::from_unix_time(1_000_000_000, 0);
    for relative in ["src/main.rs", "docs", "target/debug/app"] {
        filetime::set_file_times(harness.path(relative), past, past).unwrap();
    }

    let result = backup.verify(&snapshot).unwrap();
    assert!(result.is_clean(), "{:?}", result);
}

#[test]
fn test_same_size_content_change_is_detected() {
    let harness = BackstopTestHarness::new();
    harness.write("data.bin", "aaaa");

    let backup = harness.backup("");
    let snapshot = backup.run().unwrap().snapshot;

    // Same size, same times: only the digest can tell.
    let times = fs::metadata(harness.path("data.bin")).unwrap();
    let mtime = FileTime::from_last_modification_time(&times);
    let atime = FileTime::from_last_access_time(&times);
    harness.write("data.bin", "bbbb");
    filetime::set_file_times(harness.path("data.bin"), atime, mtime).unwrap();

    let result = backup.verify(&snapshot).unwrap();
    assert_eq!(result.changed, vps(&["/data.bin"]));
}

#[test]
fn test_excluded_entries_are_unexpected_on_verify() {
    let harness = BackstopTestHarness::new();
    harness.generate_project();

    let backup = harness.backup("- /target");
    let snapshot = backup.run().unwrap().snapshot;

    let result = backup.verify(&snapshot).unwrap();
    assert_eq!(
        result.unexpected,
        vps(&["/target", "/target/debug", "/target/debug/app", "/target/debug/app.d"])
    );
    // The root's recorded children no longer match the live ones.
    assert_eq!(result.changed, vps(&["/"]));
    assert!(result.missing.is_empty());
}

#[test]
fn test_control_directory_is_never_backed_up() {
    let harness = BackstopTestHarness::new();
    harness.generate_project();
    harness.write(".backstop/state", "private");

    let backup = harness.backup("");
    let report = backup.run().unwrap();
    assert!(report.snapshot.get(&vp("/.backstop")).is_none());
    assert!(report
        .snapshot
        .flatten()
        .keys()
        .all(|path| !path.is_descendant_of(&vp("/.backstop"))));

    let result = backup.verify(&report.snapshot).unwrap();
    assert_eq!(result.unexpected, vps(&["/.backstop"]));
    assert!(result.changed.is_empty());
}

#[test]
fn test_deduplication_across_runs_and_roots() {
    let harness = BackstopTestHarness::new();
    harness.generate_project();
    let first = harness.backup("").run().unwrap();
    assert_eq!(first.blobs_stored, 7);

    // A second tree sharing some content with the first.
    let other_root = harness.temp_dir.path().join("other");
    fs::create_dir(&other_root).unwrap();
    fs::write(other_root.join("copy.rs"), "fn main() {}\n").unwrap();
    fs::write(other_root.join("fresh.txt"), "never seen").unwrap();

    let other = BackupBuilder::new()
        .build(other_root, harness.cas.clone())
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(other.blobs_stored, 1);
    assert_eq!(other.blobs_deduplicated, 1);
    assert_eq!(harness.cas.list().unwrap().len(), 8);
}

#[cfg(unix)]
#[test]
fn test_symlinks_are_recorded_not_followed() {
    use std::os::unix::fs::symlink;

    let harness = BackstopTestHarness::new();
    harness.write("target.txt", "Target content");
    symlink("target.txt", harness.path("link.txt")).unwrap();
    symlink("/nonexistent/elsewhere", harness.path("dangling")).unwrap();

    let backup = harness.backup("");
    let report = backup.run().unwrap();
    let stats = report.snapshot.stats();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.symlinks, 2);

    match &report.snapshot.get(&vp("/link.txt")).unwrap().kind {
        NodeKind::Symlink { target } => assert_eq!(target, "target.txt"),
        other => panic!("expected a symlink, got {:?}", other),
    }

    fs::remove_file(harness.path("link.txt")).unwrap();
    symlink("elsewhere.txt", harness.path("link.txt")).unwrap();
    let result = backup.verify(&report.snapshot).unwrap();
    assert_eq!(result.changed, vps(&["/link.txt"]));
}

#[test]
fn test_backup_from_config() {
    let harness = BackstopTestHarness::new();
    harness.generate_project();

    let config_path = harness.temp_dir.path().join("backstop.json");
    fs::write(&config_path, r#"{ "hash_workers": 1, "hash_policy": "report_failures" }"#).unwrap();
    let config = BackstopConfig::load(&config_path).unwrap();
    assert_eq!(config.sharding_depth, 2);

    let report = BackupBuilder::from_config(&config)
        .build(harness.root.clone(), harness.cas.clone())
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(report.snapshot.stats().files, 7);
}

#[test]
fn test_snapshot_document_is_stable() {
    let harness = BackstopTestHarness::new();
    harness.generate_project();

    let backup = harness.backup("");
    let first = backup.run().unwrap().snapshot;
    let second = backup.run().unwrap().snapshot;

    // Atimes may move between runs; everything else must be identical.
    let paths = |snapshot: &Snapshot| -> Vec<VirtualPath> {
        snapshot.flatten().keys().cloned().collect()
    };
    assert_eq!(paths(&first), paths(&second));
    assert_eq!(
        file_digest(&first, "/src/lib.rs"),
        file_digest(&second, "/src/lib.rs")
    );
    assert!(backup.verify(&first).unwrap().is_clean());
}
