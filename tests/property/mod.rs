//! Property-based testing for Backstop
//!
//! Uses proptest to check path, pattern, hashing and store invariants across
//! randomly generated inputs.

use ::backstop::hashing::{hash_bytes, hash_reader};
use ::backstop::path::{build_native_path, get_path_from_native_path};
use ::backstop::pattern::{path_matches_single_pattern, pattern_decision};
use ::backstop::storage::MAX_SHARDING_DEPTH;
use ::backstop::*;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::Path;
use tempfile::TempDir;

/// A single path component that is never `.` or `..`
fn component_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z0-9_][a-z0-9_.-]{0,7}".prop_map(|s| s),
        "dir[0-9]{1,3}".prop_map(|s| s),
        "[a-zA-Z]{1,4} [a-zA-Z]{1,4}".prop_map(|s| s),
    ]
}

/// Generate valid virtual paths with 1-5 components
fn virtual_path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(component_strategy(), 1..=5)
        .prop_map(|parts| format!("/{}", parts.join("/")))
}

/// Generate random file content
fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        // Empty files
        Just(Vec::new()),
        // Small text files
        "[a-zA-Z0-9 \n]{1,1000}".prop_map(|s| s.into_bytes()),
        // Binary data spanning several read buffers
        prop::collection::vec(any::<u8>(), 1..100_000),
        // Repetitive patterns
        (any::<u8>(), 1..1000usize).prop_map(|(byte, count)| vec![byte; count]),
    ]
}

fn decision_strategy() -> impl Strategy<Value = Decision> {
    prop_oneof![Just(Decision::Include), Just(Decision::Exclude)]
}

/// Write `files` below `root`, skipping paths that collide with an earlier one
fn write_tree(root: &Path, files: &BTreeMap<String, Vec<u8>>) -> Vec<String> {
    let mut written = Vec::new();
    for (path, content) in files {
        let native = root.join(path.trim_start_matches('/'));
        let blocked = native
            .ancestors()
            .skip(1)
            .take_while(|ancestor| *ancestor != root)
            .any(|ancestor| ancestor.is_file());
        if blocked || native.exists() {
            continue;
        }
        if let Some(parent) = native.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&native, content).unwrap();
        written.push(path.clone());
    }
    written
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Native translation is lossless for every valid virtual path
    #[test]
    fn native_path_round_trip(path in virtual_path_strategy()) {
        let root = Path::new("/srv/backup root");
        let vpath = VirtualPath::new(path.clone()).unwrap();
        let native = build_native_path(root, &vpath).unwrap();
        prop_assert!(native.starts_with(root));
        prop_assert_eq!(get_path_from_native_path(root, &native).unwrap(), vpath);
    }

    /// Every path matches itself and everything below it
    #[test]
    fn pattern_matches_itself_and_descendants(
        path in virtual_path_strategy(),
        child in component_strategy(),
    ) {
        prop_assert!(path_matches_single_pattern(&path, &path).unwrap());
        let descendant = format!("{}/{}", path, child);
        prop_assert!(path_matches_single_pattern(&descendant, &path).unwrap());
        prop_assert!(path_matches_single_pattern(&path, "/").unwrap());
    }

    /// A longer sibling name is never covered by a prefix of it
    #[test]
    fn pattern_respects_component_boundaries(
        path in virtual_path_strategy(),
        suffix in "[a-z]{1,4}",
    ) {
        let sibling = format!("{}{}", path, suffix);
        prop_assert!(!path_matches_single_pattern(&sibling, &path).unwrap());
    }

    /// The last matching rule decides, whatever came before it
    #[test]
    fn last_matching_rule_wins(
        earlier in prop::collection::vec((decision_strategy(), virtual_path_strategy()), 0..8),
        last in (decision_strategy(), virtual_path_strategy()),
        child in component_strategy(),
    ) {
        let mut rules: Vec<PatternRule> = earlier
            .into_iter()
            .map(|(decision, path)| PatternRule::new(decision, VirtualPath::new(path).unwrap()))
            .collect();
        let pattern = VirtualPath::new(last.1).unwrap();
        rules.push(PatternRule::new(last.0, pattern.clone()));

        prop_assert_eq!(pattern_decision(&pattern, &rules), last.0);
        let below = pattern.join(&child).unwrap();
        prop_assert_eq!(pattern_decision(&below, &rules), last.0);
    }

    /// Streaming and one-shot hashing agree
    #[test]
    fn hash_reader_matches_hash_bytes(content in content_strategy()) {
        prop_assert_eq!(hash_reader(content.as_slice()).unwrap(), hash_bytes(&content));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Stored blobs come back byte for byte and are all listed, at any depth
    #[test]
    fn cas_round_trip_and_listing(
        depth in 0..=MAX_SHARDING_DEPTH,
        contents in prop::collection::vec(content_strategy(), 0..12),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let cas = Cas::new(temp_dir.path().join("cas"), depth).unwrap();

        let mut stored = BTreeSet::new();
        for content in &contents {
            let digest = hash_bytes(content);
            match cas.store(content.as_slice(), &digest) {
                Ok(written) => {
                    prop_assert_eq!(written, content.len() as u64);
                    prop_assert!(stored.insert(digest.clone()));
                }
                Err(BackstopError::AlreadyExists(existing)) => {
                    prop_assert!(stored.contains(&existing));
                }
                Err(e) => return Err(TestCaseError::fail(e.to_string())),
            }

            let mut back = Vec::new();
            cas.retrieve(&digest).unwrap().read_to_end(&mut back).unwrap();
            prop_assert_eq!(&back, content);
        }

        let listed: BTreeSet<Digest> = cas.list().unwrap().into_iter().collect();
        prop_assert_eq!(listed, stored);
    }

    /// A tree verifies clean against its own fresh snapshot
    #[test]
    fn backup_then_verify_is_clean(
        files in prop::collection::btree_map(virtual_path_strategy(), content_strategy(), 0..16),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        fs::create_dir(&root).unwrap();
        let written = write_tree(&root, &files);

        let cas = Cas::new(temp_dir.path().join("cas"), 1).unwrap();
        cas.prepare().unwrap();
        let backup = BackupBuilder::new().hash_workers(2).build(root, cas).unwrap();
        let report = backup.run().unwrap();

        prop_assert_eq!(report.snapshot.stats().files, written.len());
        for path in &written {
            let node = report.snapshot.get(&VirtualPath::new(path.clone()).unwrap());
            prop_assert!(node.is_some_and(|node| node.is_file()));
        }

        let json = report.snapshot.to_json().unwrap();
        let reloaded = Snapshot::from_json(&json).unwrap();
        prop_assert_eq!(&reloaded, &report.snapshot);

        let result = backup.verify(&reloaded).unwrap();
        prop_assert!(result.is_clean(), "{:?}", result);
    }
}
