//! Main test module for Backstop
//!
//! This module includes the test suites that need a real filesystem:
//! - Integration tests for backup and verification scenarios
//! - Property-based tests for path, pattern and store invariants

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::backstop::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn store(temp_dir: &TempDir) -> Cas {
        let cas = Cas::new(temp_dir.path().join("cas"), 2).unwrap();
        cas.prepare().unwrap();
        cas
    }

    #[test]
    fn test_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("empty");
        fs::create_dir(&root).unwrap();

        let backup = BackupBuilder::new()
            .build(root, store(&temp_dir))
            .unwrap();
        let report = backup.run().unwrap();

        let stats = report.snapshot.stats();
        assert_eq!(stats.files, 0);
        assert_eq!(stats.directories, 1);
        assert_eq!(report.blobs_stored, 0);
        assert!(backup.verify(&report.snapshot).unwrap().is_clean());
    }

    #[test]
    fn test_everything_excluded() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/file"), "content").unwrap();

        let backup = BackupBuilder::new()
            .rules(parse_pattern_file("- /").unwrap())
            .build(root, store(&temp_dir))
            .unwrap();
        let report = backup.run().unwrap();

        // The root is always present in a snapshot, even when excluded.
        let stats = report.snapshot.stats();
        assert_eq!(stats.files + stats.symlinks, 0);
        assert_eq!(stats.directories, 1);
        assert!(report.snapshot.get(&VirtualPath::root()).is_some());
    }

    #[test]
    fn test_special_filenames() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        fs::create_dir(&root).unwrap();

        let special_names = vec![
            "file with spaces.txt",
            "file,with,commas.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "файл.txt",
            "文件.txt",
            "🚀🌟💾.txt",
        ];
        let mut created = Vec::new();
        for name in &special_names {
            if fs::write(root.join(name), format!("Content of {}", name)).is_ok() {
                created.push(*name);
            }
        }

        let backup = BackupBuilder::new()
            .build(root.clone(), store(&temp_dir))
            .unwrap();
        let report = backup.run().unwrap();

        for name in &created {
            let path = VirtualPath::new(format!("/{}", name)).unwrap();
            let node = report.snapshot.get(&path).unwrap();
            assert!(node.is_file(), "{} was not recorded as a file", name);
        }

        let json = report.snapshot.to_json().unwrap();
        assert_eq!(Snapshot::from_json(&json).unwrap(), report.snapshot);
        assert!(backup.verify(&report.snapshot).unwrap().is_clean());
    }

    #[test]
    fn test_relative_root_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let result = BackupBuilder::new().build(PathBuf::from("relative/dir"), store(&temp_dir));
        assert!(matches!(result, Err(BackstopError::InvalidPath { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_recorded() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        fs::create_dir(&root).unwrap();

        let files = vec![
            ("readable.txt", 0o644, "-rw-r--r--"),
            ("executable.sh", 0o755, "-rwxr-xr-x"),
            ("useronly.txt", 0o600, "-rw-------"),
        ];
        for (name, mode, _) in &files {
            let path = root.join(name);
            fs::write(&path, name).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(*mode)).unwrap();
        }

        let backup = BackupBuilder::new()
            .build(root, store(&temp_dir))
            .unwrap();
        let report = backup.run().unwrap();

        for (name, _, expected) in &files {
            let node = report
                .snapshot
                .get(&VirtualPath::new(format!("/{}", name)).unwrap())
                .unwrap();
            assert_eq!(
                node.meta.permissions, *expected,
                "Permission mismatch for file {}",
                name
            );
        }
    }
}
