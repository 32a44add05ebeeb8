//! # Backstop CLI
//!
//! Command-line front end for the backstop library.
//!
//! ## Usage
//! ```bash
//! # Create a content store with two shard levels
//! backstop prepare /backups/cas
//!
//! # Back up /srv according to a rule file
//! backstop backup /srv --cas /backups/cas --snapshot /backups/srv.json --rules srv.rules
//!
//! # Check a tree against a snapshot (exit status 2 on drift)
//! backstop verify /srv --snapshot /backups/srv.json
//!
//! # Copy a stored blob to stdout
//! backstop cas cat /backups/cas <digest>
//! ```

use anyhow::Context;
use backstop::hashdeep::Hashdeep;
use backstop::pattern::PatternSet;
use backstop::utils::format_bytes;
use backstop::{
    scan_backup, verify_backup, BackstopConfig, BackstopError, BackupBuilder, CancelToken, Cas,
    Digest, DigestSource, DigestSourceKind, HashPolicy, ParallelHasher, ScanError, Snapshot,
    VerificationResult,
};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Exit status of `verify` when the tree has drifted
const DRIFT_EXIT_CODE: u8 = 2;

/// Backstop - rule-driven backups with verifiable snapshots
#[derive(Parser)]
#[command(name = "backstop")]
#[command(version)]
#[command(about = "Back up directory trees into a content-addressable store and verify them later")]
#[command(long_about = None)]
struct Cli {
    /// JSON configuration file; command-line flags take precedence
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a content store (idempotent)
    Prepare {
        /// Store root
        cas: PathBuf,

        /// Shard directory levels (0-2)
        #[arg(long)]
        depth: Option<usize>,
    },

    /// Back up a directory tree
    Backup {
        /// Tree to back up
        root: PathBuf,

        /// Content store
        #[arg(long)]
        cas: PathBuf,

        /// Where to write the snapshot
        #[arg(long)]
        snapshot: PathBuf,

        /// Pattern file with +/- rules (everything is included otherwise)
        #[arg(short, long)]
        rules: Option<PathBuf>,

        /// Hashing threads
        #[arg(short, long)]
        workers: Option<usize>,

        /// What to do with files that cannot be read
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,

        /// Hash with the external hashdeep tool
        #[arg(long)]
        hashdeep: bool,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// Compare a directory tree against a snapshot
    Verify {
        /// Tree to check
        root: PathBuf,

        /// Snapshot to compare against
        #[arg(long)]
        snapshot: PathBuf,

        /// Hashing threads
        #[arg(short, long)]
        workers: Option<usize>,

        /// Hash with the external hashdeep tool
        #[arg(long)]
        hashdeep: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the entries a backup would select
    Scan {
        /// Tree to scan
        root: PathBuf,

        /// Pattern file with +/- rules
        #[arg(short, long)]
        rules: Option<PathBuf>,
    },

    /// Inspect a content store
    #[command(subcommand)]
    Cas(CasCommands),
}

#[derive(Subcommand)]
enum CasCommands {
    /// List every stored digest
    #[command(alias = "ls")]
    List {
        /// Store root
        cas: PathBuf,
    },

    /// Copy a blob to stdout
    Cat {
        /// Store root
        cas: PathBuf,

        /// SHA-256 digest of the blob
        digest: String,
    },

    /// Show blob count and total size
    Stats {
        /// Store root
        cas: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    /// Abort on the first unreadable file
    Strict,
    /// Leave unreadable files out and report them
    Report,
}

impl From<PolicyArg> for HashPolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::Strict => HashPolicy::Strict,
            PolicyArg::Report => HashPolicy::ReportFailures,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flag
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            let mut message = format!("{:#}", e);
            if let Some(hint) = e.downcast_ref::<BackstopError>().and_then(BackstopError::hint) {
                message.push_str(". ");
                message.push_str(hint);
            }
            eprintln!("{}: {}", "Error".red().bold(), message);
            ExitCode::FAILURE
        }
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => BackstopConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => BackstopConfig::default(),
    };

    match cli.command {
        Commands::Prepare { cas, depth } => cmd_prepare(&config, cas, depth),
        Commands::Backup {
            root,
            cas,
            snapshot,
            rules,
            workers,
            policy,
            hashdeep,
            progress,
        } => {
            let config = override_config(config, workers, policy, hashdeep)?;
            cmd_backup(&config, root, cas, &snapshot, rules.as_deref(), progress)
        }
        Commands::Verify {
            root,
            snapshot,
            workers,
            hashdeep,
            json,
        } => {
            let config = override_config(config, workers, None, hashdeep)?;
            cmd_verify(&config, &root, &snapshot, json)
        }
        Commands::Scan { root, rules } => cmd_scan(&root, rules.as_deref()),
        Commands::Cas(CasCommands::List { cas }) => cmd_cas_list(cas),
        Commands::Cas(CasCommands::Cat { cas, digest }) => cmd_cas_cat(cas, digest),
        Commands::Cas(CasCommands::Stats { cas }) => cmd_cas_stats(cas),
    }
}

/// Apply command-line flags on top of the loaded configuration
fn override_config(
    mut config: BackstopConfig,
    workers: Option<usize>,
    policy: Option<PolicyArg>,
    hashdeep: bool,
) -> anyhow::Result<BackstopConfig> {
    if let Some(workers) = workers {
        config.hash_workers = workers;
    }
    if let Some(policy) = policy {
        config.hash_policy = policy.into();
    }
    if hashdeep {
        config.digest_source = DigestSourceKind::Hashdeep;
    }
    config.validate()?;
    Ok(config)
}

fn load_rules(path: Option<&Path>) -> anyhow::Result<PatternSet> {
    match path {
        Some(path) => PatternSet::from_file(path)
            .with_context(|| format!("reading rules from {}", path.display())),
        None => Ok(PatternSet::default()),
    }
}

fn print_scan_errors(errors: &[ScanError]) {
    if errors.is_empty() {
        return;
    }
    println!("  Errors: {}", errors.len().to_string().red());
    for error in errors {
        println!("    {} {}", "!".red(), error);
    }
}

/// Create the store layout
fn cmd_prepare(
    config: &BackstopConfig,
    root: PathBuf,
    depth: Option<usize>,
) -> anyhow::Result<ExitCode> {
    let depth = depth.unwrap_or(config.sharding_depth);
    let cas = Cas::new(root, depth)?;
    cas.prepare()?;

    println!(
        "{} Prepared store at {} ({} shard levels)",
        "✓".green().bold(),
        cas.root().display().to_string().yellow(),
        cas.sharding_depth()
    );
    Ok(ExitCode::SUCCESS)
}

/// Run one backup and save its snapshot
fn cmd_backup(
    config: &BackstopConfig,
    root: PathBuf,
    cas_root: PathBuf,
    snapshot_path: &Path,
    rules: Option<&Path>,
    show_progress: bool,
) -> anyhow::Result<ExitCode> {
    let rules = load_rules(rules)?;
    let cas = Cas::open(&cas_root)
        .with_context(|| format!("opening store {}", cas_root.display()))?;
    let backup = BackupBuilder::from_config(config)
        .rules(rules.rules().to_vec())
        .build(root, cas)?;

    println!("{}", "Backing up...".blue().bold());

    let start = Instant::now();
    let progress = show_progress.then(|| {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message(format!("Scanning and hashing {}", backup.root().display()));
        pb
    });

    let report = backup.run();

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    let report = report?;
    report
        .snapshot
        .save(snapshot_path)
        .with_context(|| format!("writing snapshot {}", snapshot_path.display()))?;

    let stats = report.snapshot.stats();
    println!(
        "{} Wrote snapshot {}",
        "✓".green().bold(),
        snapshot_path.display().to_string().yellow().bold()
    );
    println!(
        "  Entries: {} files, {} symlinks, {} directories",
        stats.files.to_string().cyan(),
        stats.symlinks.to_string().cyan(),
        stats.directories.to_string().cyan()
    );
    println!("  Size: {}", format_bytes(stats.total_bytes).cyan());
    println!(
        "  Blobs: {} stored ({}), {} already present",
        report.blobs_stored.to_string().cyan(),
        format_bytes(report.bytes_stored),
        report.blobs_deduplicated.to_string().cyan()
    );
    println!("  Time: {}", format_duration(start.elapsed()).to_string().cyan());
    if !report.ignored.is_empty() {
        println!("  Ignored: {}", report.ignored.len().to_string().yellow());
    }
    print_scan_errors(&report.errors);

    Ok(ExitCode::SUCCESS)
}

/// Compare a live tree with a saved snapshot
fn cmd_verify(
    config: &BackstopConfig,
    root: &Path,
    snapshot_path: &Path,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let snapshot = Snapshot::load(snapshot_path)
        .with_context(|| format!("reading snapshot {}", snapshot_path.display()))?;

    let mut options = config.hash_options(CancelToken::new());
    options.policy = HashPolicy::ReportFailures;
    let source: Box<dyn DigestSource> = match config.digest_source {
        DigestSourceKind::Builtin => Box::new(ParallelHasher::new(options)),
        DigestSourceKind::Hashdeep => Box::new(Hashdeep::detect(Some(config.hash_workers))?),
    };

    if !json {
        println!(
            "{} {}",
            "Verifying".blue().bold(),
            root.display().to_string().yellow()
        );
    }
    let result = verify_backup(root, &snapshot, source.as_ref())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_verification(&result);
    }

    Ok(if result.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(DRIFT_EXIT_CODE)
    })
}

fn print_verification(result: &VerificationResult) {
    let sections = [
        ("Changed", &result.changed, "~"),
        ("Missing", &result.missing, "-"),
        ("Unexpected", &result.unexpected, "+"),
    ];
    for (title, paths, marker) in sections {
        if paths.is_empty() {
            continue;
        }
        println!("\n{} ({})", title.bold(), paths.len());
        for path in paths {
            println!("  {} {}", marker.yellow(), path);
        }
    }
    print_scan_errors(&result.scan_errors);

    println!();
    if result.is_clean() {
        println!("{} {}", "✓".green().bold(), result.summary());
    } else {
        println!("{} {}", "✗".red().bold(), result.summary());
    }
    println!("  Verification time: {}ms", result.verification_time_ms);
}

/// Print what a backup with these rules would record
fn cmd_scan(root: &Path, rules: Option<&Path>) -> anyhow::Result<ExitCode> {
    let result = match rules {
        Some(path) => load_rules(Some(path))?.assemble(root)?,
        None => scan_backup(root)?,
    };

    let buckets = [
        ("d", &result.directories),
        ("f", &result.files),
        ("l", &result.symlinks),
    ];
    let mut entries: Vec<_> = buckets
        .iter()
        .flat_map(|(kind, paths)| paths.iter().map(move |path| (path, *kind)))
        .collect();
    entries.sort();
    for (path, kind) in entries {
        println!("{} {}", kind.dimmed(), path);
    }

    println!(
        "\n{} {} entries selected, {} ignored",
        "✓".green().bold(),
        result.recorded_count().to_string().cyan(),
        result.ignored.len()
    );
    print_scan_errors(&result.errors);
    Ok(ExitCode::SUCCESS)
}

fn cmd_cas_list(root: PathBuf) -> anyhow::Result<ExitCode> {
    let cas = Cas::open(root)?;
    for digest in cas.list()? {
        println!("{}", digest);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_cas_cat(root: PathBuf, digest: String) -> anyhow::Result<ExitCode> {
    let cas = Cas::open(root)?;
    let digest = Digest::parse(digest)?;
    let mut blob = cas.retrieve(&digest)?;
    let mut stdout = io::stdout().lock();
    io::copy(&mut blob, &mut stdout).context("writing blob to stdout")?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_cas_stats(root: PathBuf) -> anyhow::Result<ExitCode> {
    let cas = Cas::open(root)?;
    let stats = cas.stats()?;

    println!("{}", "Store:".bold());
    println!("  Root: {}", cas.root().display());
    println!("  Shard levels: {}", cas.sharding_depth());
    println!("  Blobs: {}", stats.blob_count.to_string().cyan());
    println!("  Size: {}", format_bytes(stats.total_bytes).cyan());
    Ok(ExitCode::SUCCESS)
}
