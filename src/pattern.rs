//! Include/exclude rules and the rule-driven tree walk
//!
//! A pattern file is an ordered list of rules, one per line:
//!
//! ```text
//! # comments start with '#', blank lines are skipped
//! - /
//! + /etc
//! - /etc/ssl/private
//! ```
//!
//! A rule matches a path when the rule's path is the path itself or one of its
//! ancestors. Rules are evaluated in order and the last matching rule decides;
//! a path no rule matches is included.
//!
//! [`assemble_paths`] walks a tree depth-first under a rule list. An excluded
//! directory is pruned together with everything below it, so a later rule
//! cannot re-include a path under a directory the walk never entered. The root
//! `/` is the one exception: it is decided on its own and the walk always
//! starts, which is what makes "exclude everything, include a few subtrees"
//! rule lists work.

use crate::error::{BackstopError, Result};
use crate::path::{validate, VirtualPath, SEPARATOR};
use crate::types::ScanResult;
use crate::walk::{walk_tree, Selection};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Comment marker for pattern files
pub const COMMENT_PREFIX: char = '#';

/// Outcome of evaluating rules against a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// Back the path up (`+`)
    Include,
    /// Skip the path (`-`)
    Exclude,
}

impl Decision {
    /// The pattern file modifier for this decision
    pub fn symbol(&self) -> char {
        match self {
            Decision::Include => '+',
            Decision::Exclude => '-',
        }
    }
}

impl FromStr for Decision {
    type Err = BackstopError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "+" => Ok(Decision::Include),
            "-" => Ok(Decision::Exclude),
            other => Err(BackstopError::invalid_pattern(other)),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// A single include or exclude rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatternRule {
    /// What a match decides
    pub decision: Decision,
    /// The path the rule covers, together with everything below it
    pub pattern: VirtualPath,
}

impl PatternRule {
    /// Create a rule
    pub fn new(decision: Decision, pattern: VirtualPath) -> Self {
        Self { decision, pattern }
    }

    /// Whether this rule applies to `path`
    pub fn matches(&self, path: &VirtualPath) -> bool {
        covers(self.pattern.as_str(), path.as_str())
    }
}

impl fmt::Display for PatternRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.decision, self.pattern)
    }
}

fn covers(pattern: &str, path: &str) -> bool {
    if pattern.len() == 1 || pattern == path {
        return true;
    }
    path.len() > pattern.len()
        && path.starts_with(pattern)
        && path.as_bytes()[pattern.len()] == SEPARATOR as u8
}

/// Parse a single non-comment line into a rule
fn parse_line(line: &str) -> Result<PatternRule> {
    let invalid = || BackstopError::invalid_pattern(line);

    let mut chars = line.chars();
    let decision = match chars.next() {
        Some('+') => Decision::Include,
        Some('-') => Decision::Exclude,
        _ => return Err(invalid()),
    };
    let rest = chars.as_str();
    if !rest.starts_with(char::is_whitespace) {
        return Err(invalid());
    }
    let path = rest.trim_start();
    if !path.starts_with(SEPARATOR) {
        return Err(invalid());
    }
    let pattern = VirtualPath::new(path).map_err(|_| invalid())?;
    Ok(PatternRule::new(decision, pattern))
}

/// Parse pattern file text into an ordered rule list
///
/// Trailing whitespace is trimmed from each line before it is parsed. A line
/// that is neither a comment, blank, nor a well-formed rule fails the whole
/// parse with [`BackstopError::InvalidPattern`] quoting the line.
pub fn parse_pattern_file(text: &str) -> Result<Vec<PatternRule>> {
    let mut rules = Vec::new();
    for raw in text.lines() {
        let line = raw.trim_end();
        if line.is_empty() || line.starts_with(COMMENT_PREFIX) {
            continue;
        }
        rules.push(parse_line(line)?);
    }
    debug!("Parsed {} pattern rules", rules.len());
    Ok(rules)
}

/// Whether `pattern` covers `path`
///
/// True when the two are equal, when `pattern` is `/`, or when `path` lies
/// below `pattern`. `/ab` is not below `/a`. Both arguments must be valid
/// virtual paths.
pub fn path_matches_single_pattern(path: &str, pattern: &str) -> Result<bool> {
    validate(path)?;
    validate(pattern)?;
    Ok(covers(pattern, path))
}

/// Decide a path under an ordered rule list; the last matching rule wins
pub fn pattern_decision(path: &VirtualPath, rules: &[PatternRule]) -> Decision {
    rules
        .iter()
        .filter(|rule| rule.matches(path))
        .last()
        .map_or(Decision::Include, |rule| rule.decision)
}

/// Walk `root` and bucket every included entry
///
/// The root must be a directory. It is recorded as `/` when the rules include
/// it, and its children are visited either way.
pub fn assemble_paths(root: &Path, rules: &[PatternRule]) -> Result<ScanResult> {
    let root_included = pattern_decision(&VirtualPath::root(), rules) == Decision::Include;

    let mut result = walk_tree(root, |vpath, _| match pattern_decision(vpath, rules) {
        Decision::Include => Selection::Record,
        Decision::Exclude => Selection::Prune,
    })?;
    if root_included {
        result.directories.insert(0, VirtualPath::root());
    }

    info!(
        "Selected {} entries under {:?} ({} errors)",
        result.recorded_count(),
        root,
        result.errors.len()
    );
    Ok(result)
}

/// An ordered rule list, usually read from a pattern file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSet {
    rules: Vec<PatternRule>,
}

impl PatternSet {
    /// Wrap an existing rule list
    pub fn new(rules: Vec<PatternRule>) -> Self {
        Self { rules }
    }

    /// Read and parse a pattern file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        text.parse()
    }

    /// The rules in evaluation order
    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    /// Decide `path` under this set
    pub fn decision(&self, path: &VirtualPath) -> Decision {
        pattern_decision(path, &self.rules)
    }

    /// Walk `root` under this set
    pub fn assemble(&self, root: &Path) -> Result<ScanResult> {
        assemble_paths(root, &self.rules)
    }
}

impl FromStr for PatternSet {
    type Err = BackstopError;

    fn from_str(s: &str) -> Result<Self> {
        parse_pattern_file(s).map(Self::new)
    }
}

impl fmt::Display for PatternSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rule in &self.rules {
            writeln!(f, "{}", rule)?;
        }
        Ok(())
    }
}
