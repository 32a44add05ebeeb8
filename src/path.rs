//! Virtual paths and native path translation
//!
//! Every entry Backstop records is identified by a [`VirtualPath`]: an absolute,
//! normalized path that is relative to the backup root rather than to the host
//! filesystem. `/` is the backup root itself, `/etc/hosts` is `etc/hosts` below it.
//!
//! Virtual paths are validated, never repaired. A path like `/foo//bar` or
//! `/foo/../bar` is rejected instead of being normalized, so two textual
//! spellings of one logical path can never both reach the pattern engine.
//!
//! ## Example
//!
//! ```rust
//! use backstop::path::{build_native_path, get_path_from_native_path, VirtualPath};
//! use std::path::Path;
//!
//! # fn main() -> backstop::Result<()> {
//! let vpath = VirtualPath::new("/docs/report.txt")?;
//! let native = build_native_path(Path::new("/home/x"), &vpath)?;
//! assert_eq!(native, Path::new("/home/x/docs/report.txt"));
//! assert_eq!(get_path_from_native_path(Path::new("/home/x"), &native)?, vpath);
//! # Ok(())
//! # }
//! ```

use crate::error::{BackstopError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Separator used by virtual paths
pub const SEPARATOR: char = '/';

/// An absolute, normalized, root-relative path
///
/// Invariants, checked by every constructor:
/// - starts with `/`
/// - contains no `.` or `..` components
/// - contains no doubled separators
/// - has no trailing separator, except the root path `/` itself
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VirtualPath(String);

impl VirtualPath {
    /// Validate `path` and wrap it
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate(&path)?;
        Ok(Self(path))
    }

    /// The root path `/`
    pub fn root() -> Self {
        Self(SEPARATOR.to_string())
    }

    /// Borrow the path as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the root path `/`
    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    /// Components of the path in order; empty for the root
    pub fn parts(&self) -> Vec<&str> {
        if self.is_root() {
            Vec::new()
        } else {
            self.0[1..].split(SEPARATOR).collect()
        }
    }

    /// Last component, or the empty string for the root
    pub fn file_name(&self) -> &str {
        match self.0.rfind(SEPARATOR) {
            Some(idx) => &self.0[idx + 1..],
            None => "",
        }
    }

    /// Parent path, `None` for the root
    pub fn parent(&self) -> Option<VirtualPath> {
        if self.is_root() {
            return None;
        }
        let idx = self.0.rfind(SEPARATOR)?;
        if idx == 0 {
            Some(Self::root())
        } else {
            Some(Self(self.0[..idx].to_string()))
        }
    }

    /// Append a single component
    ///
    /// Fails if `name` is empty, contains a separator, or is `.`/`..`.
    pub fn join(&self, name: &str) -> Result<VirtualPath> {
        if name.contains(SEPARATOR) {
            return Err(BackstopError::invalid_path(
                name,
                "component contains a separator",
            ));
        }
        let joined = if self.is_root() {
            format!("{}{}", SEPARATOR, name)
        } else {
            format!("{}{}{}", self.0, SEPARATOR, name)
        };
        Self::new(joined)
    }

    /// Whether `self` lies strictly below `dir`
    pub fn is_descendant_of(&self, dir: &VirtualPath) -> bool {
        if self == dir {
            return false;
        }
        dir.is_root()
            || (self.0.starts_with(dir.as_str())
                && self.0.as_bytes().get(dir.0.len()) == Some(&(SEPARATOR as u8)))
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VirtualPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for VirtualPath {
    type Error = BackstopError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for VirtualPath {
    type Error = BackstopError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<VirtualPath> for String {
    fn from(value: VirtualPath) -> Self {
        value.0
    }
}

impl std::str::FromStr for VirtualPath {
    type Err = BackstopError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Check the virtual path invariants on a raw string
pub(crate) fn validate(path: &str) -> Result<()> {
    if !path.starts_with(SEPARATOR) {
        return Err(BackstopError::invalid_path(
            path,
            format!("not absolute (does not start with {})", SEPARATOR),
        ));
    }
    if path.len() == 1 {
        return Ok(());
    }
    if path.ends_with(SEPARATOR) {
        return Err(BackstopError::invalid_path(path, "trailing separator"));
    }
    for component in path[1..].split(SEPARATOR) {
        match component {
            "" => return Err(BackstopError::invalid_path(path, "doubled separator")),
            "." | ".." => {
                return Err(BackstopError::invalid_path(
                    path,
                    format!("contains '{}' component", component),
                ))
            }
            _ => {}
        }
    }
    Ok(())
}

fn native_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        BackstopError::invalid_path(path.to_string_lossy(), "not valid UTF-8")
    })
}

/// Check that a native path is absolute and already normalized
///
/// The same invariants as [`VirtualPath`] apply, read against the host
/// filesystem instead of the backup root.
pub fn ensure_native_root(root: &Path) -> Result<()> {
    validate(native_str(root)?)
}

/// Translate a virtual path into a native path below `root`
///
/// The leading separator of `path` is stripped and the remainder joined onto
/// `root`; the root path maps to `root` itself.
pub fn build_native_path(root: &Path, path: &VirtualPath) -> Result<PathBuf> {
    ensure_native_root(root)?;
    if path.is_root() {
        Ok(root.to_path_buf())
    } else {
        Ok(root.join(&path.as_str()[1..]))
    }
}

/// Translate a native path below `root` back into a virtual path
///
/// Fails with a validation error if `native` is not rooted at `root` or if
/// either argument is not absolute and normalized.
pub fn get_path_from_native_path(root: &Path, native: &Path) -> Result<VirtualPath> {
    let root_str = native_str(root)?;
    let native_str = native_str(native)?;
    validate(root_str)?;
    validate(native_str)?;

    if root_str.len() == 1 {
        return VirtualPath::new(native_str);
    }
    if native_str == root_str {
        return Ok(VirtualPath::root());
    }
    match native_str.strip_prefix(root_str) {
        Some(rest) if rest.starts_with(SEPARATOR) => VirtualPath::new(rest),
        _ => Err(BackstopError::invalid_path(
            native_str,
            format!("not a valid path for root directory {}", root_str),
        )),
    }
}
