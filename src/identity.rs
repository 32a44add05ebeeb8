//! Numeric user and group id resolution
//!
//! Owner and group names are recorded by name, not by id. The id→name tables
//! are captured once per run with [`IdentityTable::capture`] and passed
//! explicitly to every call that renders ownership, so there is no process-wide
//! cache and two runs never share stale lookups.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;

// getpwent/getgrent iterate hidden libc state and are not reentrant.
static ENUMERATION_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Point-in-time id→name tables for users and groups
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityTable {
    users: BTreeMap<u32, String>,
    groups: BTreeMap<u32, String>,
}

impl IdentityTable {
    /// Build a table from explicit maps
    pub fn from_maps(users: BTreeMap<u32, String>, groups: BTreeMap<u32, String>) -> Self {
        Self { users, groups }
    }

    /// Enumerate the system user and group databases
    ///
    /// When an id appears more than once the first entry wins, matching what
    /// `getpwuid`/`getgrgid` would return.
    pub fn capture() -> Self {
        let _guard = ENUMERATION_LOCK.lock();
        let table = Self {
            users: enumerate_users(),
            groups: enumerate_groups(),
        };
        debug!(
            "Captured {} users and {} groups",
            table.users.len(),
            table.groups.len()
        );
        table
    }

    /// Name for `uid`, or the decimal id if it has none
    pub fn user_name(&self, uid: u32) -> String {
        self.users
            .get(&uid)
            .cloned()
            .unwrap_or_else(|| uid.to_string())
    }

    /// Name for `gid`, or the decimal id if it has none
    pub fn group_name(&self, gid: u32) -> String {
        self.groups
            .get(&gid)
            .cloned()
            .unwrap_or_else(|| gid.to_string())
    }
}

#[cfg(unix)]
fn enumerate_users() -> BTreeMap<u32, String> {
    use std::ffi::CStr;

    let mut users = BTreeMap::new();
    // SAFETY: serialized by ENUMERATION_LOCK; each entry is copied out before
    // the next getpwent call invalidates it.
    unsafe {
        libc::setpwent();
        loop {
            let entry = libc::getpwent();
            if entry.is_null() {
                break;
            }
            let name = CStr::from_ptr((*entry).pw_name).to_string_lossy().into_owned();
            users.entry((*entry).pw_uid).or_insert(name);
        }
        libc::endpwent();
    }
    users
}

#[cfg(unix)]
fn enumerate_groups() -> BTreeMap<u32, String> {
    use std::ffi::CStr;

    let mut groups = BTreeMap::new();
    // SAFETY: as in enumerate_users.
    unsafe {
        libc::setgrent();
        loop {
            let entry = libc::getgrent();
            if entry.is_null() {
                break;
            }
            let name = CStr::from_ptr((*entry).gr_name).to_string_lossy().into_owned();
            groups.entry((*entry).gr_gid).or_insert(name);
        }
        libc::endgrent();
    }
    groups
}

#[cfg(not(unix))]
fn enumerate_users() -> BTreeMap<u32, String> {
    BTreeMap::new()
}

#[cfg(not(unix))]
fn enumerate_groups() -> BTreeMap<u32, String> {
    BTreeMap::new()
}
