//! Segment naming and addressing.
//!
//! Every blob the log store writes lives under a fixed sub-path of its disk
//! (`logs` or `snapshots`) and carries its index range in the file name:
//!
//! ```text
//! logs/changelog_00000000000000000001_00000000000000000003.bin   sealed
//! logs/changelog_00000000000000000004_open.bin                   active
//! snapshots/snapshot_00000000000000000001_00000000000000000100.bin
//! ```
//!
//! Indices are zero padded to 20 digits so lexical order matches numeric
//! order for the whole `u64` range.

use std::fmt::{self, Display};

pub const LOGS_SUB_PATH: &str = "logs";
pub const SNAPSHOTS_SUB_PATH: &str = "snapshots";

const CHANGELOG_FILE_PREFIX: &str = "changelog_";
const SNAPSHOT_FILE_PREFIX: &str = "snapshot_";
const FILE_EXT: &str = ".bin";
const OPEN_MARKER: &str = "open";
const INDEX_WIDTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageRole {
    Log,
    Snapshot,
}

impl StorageRole {
    pub fn sub_path(&self) -> &'static str {
        match self {
            StorageRole::Log => LOGS_SUB_PATH,
            StorageRole::Snapshot => SNAPSHOTS_SUB_PATH,
        }
    }

    fn file_prefix(&self) -> &'static str {
        match self {
            StorageRole::Log => CHANGELOG_FILE_PREFIX,
            StorageRole::Snapshot => SNAPSHOT_FILE_PREFIX,
        }
    }
}

/// Inclusive index range; `last_index == None` marks the open (active) segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexRange {
    pub first_index: u64,
    pub last_index: Option<u64>,
}

impl IndexRange {
    pub fn sealed(first_index: u64, last_index: u64) -> Self {
        Self {
            first_index,
            last_index: Some(last_index),
        }
    }

    pub fn open(first_index: u64) -> Self {
        Self {
            first_index,
            last_index: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.last_index.is_none()
    }
}

/// A key relative to a disk's root prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Builds the key of a blob holding `first_index..=last_index` for `role`.
///
/// `last_index == None` names the open segment and is only meaningful for
/// [`StorageRole::Log`].
pub fn segment_key(first_index: u64, last_index: Option<u64>, role: StorageRole) -> StorageKey {
    let last = match last_index {
        Some(last) => format!("{:0width$}", last, width = INDEX_WIDTH),
        None => OPEN_MARKER.to_string(),
    };
    StorageKey(format!(
        "{}/{}{:0width$}_{}{}",
        role.sub_path(),
        role.file_prefix(),
        first_index,
        last,
        FILE_EXT,
        width = INDEX_WIDTH
    ))
}

/// Recovers role and range from a key returned by a listing.
///
/// Returns `None` for anything the log store did not write (temporary files,
/// foreign blobs, the high-water mark).
pub fn parse_storage_key(key: &str) -> Option<(StorageRole, IndexRange)> {
    let (dir, file_name) = key.rsplit_once('/')?;
    let role = match dir {
        LOGS_SUB_PATH => StorageRole::Log,
        SNAPSHOTS_SUB_PATH => StorageRole::Snapshot,
        _ => return None,
    };

    let body = file_name
        .strip_prefix(role.file_prefix())?
        .strip_suffix(FILE_EXT)?;
    let (first, last) = body.split_once('_')?;
    let first_index = parse_padded(first)?;

    let last_index = if last == OPEN_MARKER && role == StorageRole::Log {
        None
    } else {
        let last = parse_padded(last)?;
        if last < first_index {
            return None;
        }
        Some(last)
    };

    Some((
        role,
        IndexRange {
            first_index,
            last_index,
        },
    ))
}

fn parse_padded(digits: &str) -> Option<u64> {
    if digits.len() != INDEX_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Joins a root prefix and a relative path by literal concatenation.
///
/// Exactly one `/` separates non-empty parts. A leading `/` on `sub_path`
/// never makes it absolute and never discards `root_prefix`.
pub fn compose_prefix(root_prefix: &str, sub_path: &str) -> String {
    let root = root_prefix.trim_matches('/');
    let sub = sub_path.trim_matches('/');
    match (root.is_empty(), sub.is_empty()) {
        (true, true) => String::new(),
        (true, false) => sub.to_string(),
        (false, true) => root.to_string(),
        (false, false) => format!("{}/{}", root, sub),
    }
}
