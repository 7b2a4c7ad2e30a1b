//! Persisted rows and the table container.

use std::collections::BTreeMap;

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::overview::OverviewCell;
use crate::types::{ExtentFlags, ExtentType, InodeInfo, InodeTimes, InodeType};

/// Static filesystem facts captured when a scan starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemSummary {
    pub path: String,
    pub block_size: u64,
    pub frag_size: u64,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub avail_bytes: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub avail_inodes: u64,
    pub max_name_len: u64,
    /// Scan start, unix seconds.
    pub timestamp: i64,
    pub finished: bool,
    pub path_separator: char,
    pub fs_type: String,
}

impl FilesystemSummary {
    /// A blank summary stamped with the current time.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            block_size: 0,
            frag_size: 0,
            total_bytes: 0,
            free_bytes: 0,
            avail_bytes: 0,
            total_inodes: 0,
            free_inodes: 0,
            avail_inodes: 0,
            max_name_len: 0,
            timestamp: Utc::now().timestamp(),
            finished: false,
            path_separator: '/',
            fs_type: String::new(),
        }
    }

    pub fn scanned_at(&self) -> Option<DateTime<Local>> {
        Local.timestamp_opt(self.timestamp, 0).single()
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }

    pub fn used_inodes(&self) -> u64 {
        self.total_inodes.saturating_sub(self.free_inodes)
    }
}

/// The summary row plus counts derived from the extent table.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryReport {
    pub summary: FilesystemSummary,
    pub extents: u64,
    pub inodes_with_extents: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub ino: i64,
    pub kind: InodeType,
    pub size: Option<u64>,
    pub times: InodeTimes,
}

impl From<&InodeInfo> for InodeRecord {
    fn from(info: &InodeInfo) -> Self {
        Self {
            ino: info.ino,
            kind: info.kind,
            size: info.size,
            times: info.times,
        }
    }
}

/// Lazily computed per-inode fragmentation numbers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InodeStats {
    /// Number of primary extents.
    pub extents: u64,
    pub travel_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub ino: i64,
    pub physical: u64,
    /// `None` for metadata and free space.
    pub logical: Option<u64>,
    pub length: u64,
    pub flags: ExtentFlags,
    pub kind: ExtentType,
}

impl Extent {
    /// Inclusive last physical byte. Stored extents are never empty.
    #[inline]
    pub fn physical_end(&self) -> u64 {
        self.physical.saturating_add(self.length).saturating_sub(1)
    }

    /// Inclusive last logical byte.
    #[inline]
    pub fn logical_end(&self) -> Option<u64> {
        self.logical
            .map(|logical| logical.saturating_add(self.length).saturating_sub(1))
    }
}

/// One directory listing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry<'a> {
    pub parent: i64,
    pub name: &'a str,
    pub child: i64,
}

// ---------------------------------------------------------------------------
// Table container
// ---------------------------------------------------------------------------

/// Everything a scan produces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    pub summary: Option<FilesystemSummary>,
    pub inodes: BTreeMap<i64, InodeRecord>,
    /// Full path (relative to the scanned root, root is `""`) to inode.
    pub paths: BTreeMap<String, i64>,
    /// Parent inode to (child name to child inode).
    pub directories: BTreeMap<i64, BTreeMap<String, i64>>,
    pub extents: Vec<Extent>,
}

/// Values computed after a scan that can be dropped and rebuilt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalculatedState {
    pub inode_stats: BTreeMap<i64, InodeStats>,
    /// Overview cells keyed by resolution.
    pub overviews: BTreeMap<u64, Vec<OverviewCell>>,
}
