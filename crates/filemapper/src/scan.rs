//! Reference ingestion: walk a mounted filesystem and fill an extent store.
//!
//! This module provides:
//! - Per-inode extent mapping with protocol fallback (`mapper`)
//! - The depth-first namespace walk (`walk`)
//! - Free space, metadata and unlinked inodes from GETFSMAP (`freespace`)

pub mod freespace;
pub mod mapper;
pub mod walk;

pub use freespace::{FreeSpaceIngest, FreeSpaceReport, PseudoOwner, PseudoOwners};
pub use mapper::{ExtentMapper, MapOutcome, MapTarget};
pub use walk::{scan_filesystem, ProgressSnapshot, ScanProgress, ScanReport, ScanWalk};
