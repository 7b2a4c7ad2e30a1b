//! Filesystem extent mapping, storage and query library.
//!
//! This crate provides:
//! - Decoding of the FIEMAP, FIBMAP and GETFSMAP block-mapping interfaces
//! - A persistent snapshot of inodes, paths, directories and extents
//! - Extent and inode queries over physical, logical, path, type and flag filters
//! - Device overviews binned into display cells, and per-inode travel scores
//! - A reference scanner that walks a mounted filesystem into a store

pub mod cancel;
pub mod config;
pub mod error;
pub mod overview;
pub mod protocol;
pub mod query;
pub mod scan;
pub mod stats;
pub mod store;
pub mod types;

// Re-export main types
pub use cancel::CancellationToken;
pub use config::{ScanOptions, StoreMode, StoreOptions};
pub use error::{FilemapError, Result};
pub use overview::{OverviewAggregator, OverviewCell, OverviewScan};
pub use protocol::RawExtent;
pub use query::{ExtentFilter, FilterParser, InodeFilter, QueryContext, ValueRange};
pub use scan::{scan_filesystem, ScanReport, ScanWalk};
pub use stats::travel_stats;
pub use store::{Extent, ExtentStore, FilesystemSummary, InodeRecord, InodeStats, ScanSession, SummaryReport};
pub use types::{ExtentFlags, ExtentType, ExtentTypeSet, InodeInfo, InodeType};
