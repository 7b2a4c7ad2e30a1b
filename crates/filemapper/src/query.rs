//! Extent and inode queries over a finished store.
//!
//! This module provides:
//! - Closed value ranges and the filter dimensions built from them
//! - The per-session query context (visible types, page size)
//! - Candidate planning over the store indexes and paged evaluation
//! - A `key:value` text filter language

mod context;
mod evaluate;
mod filter;
mod parser;
mod range;

pub use context::{QueryContext, DEFAULT_PAGE_SIZE};
pub use evaluate::{ExtentRow, ExtentRows, InodeRow, InodeRows};
pub use filter::{ExtentFilter, FlagMatch, FlagMode, InodeFilter, PathFilter, PathPattern};
pub use parser::FilterParser;
pub use range::ValueRange;
