//! Filter dimensions for extent and inode queries.
//!
//! Dimensions combine with AND; values within one dimension combine with OR.
//! An empty dimension places no restriction.

use glob::{MatchOptions, Pattern};

use super::range::{any_contains, any_contains_opt, any_overlaps, ValueRange};
use crate::error::{FilemapError, Result};
use crate::store::{Extent, InodeRecord, InodeStats};
use crate::types::{ExtentFlags, ExtentTypeSet};

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// One path value: an exact path or a glob whose `*` also crosses separators.
#[derive(Debug, Clone)]
pub enum PathPattern {
    Exact(String),
    Glob { pattern: Pattern, prefix: String },
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let Some(split) = raw.find(['*', '?', '[']) else {
            return Ok(Self::Exact(raw.to_string()));
        };
        let pattern = Pattern::new(raw)
            .map_err(|error| FilemapError::QueryParse(format!("invalid path glob {raw:?}: {error}")))?;
        Ok(Self::Glob {
            pattern,
            prefix: raw[..split].to_string(),
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(expected) => expected == path,
            Self::Glob { pattern, prefix } => {
                path.starts_with(prefix.as_str()) && pattern.matches_with(path, GLOB_OPTIONS)
            }
        }
    }

    /// Literal text every matching path starts with.
    pub fn literal_prefix(&self) -> &str {
        match self {
            Self::Exact(path) => path,
            Self::Glob { prefix, .. } => prefix,
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }
}

/// The path dimension. Asking for the universal wildcard clears it.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    patterns: Vec<PathPattern>,
    match_all: bool,
}

impl PathFilter {
    pub fn add(&mut self, raw: &str, separator: char) -> Result<()> {
        if self.match_all {
            return Ok(());
        }
        if is_universal_wildcard(raw, separator) {
            self.match_all = true;
            self.patterns.clear();
            return Ok(());
        }
        self.patterns.push(PathPattern::parse(raw)?);
        Ok(())
    }

    /// True when the dimension restricts anything.
    pub fn is_active(&self) -> bool {
        !self.match_all && !self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[PathPattern] {
        &self.patterns
    }

    pub fn matches(&self, path: &str) -> bool {
        !self.is_active() || self.patterns.iter().any(|pattern| pattern.matches(path))
    }
}

fn is_universal_wildcard(raw: &str, separator: char) -> bool {
    if raw == "*" {
        return true;
    }
    let mut chars = raw.chars();
    chars.next() == Some(separator) && chars.as_str() == "*"
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagMode {
    /// Flags equal the mask.
    Exact,
    /// At least one mask bit is set.
    Any,
    /// Every mask bit is set.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagMatch {
    pub mask: ExtentFlags,
    pub mode: FlagMode,
}

impl FlagMatch {
    pub fn exact(mask: ExtentFlags) -> Self {
        Self {
            mask,
            mode: FlagMode::Exact,
        }
    }

    pub fn any(mask: ExtentFlags) -> Self {
        Self {
            mask,
            mode: FlagMode::Any,
        }
    }

    pub fn all(mask: ExtentFlags) -> Self {
        Self {
            mask,
            mode: FlagMode::All,
        }
    }

    pub fn matches(&self, flags: ExtentFlags) -> bool {
        match self.mode {
            FlagMode::Exact => flags == self.mask,
            FlagMode::Any => flags.intersects(self.mask),
            FlagMode::All => flags.contains(self.mask),
        }
    }
}

// ---------------------------------------------------------------------------
// Extent filter
// ---------------------------------------------------------------------------

/// Dimensions that apply to individual extents.
#[derive(Debug, Clone, Default)]
pub struct ExtentFilter {
    pub physical: Vec<ValueRange<u64>>,
    pub logical: Vec<ValueRange<u64>>,
    pub inodes: Vec<ValueRange<i64>>,
    pub lengths: Vec<ValueRange<u64>>,
    pub paths: PathFilter,
    pub types: Option<ExtentTypeSet>,
    pub flags: Vec<FlagMatch>,
}

impl ExtentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_physical(mut self, start: u64, end: u64) -> Self {
        self.physical.push(ValueRange::new(start, end));
        self
    }

    pub fn with_logical(mut self, start: u64, end: u64) -> Self {
        self.logical.push(ValueRange::new(start, end));
        self
    }

    pub fn with_inodes(mut self, start: i64, end: i64) -> Self {
        self.inodes.push(ValueRange::new(start, end));
        self
    }

    pub fn with_inode(self, ino: i64) -> Self {
        self.with_inodes(ino, ino)
    }

    pub fn with_lengths(mut self, start: u64, end: u64) -> Self {
        self.lengths.push(ValueRange::new(start, end));
        self
    }

    /// Adds a path or glob, using `/` as the separator for wildcard detection.
    pub fn with_path(mut self, raw: &str) -> Result<Self> {
        self.paths.add(raw, '/')?;
        Ok(self)
    }

    pub fn with_types(mut self, types: ExtentTypeSet) -> Self {
        self.types = Some(self.types.map_or(types, |current| current | types));
        self
    }

    pub fn with_flags(mut self, flags: FlagMatch) -> Self {
        self.flags.push(flags);
        self
    }

    /// True when some dimension other than inode number or path restricts
    /// which extents match.
    pub fn restricts_extents(&self) -> bool {
        !self.physical.is_empty()
            || !self.logical.is_empty()
            || !self.lengths.is_empty()
            || self.types.is_some()
            || !self.flags.is_empty()
    }

    /// Checks the per-extent dimensions. Path membership is resolved by the
    /// evaluator, which owns the path table.
    pub fn matches_extent(&self, extent: &Extent) -> bool {
        if !any_contains(&self.inodes, extent.ino) {
            return false;
        }
        if !any_overlaps(&self.physical, extent.physical, extent.physical_end()) {
            return false;
        }
        if !self.logical.is_empty() {
            match (extent.logical, extent.logical_end()) {
                (Some(start), Some(end)) if any_overlaps(&self.logical, start, end) => {}
                _ => return false,
            }
        }
        if !any_contains(&self.lengths, extent.length) {
            return false;
        }
        if let Some(types) = self.types {
            if !types.has(extent.kind) {
                return false;
            }
        }
        self.flags.is_empty() || self.flags.iter().any(|flags| flags.matches(extent.flags))
    }
}

// ---------------------------------------------------------------------------
// Inode filter
// ---------------------------------------------------------------------------

/// Extent dimensions (an inode matches if it owns a matching extent) plus
/// dimensions on the inode row itself.
#[derive(Debug, Clone, Default)]
pub struct InodeFilter {
    pub extent: ExtentFilter,
    pub travel_scores: Vec<ValueRange<f64>>,
    pub extent_counts: Vec<ValueRange<u64>>,
    pub sizes: Vec<ValueRange<u64>>,
    pub atimes: Vec<ValueRange<i64>>,
    pub crtimes: Vec<ValueRange<i64>>,
    pub ctimes: Vec<ValueRange<i64>>,
    pub mtimes: Vec<ValueRange<i64>>,
}

impl InodeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_extents(extent: ExtentFilter) -> Self {
        Self {
            extent,
            ..Self::default()
        }
    }

    pub fn with_travel_score(mut self, start: f64, end: f64) -> Self {
        self.travel_scores.push(ValueRange::new(start, end));
        self
    }

    pub fn with_extent_count(mut self, start: u64, end: u64) -> Self {
        self.extent_counts.push(ValueRange::new(start, end));
        self
    }

    pub fn with_size(mut self, start: u64, end: u64) -> Self {
        self.sizes.push(ValueRange::new(start, end));
        self
    }

    pub fn with_atime(mut self, start: i64, end: i64) -> Self {
        self.atimes.push(ValueRange::new(start, end));
        self
    }

    pub fn with_crtime(mut self, start: i64, end: i64) -> Self {
        self.crtimes.push(ValueRange::new(start, end));
        self
    }

    pub fn with_ctime(mut self, start: i64, end: i64) -> Self {
        self.ctimes.push(ValueRange::new(start, end));
        self
    }

    pub fn with_mtime(mut self, start: i64, end: i64) -> Self {
        self.mtimes.push(ValueRange::new(start, end));
        self
    }

    pub fn needs_stats(&self) -> bool {
        !self.travel_scores.is_empty() || !self.extent_counts.is_empty()
    }

    /// Checks size and timestamps. Inodes missing a value only match when
    /// that dimension is omitted.
    pub fn matches_attributes(&self, inode: &InodeRecord) -> bool {
        any_contains(&self.extent.inodes, inode.ino)
            && any_contains_opt(&self.sizes, inode.size)
            && any_contains_opt(&self.atimes, inode.times.atime)
            && any_contains_opt(&self.crtimes, inode.times.crtime)
            && any_contains_opt(&self.ctimes, inode.times.ctime)
            && any_contains_opt(&self.mtimes, inode.times.mtime)
    }

    pub fn matches_stats(&self, stats: &InodeStats) -> bool {
        any_contains(&self.travel_scores, stats.travel_score)
            && any_contains(&self.extent_counts, stats.extents)
    }
}
