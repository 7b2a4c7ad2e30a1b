//! Query planning and paged evaluation.
//!
//! A query first picks the cheapest candidate source (physical or logical
//! interval index, resolved path set, inode spans, or the full ordering),
//! then checks every candidate against all dimensions one page at a time.
//! Candidates are visited in (inode, logical, physical) order so results are
//! stable for a fixed store.

use std::collections::{BTreeSet, VecDeque};
use std::ops::Bound;

use fnv::FnvHashSet;

use super::context::QueryContext;
use super::filter::{ExtentFilter, InodeFilter, PathFilter, PathPattern};
use crate::error::{FilemapError, Result};
use crate::store::{Extent, ExtentStore, FilesystemSummary, InodeStats};
use crate::types::{ExtentTypeSet, InodeTimes, InodeType};

/// One matching extent and a path of its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtentRow {
    pub extent: Extent,
    /// First path of the owner matching the path dimension, or its first path.
    pub path: Option<String>,
}

/// One matching inode with its statistics and every path naming it.
#[derive(Debug, Clone, PartialEq)]
pub struct InodeRow {
    pub ino: i64,
    pub kind: InodeType,
    pub paths: Vec<String>,
    pub stats: InodeStats,
    pub size: Option<u64>,
    pub times: InodeTimes,
}

// ---------------------------------------------------------------------------
// Candidate selection
// ---------------------------------------------------------------------------

enum Candidates {
    /// Positions `[next, end)` of the store's extent ordering.
    Span { next: usize, end: usize },
    /// Extent ids sorted by their position in the ordering.
    Listed { ids: Vec<u32>, next: usize },
}

impl Candidates {
    fn none() -> Self {
        Self::Listed {
            ids: Vec::new(),
            next: 0,
        }
    }

    fn next_id(&mut self, order: &[u32]) -> Option<u32> {
        match self {
            Self::Span { next, end } => {
                if *next >= *end {
                    return None;
                }
                let id = order.get(*next).copied();
                *next += 1;
                id
            }
            Self::Listed { ids, next } => {
                let id = ids.get(*next).copied();
                *next += 1;
                id
            }
        }
    }
}

fn sort_by_rank(ids: &mut Vec<u32>, rank: &[u32]) {
    ids.sort_unstable_by_key(|id| rank[*id as usize]);
    ids.dedup();
}

/// Inodes named by any path matching the path dimension.
fn resolve_path_inodes(store: &ExtentStore, paths: &PathFilter) -> FnvHashSet<i64> {
    let table = &store.tables().paths;
    let mut inodes = FnvHashSet::default();
    for pattern in paths.patterns() {
        match pattern {
            PathPattern::Exact(path) => {
                if let Some(ino) = table.get(path) {
                    inodes.insert(*ino);
                }
            }
            PathPattern::Glob { prefix, .. } => {
                let matching = table
                    .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
                    .take_while(|(path, _)| path.starts_with(prefix.as_str()))
                    .filter(|(path, _)| pattern.matches(path));
                inodes.extend(matching.map(|(_, ino)| *ino));
            }
        }
    }
    inodes
}

fn plan_extents(
    store: &ExtentStore,
    filter: &ExtentFilter,
    path_inodes: Option<&FnvHashSet<i64>>,
) -> Candidates {
    let indexes = store.indexes();
    let mut ids: Vec<u32> = if !filter.physical.is_empty() {
        filter
            .physical
            .iter()
            .flat_map(|range| indexes.physical.overlapping(range.start, range.end))
            .collect()
    } else if !filter.logical.is_empty() {
        filter
            .logical
            .iter()
            .flat_map(|range| indexes.logical.overlapping(range.start, range.end))
            .collect()
    } else if let Some(path_inodes) = path_inodes {
        path_inodes
            .iter()
            .flat_map(|ino| indexes.extents_of(*ino).iter().copied())
            .collect()
    } else if !filter.inodes.is_empty() {
        filter
            .inodes
            .iter()
            .flat_map(|range| indexes.inode_spans.range(range.start..=range.end))
            .flat_map(|(_, (start, end))| indexes.order[*start..*end].iter().copied())
            .collect()
    } else {
        return Candidates::Span {
            next: 0,
            end: indexes.order.len(),
        };
    };
    sort_by_rank(&mut ids, &indexes.rank);
    Candidates::Listed { ids, next: 0 }
}

fn check_physical_ranges(summary: &FilesystemSummary, filter: &ExtentFilter) -> Result<()> {
    match filter
        .physical
        .iter()
        .find(|range| range.start >= summary.total_bytes)
    {
        Some(range) => Err(FilemapError::InvalidRange(format!(
            "physical offset {} is beyond the end of the device ({} bytes)",
            range.start, summary.total_bytes
        ))),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Extent queries
// ---------------------------------------------------------------------------

/// Lazily evaluated extent query results.
///
/// Dropping the iterator abandons the query.
pub struct ExtentRows<'s> {
    store: &'s ExtentStore,
    filter: ExtentFilter,
    visible: ExtentTypeSet,
    page_size: usize,
    candidates: Candidates,
    path_inodes: Option<FnvHashSet<i64>>,
    buffer: VecDeque<ExtentRow>,
}

impl<'s> ExtentRows<'s> {
    fn new(store: &'s ExtentStore, context: &QueryContext, filter: &ExtentFilter) -> Self {
        let path_inodes = filter
            .paths
            .is_active()
            .then(|| resolve_path_inodes(store, &filter.paths));
        let candidates = plan_extents(store, filter, path_inodes.as_ref());
        Self {
            store,
            filter: filter.clone(),
            visible: context.visible_types(),
            page_size: context.page_size(),
            candidates,
            path_inodes,
            buffer: VecDeque::new(),
        }
    }

    fn empty(store: &'s ExtentStore, context: &QueryContext) -> Self {
        Self {
            store,
            filter: ExtentFilter::default(),
            visible: context.visible_types(),
            page_size: context.page_size(),
            candidates: Candidates::none(),
            path_inodes: None,
            buffer: VecDeque::new(),
        }
    }

    fn accepts(&self, extent: &Extent) -> bool {
        self.visible.has(extent.kind)
            && self.filter.matches_extent(extent)
            && self
                .path_inodes
                .as_ref()
                .map_or(true, |inodes| inodes.contains(&extent.ino))
    }

    fn row_path(&self, ino: i64) -> Option<String> {
        let paths = self.store.paths_of(ino);
        paths
            .iter()
            .find(|path| self.filter.paths.matches(path))
            .or_else(|| paths.first())
            .cloned()
    }

    fn fill(&mut self) {
        let store = self.store;
        let tables = store.tables();
        let order = &store.indexes().order;
        let mut produced = 0;
        while produced < self.page_size {
            let Some(id) = self.candidates.next_id(order) else {
                break;
            };
            let extent = &tables.extents[id as usize];
            if !self.accepts(extent) {
                continue;
            }
            let row = ExtentRow {
                extent: *extent,
                path: self.row_path(extent.ino),
            };
            self.buffer.push_back(row);
            produced += 1;
        }
    }

    /// Evaluates and returns the next page of rows, or `None` when done.
    pub fn next_page(&mut self) -> Option<Vec<ExtentRow>> {
        if self.buffer.is_empty() {
            self.fill();
        }
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.drain(..).collect())
        }
    }
}

impl Iterator for ExtentRows<'_> {
    type Item = ExtentRow;

    fn next(&mut self) -> Option<ExtentRow> {
        if self.buffer.is_empty() {
            self.fill();
        }
        self.buffer.pop_front()
    }
}

// ---------------------------------------------------------------------------
// Inode queries
// ---------------------------------------------------------------------------

/// Lazily evaluated inode query results, in inode order.
pub struct InodeRows<'s> {
    store: &'s ExtentStore,
    filter: InodeFilter,
    page_size: usize,
    candidates: Vec<i64>,
    next: usize,
    buffer: VecDeque<InodeRow>,
}

impl<'s> InodeRows<'s> {
    fn new(store: &'s ExtentStore, context: &QueryContext, filter: &InodeFilter) -> Self {
        let extent_filter = &filter.extent;
        let candidates: Vec<i64> = if extent_filter.restricts_extents() || context.restricts_types() {
            // Owners of any matching extent.
            let owners: BTreeSet<i64> = ExtentRows::new(store, context, extent_filter)
                .candidates_matching()
                .collect();
            owners.into_iter().collect()
        } else if extent_filter.paths.is_active() {
            let owners: BTreeSet<i64> = resolve_path_inodes(store, &extent_filter.paths)
                .into_iter()
                .collect();
            owners.into_iter().collect()
        } else if !extent_filter.inodes.is_empty() {
            let owners: BTreeSet<i64> = extent_filter
                .inodes
                .iter()
                .flat_map(|range| store.tables().inodes.range(range.start..=range.end))
                .map(|(ino, _)| *ino)
                .collect();
            owners.into_iter().collect()
        } else {
            store.tables().inodes.keys().copied().collect()
        };
        Self {
            store,
            filter: filter.clone(),
            page_size: context.page_size(),
            candidates,
            next: 0,
            buffer: VecDeque::new(),
        }
    }

    fn empty(store: &'s ExtentStore, context: &QueryContext) -> Self {
        Self {
            store,
            filter: InodeFilter::default(),
            page_size: context.page_size(),
            candidates: Vec::new(),
            next: 0,
            buffer: VecDeque::new(),
        }
    }

    fn evaluate(&self, ino: i64) -> Option<InodeRow> {
        let inode = self.store.inode(ino)?;
        if !self.filter.matches_attributes(inode) {
            return None;
        }
        let stats = self.store.stats_for(inode);
        if !self.filter.matches_stats(&stats) {
            return None;
        }
        Some(InodeRow {
            ino,
            kind: inode.kind,
            paths: self.store.paths_of(ino).to_vec(),
            stats,
            size: inode.size,
            times: inode.times,
        })
    }

    fn fill(&mut self) {
        let mut produced = 0;
        while produced < self.page_size {
            let Some(ino) = self.candidates.get(self.next).copied() else {
                break;
            };
            self.next += 1;
            if let Some(row) = self.evaluate(ino) {
                self.buffer.push_back(row);
                produced += 1;
            }
        }
    }

    /// Evaluates and returns the next page of rows, or `None` when done.
    pub fn next_page(&mut self) -> Option<Vec<InodeRow>> {
        if self.buffer.is_empty() {
            self.fill();
        }
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.drain(..).collect())
        }
    }
}

impl Iterator for InodeRows<'_> {
    type Item = InodeRow;

    fn next(&mut self) -> Option<InodeRow> {
        if self.buffer.is_empty() {
            self.fill();
        }
        self.buffer.pop_front()
    }
}

impl<'s> ExtentRows<'s> {
    /// Owners of matching extents, skipping path resolution for rows.
    fn candidates_matching(mut self) -> impl Iterator<Item = i64> + 's {
        let store = self.store;
        let order = &store.indexes().order;
        let extents = &store.tables().extents;
        std::iter::from_fn(move || loop {
            let id = self.candidates.next_id(order)?;
            let extent = &extents[id as usize];
            if self.accepts(extent) {
                return Some(extent.ino);
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Store entry points
// ---------------------------------------------------------------------------

impl ExtentStore {
    /// Extents matching `filter` and the visible types, ordered by
    /// (inode, logical offset).
    pub fn query_extents(
        &self,
        context: &QueryContext,
        filter: &ExtentFilter,
    ) -> Result<ExtentRows<'_>> {
        if context.visible_types().is_empty() {
            return Ok(ExtentRows::empty(self, context));
        }
        let summary = self.ensure_ready()?;
        check_physical_ranges(summary, filter)?;
        Ok(ExtentRows::new(self, context, filter))
    }

    /// Inodes owning an extent that matches the extent dimensions and whose
    /// own attributes match the inode dimensions, ordered by inode number.
    pub fn query_inodes(&self, context: &QueryContext, filter: &InodeFilter) -> Result<InodeRows<'_>> {
        if context.visible_types().is_empty() {
            return Ok(InodeRows::empty(self, context));
        }
        let summary = self.ensure_ready()?;
        check_physical_ranges(summary, &filter.extent)?;
        Ok(InodeRows::new(self, context, filter))
    }
}
