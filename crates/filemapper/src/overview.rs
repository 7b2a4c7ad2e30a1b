//! Device overview: per-type extent counts binned into N display cells.
//!
//! Offset `o` of a device of `total` bytes falls in cell
//! `floor(o * N / total)`; an extent increments every cell its physical range
//! touches, so extents crossing a cell boundary are counted once per cell.
//!
//! Cells for each resolution are cached in the store's calculated state.
//! Counts cover every type; visibility is applied when rendering.

use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::error::{FilemapError, Result};
use crate::query::ValueRange;
use crate::store::{Extent, ExtentStore};
use crate::types::{ExtentType, ExtentTypeSet, EXTENT_TYPE_COUNT};

/// Rendering of a cell with nothing visible in it.
pub const EMPTY_CELL: char = '.';

/// Extents per batch when an overview is computed in one call.
const DEFAULT_OVERVIEW_BATCH: usize = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OverviewCell {
    pub counts: [u64; EXTENT_TYPE_COUNT],
}

impl OverviewCell {
    #[inline]
    pub fn count(&self, kind: ExtentType) -> u64 {
        self.counts[kind.index()]
    }

    pub fn total(&self, visible: ExtentTypeSet) -> u64 {
        visible.types().map(|kind| self.count(kind)).sum()
    }

    /// The visible type with the largest count; ties go to the type listed
    /// first in `ExtentType::ALL`. The flag is true when that type is the
    /// only visible one present.
    pub fn dominant(&self, visible: ExtentTypeSet) -> Option<(ExtentType, bool)> {
        let total = self.total(visible);
        if total == 0 {
            return None;
        }
        let mut best: Option<(ExtentType, u64)> = None;
        for kind in visible.types() {
            let count = self.count(kind);
            if count > best.map_or(0, |(_, best)| best) {
                best = Some((kind, count));
            }
        }
        best.map(|(kind, count)| (kind, count == total))
    }

    pub fn symbol(&self, visible: ExtentTypeSet) -> char {
        match self.dominant(visible) {
            None => EMPTY_CELL,
            Some((kind, true)) => kind.symbol(),
            Some((kind, false)) => kind.symbol().to_ascii_lowercase(),
        }
    }

    fn add(&mut self, kind: ExtentType) {
        self.counts[kind.index()] += 1;
    }
}

/// Cell of `offset` at resolution `cells` over `total_bytes`.
#[inline]
fn cell_of(offset: u64, cells: u64, total_bytes: u64) -> u64 {
    let cell = (u128::from(offset) * u128::from(cells) / u128::from(total_bytes)) as u64;
    cell.min(cells - 1)
}

/// First byte of `cell`, i.e. `ceil(cell * total / cells)`.
#[inline]
fn cell_start(cell: u64, cells: u64, total_bytes: u64) -> u64 {
    let scaled = u128::from(cell) * u128::from(total_bytes);
    scaled.div_ceil(u128::from(cells)) as u64
}

fn check_resolution(cells: u64, total_bytes: u64) -> Result<()> {
    if cells == 0 || cells > total_bytes {
        return Err(FilemapError::InvalidRange(format!(
            "overview resolution {cells} must be between 1 and {total_bytes}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Incremental computation
// ---------------------------------------------------------------------------

/// An overview computed a batch of extents at a time.
///
/// Dropping the scan before `finish` discards the partial cells.
pub struct OverviewScan<'s> {
    store: &'s ExtentStore,
    total_bytes: u64,
    cells: Vec<OverviewCell>,
    next: usize,
}

impl<'s> OverviewScan<'s> {
    pub fn new(store: &'s ExtentStore, cells: u64) -> Result<Self> {
        let total_bytes = store.ensure_ready()?.total_bytes;
        check_resolution(cells, total_bytes)?;
        let len = usize::try_from(cells).map_err(|_| {
            FilemapError::InvalidRange(format!("overview resolution {cells} is too large"))
        })?;
        Ok(Self {
            store,
            total_bytes,
            cells: vec![OverviewCell::default(); len],
            next: 0,
        })
    }

    pub fn resolution(&self) -> u64 {
        self.cells.len() as u64
    }

    /// Bins up to `batch` more extents. Returns true once every extent has
    /// been binned.
    pub fn step(&mut self, batch: usize) -> bool {
        let store = self.store;
        let extents = &store.tables().extents;
        let end = self.next.saturating_add(batch.max(1)).min(extents.len());
        let resolution = self.resolution();
        for extent in &extents[self.next..end] {
            if extent.physical >= self.total_bytes {
                continue;
            }
            let first = cell_of(extent.physical, resolution, self.total_bytes);
            let last = cell_of(extent.physical_end(), resolution, self.total_bytes);
            for cell in &mut self.cells[first as usize..=last as usize] {
                cell.add(extent.kind);
            }
        }
        self.next = end;
        self.is_done()
    }

    pub fn is_done(&self) -> bool {
        self.next >= self.store.tables().extents.len()
    }

    /// (extents binned, extents total).
    pub fn progress(&self) -> (usize, usize) {
        (self.next, self.store.tables().extents.len())
    }

    /// Bins whatever is left, caches the cells and returns them.
    pub fn finish(mut self) -> Vec<OverviewCell> {
        while !self.step(DEFAULT_OVERVIEW_BATCH) {}
        let resolution = self.resolution();
        self.store
            .calculated()
            .write()
            .overviews
            .insert(resolution, self.cells.clone());
        self.store.mark_dirty();
        log::debug!(
            "computed overview of {} at {} cells",
            self.store.fs_path(),
            resolution
        );
        self.cells
    }
}

impl ExtentStore {
    /// Overview cells at `cells` resolution, from the cache unless `force`.
    pub fn overview(&self, cells: u64, force: bool) -> Result<Vec<OverviewCell>> {
        self.overview_with_cancel(cells, force, &CancellationToken::noop())?
            .ok_or_else(|| FilemapError::InvalidInput("overview cancelled".to_string()))
    }

    /// Like `overview`, returning `None` if `token` is cancelled midway.
    pub fn overview_with_cancel(
        &self,
        cells: u64,
        force: bool,
        token: &CancellationToken,
    ) -> Result<Option<Vec<OverviewCell>>> {
        let total_bytes = self.ensure_ready()?.total_bytes;
        check_resolution(cells, total_bytes)?;
        if !force {
            if let Some(cached) = self.calculated().read().overviews.get(&cells) {
                log::debug!("overview cache hit at {} cells", cells);
                return Ok(Some(cached.clone()));
            }
        }
        let mut scan = OverviewScan::new(self, cells)?;
        loop {
            if token.is_cancelled().is_none() {
                log::debug!(
                    "overview at {} cells cancelled after {} extents",
                    cells,
                    scan.progress().0
                );
                return Ok(None);
            }
            if scan.step(DEFAULT_OVERVIEW_BATCH) {
                break;
            }
        }
        Ok(Some(scan.finish()))
    }

    pub fn overview_scan(&self, cells: u64) -> Result<OverviewScan<'_>> {
        OverviewScan::new(self, cells)
    }

    /// Drops every cached overview resolution.
    pub fn clear_overview_cache(&self) -> Result<()> {
        self.ensure_writable()?;
        self.calculated().write().overviews.clear();
        self.mark_dirty();
        self.flush()
    }
}

// ---------------------------------------------------------------------------
// Display state
// ---------------------------------------------------------------------------

/// Current display resolution plus the byte ranges to highlight.
///
/// Highlights are kept as byte ranges so a new resolution re-maps them.
#[derive(Debug, Clone)]
pub struct OverviewAggregator {
    resolution: u64,
    total_bytes: u64,
    highlights: Vec<ValueRange<u64>>,
}

impl OverviewAggregator {
    pub fn new(resolution: u64, total_bytes: u64) -> Result<Self> {
        check_resolution(resolution, total_bytes)?;
        Ok(Self {
            resolution,
            total_bytes,
            highlights: Vec::new(),
        })
    }

    pub fn for_store(store: &ExtentStore, resolution: u64) -> Result<Self> {
        Self::new(resolution, store.ensure_ready()?.total_bytes)
    }

    pub fn resolution(&self) -> u64 {
        self.resolution
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn set_resolution(&mut self, resolution: u64) -> Result<()> {
        check_resolution(resolution, self.total_bytes)?;
        self.resolution = resolution;
        Ok(())
    }

    /// Cells at the current resolution, cached in `store`.
    pub fn cells(&self, store: &ExtentStore, force: bool) -> Result<Vec<OverviewCell>> {
        store.overview(self.resolution, force)
    }

    pub fn cell_of(&self, offset: u64) -> u64 {
        cell_of(offset, self.resolution, self.total_bytes)
    }

    /// Bytes covered by `cell` at the current resolution.
    pub fn cell_range(&self, cell: u64) -> Result<ValueRange<u64>> {
        if cell >= self.resolution {
            return Err(FilemapError::InvalidRange(format!(
                "cell {cell} is beyond the overview ({} cells)",
                self.resolution
            )));
        }
        let start = cell_start(cell, self.resolution, self.total_bytes);
        let end = cell_start(cell + 1, self.resolution, self.total_bytes) - 1;
        Ok(ValueRange::new(start, end))
    }

    /// Converts cell ranges into byte ranges, merging neighbours.
    pub fn cells_to_ranges(
        &self,
        cells: impl IntoIterator<Item = ValueRange<u64>>,
    ) -> Result<Vec<ValueRange<u64>>> {
        let mut ranges = Vec::new();
        for cells in cells {
            let first = self.cell_range(cells.start)?;
            let last = self.cell_range(cells.end)?;
            ranges.push(ValueRange::new(first.start, last.end));
        }
        ranges.sort_unstable_by_key(|range| range.start);
        let mut merged: Vec<ValueRange<u64>> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.start <= last.end.saturating_add(1) => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        Ok(merged)
    }

    /// One character per cell.
    pub fn render(&self, cells: &[OverviewCell], visible: ExtentTypeSet) -> String {
        cells.iter().map(|cell| cell.symbol(visible)).collect()
    }

    /// Replaces the highlighted byte ranges and returns the cell mask.
    pub fn highlight_ranges(
        &mut self,
        ranges: impl IntoIterator<Item = ValueRange<u64>>,
    ) -> Vec<bool> {
        self.highlights = ranges.into_iter().collect();
        self.mask()
    }

    /// Highlights the physical ranges of `extents`.
    pub fn highlight_extents<'a>(
        &mut self,
        extents: impl IntoIterator<Item = &'a Extent>,
    ) -> Vec<bool> {
        self.highlight_ranges(
            extents
                .into_iter()
                .map(|extent| ValueRange::new(extent.physical, extent.physical_end())),
        )
    }

    pub fn clear_highlights(&mut self) {
        self.highlights.clear();
    }

    pub fn highlights(&self) -> &[ValueRange<u64>] {
        &self.highlights
    }

    /// Highlight mask recomputed at the current resolution.
    pub fn mask(&self) -> Vec<bool> {
        let len = self.resolution as usize;
        let mut edges = vec![0i64; len + 1];
        for range in &self.highlights {
            if range.start >= self.total_bytes {
                continue;
            }
            let first = self.cell_of(range.start) as usize;
            let last = self.cell_of(range.end.min(self.total_bytes - 1)) as usize;
            edges[first] += 1;
            edges[last + 1] -= 1;
        }
        let mut depth = 0i64;
        edges[..len]
            .iter()
            .map(|edge| {
                depth += edge;
                depth > 0
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::*;
    use crate::types::{InodeInfo, InodeType};

    fn cell(files: u64, dirs: u64) -> OverviewCell {
        let mut cell = OverviewCell::default();
        cell.counts[ExtentType::File.index()] = files;
        cell.counts[ExtentType::Directory.index()] = dirs;
        cell
    }

    #[test]
    fn dominant_type_rendering() {
        let all = ExtentTypeSet::all();
        assert_eq!(OverviewCell::default().symbol(all), EMPTY_CELL);
        assert_eq!(cell(3, 0).symbol(all), 'F');
        assert_eq!(cell(3, 1).symbol(all), 'f');
        let without_files = all.difference(ExtentTypeSet::FILE);
        assert_eq!(cell(3, 1).symbol(without_files), 'D');
        assert_eq!(cell(3, 0).symbol(without_files), EMPTY_CELL);
    }

    #[test]
    fn ties_follow_type_priority() {
        assert_eq!(cell(2, 2).symbol(ExtentTypeSet::all()), 'f');
        let mut metadata_and_xattr = OverviewCell::default();
        metadata_and_xattr.counts[ExtentType::Xattr.index()] = 1;
        metadata_and_xattr.counts[ExtentType::Metadata.index()] = 1;
        assert_eq!(metadata_and_xattr.symbol(ExtentTypeSet::all()), 'm');
    }

    #[test]
    fn counts_are_conserved_per_type() {
        let store = populated_store();
        let cells = store.overview(4, false).expect("overview");
        assert_eq!(cells.len(), 4);
        let sum = |kind: ExtentType| cells.iter().map(|cell| cell.count(kind)).sum::<u64>();
        assert_eq!(sum(ExtentType::File), 3);
        assert_eq!(sum(ExtentType::Directory), 2);
        assert_eq!(sum(ExtentType::Xattr), 1);
        assert_eq!(
            OverviewAggregator::for_store(&store, 4)
                .expect("aggregator")
                .render(&cells, ExtentTypeSet::all()),
            "ff.."
        );
    }

    #[test]
    fn boundary_extents_count_once_per_cell() {
        let mut store = empty_store();
        let mut session = store.begin_scan_with_summary(summary(1024 * KIB)).expect("begin");
        let file = InodeInfo::new(5, InodeType::File);
        session.insert_inode(&file, "/f").expect("inode");
        session
            .insert_extent(&file, &raw(0, 250 * KIB, 20 * KIB), false)
            .expect("extent");
        session.finish().expect("finish");
        let cells = store.overview(4, false).expect("overview");
        let files: Vec<u64> = cells.iter().map(|cell| cell.count(ExtentType::File)).collect();
        assert_eq!(files, vec![1, 1, 0, 0]);
    }

    #[test]
    fn resolution_is_cached_until_forced() {
        let store = populated_store();
        store.overview(8, false).expect("overview");
        assert!(store.calculated().read().overviews.contains_key(&8));
        store
            .calculated()
            .write()
            .overviews
            .insert(8, vec![OverviewCell::default(); 8]);
        assert_eq!(
            store.overview(8, false).expect("cached"),
            vec![OverviewCell::default(); 8]
        );
        assert_ne!(
            store.overview(8, true).expect("forced"),
            vec![OverviewCell::default(); 8]
        );
        store.clear_overview_cache().expect("clear");
        assert!(store.calculated().read().overviews.is_empty());
    }

    #[test]
    fn resolution_must_fit_the_device() {
        let store = populated_store();
        assert!(matches!(store.overview(0, false), Err(FilemapError::InvalidRange(_))));
        assert!(matches!(
            store.overview(2 * 1024 * KIB, false),
            Err(FilemapError::InvalidRange(_))
        ));
        assert!(OverviewAggregator::new(1024 * KIB, 1024 * KIB).is_ok());
    }

    #[test]
    fn incremental_scan_matches_one_shot() {
        let store = populated_store();
        let mut scan = store.overview_scan(16).expect("scan");
        assert!(!scan.step(2));
        assert_eq!(scan.progress(), (2, 6));
        let stepped = scan.finish();
        assert_eq!(stepped, store.overview(16, true).expect("overview"));
    }

    #[test]
    fn cancelled_overview_is_not_cached() {
        let store = populated_store();
        let token = CancellationToken::new();
        token.cancel();
        assert!(store
            .overview_with_cancel(4, false, &token)
            .expect("overview")
            .is_none());
        assert!(store.calculated().read().overviews.is_empty());
    }

    #[test]
    fn cell_ranges_invert_cell_of() {
        let aggregator = OverviewAggregator::new(3, 1000).expect("aggregator");
        assert_eq!(aggregator.cell_range(0).expect("cell"), ValueRange::new(0, 333));
        assert_eq!(aggregator.cell_range(1).expect("cell"), ValueRange::new(334, 666));
        assert_eq!(aggregator.cell_range(2).expect("cell"), ValueRange::new(667, 999));
        for offset in [0, 333, 334, 666, 667, 999] {
            let cell = aggregator.cell_of(offset);
            assert!(aggregator.cell_range(cell).expect("cell").contains(offset));
        }
        assert!(matches!(aggregator.cell_range(3), Err(FilemapError::InvalidRange(_))));
        assert_eq!(
            aggregator
                .cells_to_ranges([ValueRange::single(0), ValueRange::single(1)])
                .expect("ranges"),
            vec![ValueRange::new(0, 666)]
        );
    }

    #[test]
    fn highlights_follow_resolution_changes() {
        let mut aggregator = OverviewAggregator::new(4, 1024 * KIB).expect("aggregator");
        let mask = aggregator.highlight_ranges([ValueRange::new(300 * KIB, 316 * KIB - 1)]);
        assert_eq!(mask, vec![false, true, false, false]);

        aggregator.set_resolution(8).expect("zoom");
        assert_eq!(
            aggregator.mask(),
            vec![false, false, true, false, false, false, false, false]
        );
        assert!(aggregator.set_resolution(0).is_err());

        let store = populated_store();
        let mut aggregator = OverviewAggregator::for_store(&store, 4).expect("aggregator");
        let extents: Vec<Extent> = store.extents_of(5).copied().collect();
        assert_eq!(
            aggregator.highlight_extents(&extents),
            vec![true, false, false, false]
        );
        aggregator.clear_highlights();
        assert_eq!(aggregator.mask(), vec![false; 4]);
    }
}
