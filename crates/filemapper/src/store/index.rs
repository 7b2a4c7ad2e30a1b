//! Secondary indexes rebuilt after load and at the end of every scan.

use std::collections::BTreeMap;

use fnv::FnvHashMap;

use super::schema::Tables;
use crate::types::EXTENT_TYPE_COUNT;

/// Closed intervals sorted by start with a running maximum of ends.
///
/// Every interval overlapping `[lo, hi]` starts at or before `hi`, and the
/// running maximum lets the scan skip the prefix whose ends all fall below
/// `lo`.
#[derive(Debug, Default)]
pub(crate) struct IntervalIndex {
    entries: Vec<(u64, u64, u32)>,
    max_end: Vec<u64>,
}

impl IntervalIndex {
    pub(crate) fn build(intervals: impl Iterator<Item = (u64, u64, u32)>) -> Self {
        let mut entries: Vec<(u64, u64, u32)> = intervals.collect();
        entries.sort_unstable();
        let mut running = 0u64;
        let max_end = entries
            .iter()
            .map(|(_, end, _)| {
                running = running.max(*end);
                running
            })
            .collect();
        Self { entries, max_end }
    }

    /// Ids of intervals intersecting `[lo, hi]`.
    pub(crate) fn overlapping(&self, lo: u64, hi: u64) -> impl Iterator<Item = u32> + '_ {
        let upper = self.entries.partition_point(|(start, _, _)| *start <= hi);
        let lower = self.max_end[..upper].partition_point(|end| *end < lo);
        self.entries[lower..upper]
            .iter()
            .filter(move |(_, end, _)| *end >= lo)
            .map(|(_, _, id)| *id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Default)]
pub(crate) struct StoreIndexes {
    /// Extent ids ordered by (inode, logical, physical, id).
    pub(crate) order: Vec<u32>,
    /// Position of each extent id within `order`.
    pub(crate) rank: Vec<u32>,
    /// Span of `order` holding each inode's extents.
    pub(crate) inode_spans: BTreeMap<i64, (usize, usize)>,
    pub(crate) physical: IntervalIndex,
    pub(crate) logical: IntervalIndex,
    pub(crate) paths_by_inode: FnvHashMap<i64, Vec<String>>,
    pub(crate) type_counts: [u64; EXTENT_TYPE_COUNT],
    pub(crate) max_physical_end: Option<u64>,
}

impl StoreIndexes {
    pub(crate) fn build(tables: &Tables) -> Self {
        let extents = &tables.extents;

        let mut order: Vec<u32> = (0..extents.len() as u32).collect();
        order.sort_unstable_by_key(|id| {
            let extent = &extents[*id as usize];
            (extent.ino, extent.logical, extent.physical, *id)
        });

        let mut rank = vec![0u32; extents.len()];
        let mut inode_spans = BTreeMap::new();
        let mut span_start = 0usize;
        for (position, id) in order.iter().enumerate() {
            rank[*id as usize] = position as u32;
            let ino = extents[*id as usize].ino;
            let next_ino = order.get(position + 1).map(|next| extents[*next as usize].ino);
            if next_ino != Some(ino) {
                inode_spans.insert(ino, (span_start, position + 1));
                span_start = position + 1;
            }
        }

        let physical = IntervalIndex::build(
            extents
                .iter()
                .enumerate()
                .map(|(id, extent)| (extent.physical, extent.physical_end(), id as u32)),
        );
        let logical = IntervalIndex::build(extents.iter().enumerate().filter_map(|(id, extent)| {
            Some((extent.logical?, extent.logical_end()?, id as u32))
        }));

        let mut paths_by_inode: FnvHashMap<i64, Vec<String>> = FnvHashMap::default();
        for (path, ino) in &tables.paths {
            paths_by_inode.entry(*ino).or_default().push(path.clone());
        }

        let mut type_counts = [0u64; EXTENT_TYPE_COUNT];
        for extent in extents {
            type_counts[extent.kind.index()] += 1;
        }
        let max_physical_end = extents.iter().map(|extent| extent.physical_end()).max();

        log::debug!(
            "built extent indexes ({} extents, {} inodes with extents, {} logical intervals)",
            extents.len(),
            inode_spans.len(),
            logical.len()
        );

        Self {
            order,
            rank,
            inode_spans,
            physical,
            logical,
            paths_by_inode,
            type_counts,
            max_physical_end,
        }
    }

    /// Extent ids of one inode in (logical, physical) order.
    pub(crate) fn extents_of(&self, ino: i64) -> &[u32] {
        match self.inode_spans.get(&ino) {
            Some((start, end)) => &self.order[*start..*end],
            None => &[],
        }
    }
}
