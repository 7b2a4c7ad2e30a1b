//! Per-inode fragmentation statistics.
//!
//! The travel score walks an inode's primary extents in logical order and
//! compares how far a reader moves on disk with how far it moves through the
//! file. Each extent contributes its own length to both sums; each step
//! between consecutive extents adds the absolute gap between the previous end
//! and the next start. A perfectly sequential layout scores 1.0.

use crate::error::{FilemapError, Result};
use crate::store::{Extent, ExtentStore, InodeRecord, InodeStats};

/// Computes statistics from extents already ordered by logical offset.
pub fn travel_stats<'a>(extents: impl IntoIterator<Item = &'a Extent>) -> InodeStats {
    let mut count = 0u64;
    let mut physical = 0f64;
    let mut logical = 0f64;
    let mut previous: Option<&Extent> = None;

    for extent in extents {
        count += 1;
        physical += extent.length as f64;
        logical += extent.length as f64;
        if let Some(previous) = previous {
            let next_physical = previous.physical_end().saturating_add(1);
            physical += extent.physical.abs_diff(next_physical) as f64;
            if let (Some(start), Some(end)) = (extent.logical, previous.logical_end()) {
                logical += start.abs_diff(end.saturating_add(1)) as f64;
            }
        }
        previous = Some(extent);
    }

    let travel_score = if logical > 0.0 { physical / logical } else { 0.0 };
    InodeStats {
        extents: count,
        travel_score,
    }
}

impl ExtentStore {
    /// Extent count and travel score of `ino`, computed once and cached.
    pub fn inode_stats(&self, ino: i64) -> Result<InodeStats> {
        self.ensure_ready()?;
        let inode = self
            .inode(ino)
            .ok_or_else(|| FilemapError::InvalidInput(format!("no inode {ino} in the store")))?;
        Ok(self.stats_for(inode))
    }

    pub(crate) fn stats_for(&self, inode: &InodeRecord) -> InodeStats {
        if let Some(stats) = self.calculated().read().inode_stats.get(&inode.ino) {
            return *stats;
        }
        let primary = inode.kind.primary_extent_type();
        let stats = travel_stats(self.extents_of(inode.ino).filter(|extent| extent.kind == primary));
        self.calculated().write().inode_stats.insert(inode.ino, stats);
        self.mark_dirty();
        stats
    }

    /// Drops every cached statistic and overview without touching extents.
    pub fn clear_calculated_values(&self) -> Result<()> {
        self.ensure_writable()?;
        {
            let mut calculated = self.calculated().write();
            calculated.inode_stats.clear();
            calculated.overviews.clear();
        }
        self.mark_dirty();
        log::debug!("cleared calculated values for {}", self.fs_path());
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreOptions;
    use crate::store::fixtures::*;
    use crate::types::{ExtentFlags, ExtentType, InodeInfo, InodeType};

    fn file_extent(logical: u64, physical: u64, length: u64) -> Extent {
        Extent {
            ino: 5,
            physical,
            logical: Some(logical),
            length,
            flags: ExtentFlags::empty(),
            kind: ExtentType::File,
        }
    }

    #[test]
    fn sequential_file_scores_one() {
        let extents = [
            file_extent(0, 100 * KIB, 4 * KIB),
            file_extent(4 * KIB, 104 * KIB, 4 * KIB),
        ];
        let stats = travel_stats(&extents);
        assert_eq!(stats.extents, 2);
        assert_eq!(stats.travel_score, 1.0);
    }

    #[test]
    fn gaps_raise_the_score() {
        // 8K of data with a 96K seek between the two extents.
        let extents = [
            file_extent(0, 100 * KIB, 4 * KIB),
            file_extent(4 * KIB, 200 * KIB, 4 * KIB),
        ];
        let stats = travel_stats(&extents);
        assert_eq!(stats.travel_score, (8.0 + 96.0) / 8.0);

        let backwards = [
            file_extent(0, 200 * KIB, 4 * KIB),
            file_extent(4 * KIB, 100 * KIB, 4 * KIB),
        ];
        assert!(travel_stats(&backwards).travel_score > 1.0);
    }

    #[test]
    fn no_extents_scores_zero() {
        let stats = travel_stats(std::iter::empty());
        assert_eq!(stats, InodeStats::default());
    }

    #[test]
    fn stats_are_cached_and_stable() {
        let store = populated_store();
        let first = store.inode_stats(5).expect("stats");
        let second = store.inode_stats(5).expect("stats");
        assert_eq!(first, second);
        assert_eq!(first.extents, 2);
        assert!(store.calculated().read().inode_stats.contains_key(&5));

        // The xattr extent of /dir/b.log is not primary.
        assert_eq!(store.inode_stats(7).expect("stats").extents, 1);
        assert_eq!(store.inode_stats(8).expect("stats").travel_score, 0.0);
        assert!(matches!(store.inode_stats(99), Err(FilemapError::InvalidInput(_))));
    }

    #[test]
    fn clearing_resets_stats_only() {
        let store = populated_store();
        store.inode_stats(5).expect("stats");
        store.clear_calculated_values().expect("clear");
        assert!(store.calculated().read().inode_stats.is_empty());
        assert_eq!(store.extent_count(), 6);
        assert_eq!(store.lookup_path("/a"), Some(5));
    }

    #[test]
    fn read_only_store_caches_in_memory_but_cannot_clear() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let db = dir.path().join("mnt.fmdb");
        {
            let mut writer = ExtentStore::open(&db, "/mnt", &StoreOptions::default()).expect("open");
            let mut session = writer.begin_scan_with_summary(summary(1 << 20)).expect("begin");
            let file = InodeInfo::new(5, InodeType::File);
            session.insert_inode(&file, "/f").expect("inode");
            session.insert_extent(&file, &raw(0, 0, 4 * KIB), false).expect("extent");
            session.finish().expect("finish");
        }

        {
            let reader = ExtentStore::open(&db, "/mnt", &StoreOptions::read_only()).expect("open");
            assert_eq!(reader.inode_stats(5).expect("stats").extents, 1);
            assert!(reader.calculated().read().inode_stats.contains_key(&5));
            assert!(matches!(
                reader.clear_calculated_values(),
                Err(FilemapError::NotWritable(_))
            ));
        }

        let reopened = ExtentStore::open(&db, "/mnt", &StoreOptions::read_only()).expect("open");
        assert!(reopened.calculated().read().inode_stats.is_empty());
    }
}
