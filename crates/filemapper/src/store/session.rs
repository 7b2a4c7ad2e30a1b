//! Ingestion entry points used while a scan is running.

use super::schema::{Extent, FilesystemSummary, InodeRecord, SummaryReport};
use super::ExtentStore;
use crate::error::{FilemapError, Result};
use crate::protocol::RawExtent;
use crate::types::{ExtentFlags, ExtentType, InodeInfo, InodeType};

/// Exclusive handle on a store for the duration of one scan.
///
/// Dropping the session without calling `finish` leaves the store unfinished;
/// only what was written by `begin_scan` or `checkpoint` is persisted.
pub struct ScanSession<'s> {
    store: &'s mut ExtentStore,
    discarded: u64,
}

impl<'s> ScanSession<'s> {
    pub(super) fn new(store: &'s mut ExtentStore) -> Self {
        Self {
            store,
            discarded: 0,
        }
    }

    pub fn summary(&self) -> Option<&FilesystemSummary> {
        self.store.tables.summary.as_ref()
    }

    pub fn path_separator(&self) -> char {
        self.summary().map(|summary| summary.path_separator).unwrap_or('/')
    }

    /// Records the children of directory `parent`. Repeated names overwrite.
    pub fn insert_directory<I, N>(&mut self, parent: i64, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (N, i64)>,
        N: Into<String>,
    {
        let children = self.store.tables.directories.entry(parent).or_default();
        for (name, child) in entries {
            children.insert(name.into(), child);
        }
        Ok(())
    }

    /// Inserts or replaces the inode row and maps `path` to it.
    ///
    /// Paths are relative to the scanned root; the root itself is `""`, so a
    /// bare separator is rejected.
    pub fn insert_inode(&mut self, info: &InodeInfo, path: &str) -> Result<()> {
        let separator = self.path_separator();
        let mut chars = path.chars();
        let is_root_separator = chars.next() == Some(separator) && chars.next().is_none();
        if is_root_separator {
            return Err(FilemapError::InvalidPath(format!(
                "{path:?} is reserved; the root is the empty path"
            )));
        }
        if !path.is_empty() && !path.starts_with(separator) {
            return Err(FilemapError::InvalidPath(format!(
                "{path:?} must start with {separator:?}"
            )));
        }
        self.store
            .tables
            .inodes
            .insert(info.ino, InodeRecord::from(info));
        self.store.tables.paths.insert(path.to_string(), info.ino);
        Ok(())
    }

    /// Stores one mapped extent of `info`.
    ///
    /// Records flagged unknown or delayed-allocation describe data without a
    /// committed location and are dropped, as are empty records. Returns
    /// whether the extent was stored.
    pub fn insert_extent(
        &mut self,
        info: &InodeInfo,
        raw: &RawExtent,
        is_xattr: bool,
    ) -> Result<bool> {
        if raw.flags.intersects(ExtentFlags::UNCOMMITTED) || raw.length == 0 {
            self.discarded += 1;
            return Ok(false);
        }
        let kind = if is_xattr {
            ExtentType::Xattr
        } else {
            info.kind.primary_extent_type()
        };
        let logical = match kind {
            ExtentType::Metadata | ExtentType::FreeSpace => None,
            ExtentType::File
            | ExtentType::Directory
            | ExtentType::ExtentMap
            | ExtentType::Xattr
            | ExtentType::Symlink => Some(raw.logical),
        };
        self.push_extent(Extent {
            ino: info.ino,
            physical: raw.physical,
            logical,
            length: raw.length,
            flags: raw.flags.difference(ExtentFlags::LAST),
            kind,
        })
    }

    /// Stores a fully formed record (free-space and metadata ingestion).
    pub(crate) fn push_extent(&mut self, extent: Extent) -> Result<bool> {
        if extent.length == 0 {
            self.discarded += 1;
            return Ok(false);
        }
        let fits = |start: u64| start.checked_add(extent.length).is_some();
        if !fits(extent.physical) || !extent.logical.map_or(true, fits) {
            log::warn!(
                "dropping extent of inode {} past the end of the address space ({}+{})",
                extent.ino,
                extent.physical,
                extent.length
            );
            self.discarded += 1;
            return Ok(false);
        }
        self.store.tables.extents.push(extent);
        Ok(true)
    }

    /// Creates a synthetic inode unless one with this id already exists.
    pub(crate) fn ensure_inode(&mut self, ino: i64, kind: InodeType, path: &str) -> Result<()> {
        if self.contains_inode(ino) {
            return Ok(());
        }
        self.insert_inode(&InodeInfo::new(ino, kind), path)
    }

    pub fn contains_inode(&self, ino: i64) -> bool {
        self.store.tables.inodes.contains_key(&ino)
    }

    pub fn lookup_path(&self, path: &str) -> Option<i64> {
        self.store.tables.paths.get(path).copied()
    }

    pub fn extent_count(&self) -> usize {
        self.store.tables.extents.len()
    }

    pub fn inode_count(&self) -> usize {
        self.store.tables.inodes.len()
    }

    /// Records dropped as uncommitted, empty or out of range so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Persists the tables ingested so far; the store stays unfinished.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.store.persist()
    }

    /// Builds the indexes, corrects the device size if extents reach past
    /// it, marks the scan finished and persists.
    pub fn finish(self) -> Result<SummaryReport> {
        let max_end = self
            .store
            .tables
            .extents
            .iter()
            .map(|extent| extent.physical_end())
            .max();
        let discarded = self.discarded;
        let store = self.store;
        {
            let summary = store
                .tables
                .summary
                .as_mut()
                .ok_or(FilemapError::EmptyDatabase)?;
            if let Some(max_end) = max_end {
                if max_end >= summary.total_bytes {
                    log::debug!(
                        "extents reach byte {}; raising total size from {}",
                        max_end,
                        summary.total_bytes
                    );
                    summary.total_bytes = max_end.saturating_add(1);
                }
            }
            summary.finished = true;
        }
        store.rebuild_indexes();
        store.persist()?;

        let report = store.query_summary()?;
        log::debug!(
            "finished scan of {} ({} inodes, {} extents, {} discarded)",
            report.summary.path,
            store.tables.inodes.len(),
            report.extents,
            discarded
        );
        Ok(report)
    }

    pub(crate) fn store(&self) -> &ExtentStore {
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::*;

    #[test]
    fn bare_separator_is_not_a_path() {
        let mut store = empty_store();
        let mut session = store.begin_scan_with_summary(summary(1 << 20)).expect("begin");
        let error = session
            .insert_inode(&InodeInfo::new(2, InodeType::Directory), "/")
            .expect_err("reserved");
        assert!(matches!(error, FilemapError::InvalidPath(_)));
        assert!(session
            .insert_inode(&InodeInfo::new(2, InodeType::Directory), "")
            .is_ok());
        assert!(session
            .insert_inode(&InodeInfo::new(3, InodeType::File), "relative")
            .is_err());
    }

    #[test]
    fn uncommitted_extents_are_discarded() {
        let mut store = empty_store();
        let mut session = store.begin_scan_with_summary(summary(1 << 20)).expect("begin");
        let file = InodeInfo::new(5, InodeType::File);
        session.insert_inode(&file, "/f").expect("inode");
        let delalloc = RawExtent::new(0, 0, 4 * KIB, ExtentFlags::DELALLOC);
        let unknown = RawExtent::new(4 * KIB, 0, 4 * KIB, ExtentFlags::UNKNOWN);
        let empty = RawExtent::new(8 * KIB, 0, 0, ExtentFlags::empty());
        assert!(!session.insert_extent(&file, &delalloc, false).expect("insert"));
        assert!(!session.insert_extent(&file, &unknown, false).expect("insert"));
        assert!(!session.insert_extent(&file, &empty, false).expect("insert"));
        assert!(session
            .insert_extent(&file, &raw(8 * KIB, 64 * KIB, 4 * KIB), false)
            .expect("insert"));
        assert_eq!(session.discarded(), 3);
        assert_eq!(session.extent_count(), 1);
    }

    #[test]
    fn extents_past_the_address_space_are_discarded() {
        let mut store = empty_store();
        let mut session = store.begin_scan_with_summary(summary(1 << 20)).expect("begin");
        let file = InodeInfo::new(5, InodeType::File);
        session.insert_inode(&file, "/f").expect("inode");
        assert!(!session
            .insert_extent(&file, &raw(0, u64::MAX - 100, 4 * KIB), false)
            .expect("insert"));
        assert!(!session
            .insert_extent(&file, &raw(u64::MAX - 100, 0, 4 * KIB), false)
            .expect("insert"));
        let meta = Extent {
            ino: -2,
            physical: u64::MAX,
            logical: None,
            length: 2,
            flags: ExtentFlags::empty(),
            kind: ExtentType::Metadata,
        };
        assert!(!session.push_extent(meta).expect("push"));
        assert!(session
            .insert_extent(&file, &raw(0, 64 * KIB, 4 * KIB), false)
            .expect("insert"));
        assert_eq!(session.discarded(), 3);

        let report = session.finish().expect("finish");
        assert_eq!(report.summary.total_bytes, 1 << 20);
        assert_eq!(store.extents_of(5).count(), 1);
    }

    #[test]
    fn reinserting_an_inode_replaces_it() {
        let mut store = empty_store();
        let mut session = store.begin_scan_with_summary(summary(1 << 20)).expect("begin");
        session
            .insert_inode(&InodeInfo::new(5, InodeType::File), "/f")
            .expect("inode");
        session
            .insert_inode(&InodeInfo::new(5, InodeType::File).with_size(10), "/hardlink")
            .expect("inode");
        assert_eq!(session.inode_count(), 1);
        session.finish().expect("finish");
        assert_eq!(store.inode(5).and_then(|inode| inode.size), Some(10));
        assert_eq!(store.paths_of(5).len(), 2);
    }

    #[test]
    fn finish_raises_total_size_to_cover_extents() {
        let mut store = empty_store();
        let mut session = store.begin_scan_with_summary(summary(64 * KIB)).expect("begin");
        let file = InodeInfo::new(5, InodeType::File);
        session.insert_inode(&file, "/f").expect("inode");
        session
            .insert_extent(&file, &raw(0, 60 * KIB, 8 * KIB), false)
            .expect("extent");
        let report = session.finish().expect("finish");
        assert_eq!(report.summary.total_bytes, 68 * KIB);
    }

    #[test]
    fn last_flag_is_stripped_and_metadata_has_no_logical_offset() {
        let mut store = empty_store();
        let mut session = store.begin_scan_with_summary(summary(1 << 20)).expect("begin");
        let file = InodeInfo::new(5, InodeType::File);
        let meta = InodeInfo::new(-2, InodeType::Metadata);
        session.insert_inode(&file, "/f").expect("inode");
        session.insert_inode(&meta, "/$metadata/metadata").expect("inode");
        session
            .insert_extent(&file, &RawExtent::new(0, 0, 4 * KIB, ExtentFlags::LAST), false)
            .expect("extent");
        session
            .insert_extent(&meta, &raw(0, 8 * KIB, 4 * KIB), false)
            .expect("extent");
        session.finish().expect("finish");
        let file_extent = store.extents_of(5).next().expect("file extent");
        assert!(file_extent.flags.is_empty());
        let meta_extent = store.extents_of(-2).next().expect("meta extent");
        assert_eq!(meta_extent.logical, None);
        assert_eq!(meta_extent.kind, ExtentType::Metadata);
    }

    #[test]
    fn checkpoint_persists_unfinished_tables() {
        let mut store = empty_store();
        let mut session = store.begin_scan_with_summary(summary(1 << 20)).expect("begin");
        session
            .insert_inode(&InodeInfo::new(2, InodeType::Directory), "")
            .expect("root");
        session.checkpoint().expect("checkpoint");
        drop(session);
        assert!(store.is_stale());
        assert_eq!(store.lookup_path(""), Some(2));
    }
}
