//! The extent store: filesystem summary, inode, path, directory and extent
//! tables, plus the lazily computed statistics and overview caches.
//!
//! A store is filled by exactly one scan (`begin_scan` .. `ScanSession::finish`)
//! and is read-only afterwards, except for calculated values which can be
//! dropped and rebuilt at any time. Starting a new scan replaces everything.

pub mod backend;
mod index;
pub mod schema;
mod session;
pub mod statfs;

pub use backend::{Backend, SnapshotFile, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
pub use schema::{
    CalculatedState, DirEntry, Extent, FilesystemSummary, InodeRecord, InodeStats, SummaryReport,
    Tables,
};
pub use session::ScanSession;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use self::index::StoreIndexes;
use crate::config::StoreOptions;
use crate::error::{FilemapError, Result};

pub struct ExtentStore {
    backend: Mutex<Box<dyn Backend>>,
    fs_path: String,
    tables: Tables,
    indexes: StoreIndexes,
    calculated: RwLock<CalculatedState>,
    dirty: AtomicBool,
}

impl ExtentStore {
    /// Opens (or prepares to create) the snapshot at `db_path` tracking the
    /// filesystem mounted at `fs_path`.
    pub fn open(
        db_path: impl Into<PathBuf>,
        fs_path: impl AsRef<Path>,
        options: &StoreOptions,
    ) -> Result<Self> {
        let backend = SnapshotFile::open(db_path, options)?;
        Self::with_backend(
            Box::new(backend),
            fs_path.as_ref().to_string_lossy().into_owned(),
        )
    }

    /// Loads whatever `backend` holds and rebuilds the secondary indexes.
    pub fn with_backend(mut backend: Box<dyn Backend>, fs_path: impl Into<String>) -> Result<Self> {
        let (tables, calculated) = backend.load()?.unwrap_or_default();
        let indexes = StoreIndexes::build(&tables);
        Ok(Self {
            backend: Mutex::new(backend),
            fs_path: fs_path.into(),
            tables,
            indexes,
            calculated: RwLock::new(calculated),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn fs_path(&self) -> &str {
        &self.fs_path
    }

    pub fn location(&self) -> PathBuf {
        self.backend.lock().location().to_path_buf()
    }

    pub fn is_writable(&self) -> bool {
        self.backend.lock().is_writable()
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(FilemapError::NotWritable(self.location()))
        }
    }

    /// True when no finished scan of the configured path is stored.
    pub fn is_stale(&self) -> bool {
        match &self.tables.summary {
            Some(summary) => !summary.finished || summary.path != self.fs_path,
            None => true,
        }
    }

    /// The summary row of a finished scan, or the reason there is none.
    pub(crate) fn ensure_ready(&self) -> Result<&FilesystemSummary> {
        match &self.tables.summary {
            None => Err(FilemapError::EmptyDatabase),
            Some(summary) if !summary.finished => Err(FilemapError::IncompleteDatabase),
            Some(summary) => Ok(summary),
        }
    }

    /// The raw summary row, finished or not.
    pub fn summary(&self) -> Option<&FilesystemSummary> {
        self.tables.summary.as_ref()
    }

    pub fn query_summary(&self) -> Result<SummaryReport> {
        let summary = self.ensure_ready()?;
        Ok(SummaryReport {
            summary: summary.clone(),
            extents: self.tables.extents.len() as u64,
            inodes_with_extents: self.indexes.inode_spans.len() as u64,
        })
    }

    // -----------------------------------------------------------------------
    // Scanning
    // -----------------------------------------------------------------------

    /// Starts a rescan of the configured path using live `statvfs` numbers.
    pub fn begin_scan(&mut self) -> Result<ScanSession<'_>> {
        self.ensure_writable()?;
        let summary = statfs::live_summary(Path::new(&self.fs_path))?;
        self.begin_scan_with_summary(summary)
    }

    /// Starts a rescan with a caller-supplied provisional summary.
    ///
    /// All existing tables and calculated values are dropped and the empty,
    /// unfinished store is persisted before ingestion begins.
    pub fn begin_scan_with_summary(
        &mut self,
        mut summary: FilesystemSummary,
    ) -> Result<ScanSession<'_>> {
        self.ensure_writable()?;
        summary.path = self.fs_path.clone();
        summary.finished = false;

        self.tables = Tables {
            summary: Some(summary),
            ..Tables::default()
        };
        self.indexes = StoreIndexes::default();
        *self.calculated.write() = CalculatedState::default();
        self.persist()?;

        log::debug!("began scan of {}", self.fs_path);
        Ok(ScanSession::new(self))
    }

    // -----------------------------------------------------------------------
    // Row access
    // -----------------------------------------------------------------------

    pub fn inode(&self, ino: i64) -> Option<&InodeRecord> {
        self.tables.inodes.get(&ino)
    }

    pub fn inodes(&self) -> impl Iterator<Item = &InodeRecord> {
        self.tables.inodes.values()
    }

    pub fn lookup_path(&self, path: &str) -> Option<i64> {
        self.tables.paths.get(path).copied()
    }

    /// Every path naming `ino`, sorted.
    pub fn paths_of(&self, ino: i64) -> &[String] {
        self.indexes
            .paths_by_inode
            .get(&ino)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Children of directory `ino` in name order.
    pub fn list_directory(&self, ino: i64) -> impl Iterator<Item = DirEntry<'_>> {
        self.tables
            .directories
            .get(&ino)
            .into_iter()
            .flat_map(move |children| {
                children.iter().map(move |(name, child)| DirEntry {
                    parent: ino,
                    name,
                    child: *child,
                })
            })
    }

    /// Extents owned by `ino`, in logical order.
    pub fn extents_of(&self, ino: i64) -> impl Iterator<Item = &Extent> {
        self.indexes
            .extents_of(ino)
            .iter()
            .map(move |id| &self.tables.extents[*id as usize])
    }

    pub fn extent_count(&self) -> usize {
        self.tables.extents.len()
    }

    pub(crate) fn tables(&self) -> &Tables {
        &self.tables
    }

    pub(crate) fn indexes(&self) -> &StoreIndexes {
        &self.indexes
    }

    pub(crate) fn calculated(&self) -> &RwLock<CalculatedState> {
        &self.calculated
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Writes cached statistics and overviews back if anything changed.
    /// Read-only stores keep their caches in memory only.
    pub fn flush(&self) -> Result<()> {
        if !self.dirty.load(Ordering::Relaxed) || !self.is_writable() {
            return Ok(());
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let calculated = self.calculated.read();
        self.backend.lock().save(&self.tables, &calculated)?;
        self.dirty.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn rebuild_indexes(&mut self) {
        self.indexes = StoreIndexes::build(&self.tables);
    }
}

impl Drop for ExtentStore {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            log::warn!(
                "extent store flush failed for {}: {}",
                self.location().display(),
                error
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Test fixtures shared by the query, overview and stats tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod fixtures {
    use super::backend::MemoryBackend;
    use super::*;
    use crate::protocol::RawExtent;
    use crate::types::{ExtentFlags, InodeInfo, InodeType};

    pub(crate) const KIB: u64 = 1024;

    pub(crate) fn empty_store() -> ExtentStore {
        ExtentStore::with_backend(Box::new(MemoryBackend::new()), "/mnt").expect("store")
    }

    pub(crate) fn summary(total_bytes: u64) -> FilesystemSummary {
        let mut summary = FilesystemSummary::new("/mnt");
        summary.block_size = 4 * KIB;
        summary.frag_size = 4 * KIB;
        summary.total_bytes = total_bytes;
        summary.free_bytes = total_bytes / 2;
        summary.fs_type = "ext2/ext3/ext4".to_string();
        summary
    }

    pub(crate) fn raw(logical: u64, physical: u64, length: u64) -> RawExtent {
        RawExtent::new(logical, physical, length, ExtentFlags::empty())
    }

    /// A 1 MiB device with a root directory, two files and a symlink.
    ///
    /// | ino | path          | extents (logical -> physical, length)        |
    /// |-----|---------------|----------------------------------------------|
    /// | 2   | ""            | dir 0 -> 0, 4K                               |
    /// | 5   | /a            | 0 -> 100K, 4K; 4K -> 200K, 4K                |
    /// | 6   | /dir          | dir 0 -> 8K, 4K                              |
    /// | 7   | /dir/b.log    | 0 -> 300K, 16K (shared); xattr 0 -> 400K, 4K |
    /// | 8   | /dir/link     | none                                         |
    pub(crate) fn populated_store() -> ExtentStore {
        let mut store = empty_store();
        let mut session = store
            .begin_scan_with_summary(summary(1024 * KIB))
            .expect("begin");

        let root = InodeInfo::new(2, InodeType::Directory);
        let a = InodeInfo::new(5, InodeType::File).with_size(8 * KIB);
        let dir = InodeInfo::new(6, InodeType::Directory);
        let b = InodeInfo::new(7, InodeType::File).with_size(16 * KIB);
        let link = InodeInfo::new(8, InodeType::Symlink);

        session.insert_inode(&root, "").expect("root");
        session.insert_extent(&root, &raw(0, 0, 4 * KIB), false).expect("extent");
        session.insert_inode(&a, "/a").expect("a");
        session.insert_extent(&a, &raw(0, 100 * KIB, 4 * KIB), false).expect("extent");
        session.insert_extent(&a, &raw(4 * KIB, 200 * KIB, 4 * KIB), false).expect("extent");
        session.insert_inode(&dir, "/dir").expect("dir");
        session.insert_extent(&dir, &raw(0, 8 * KIB, 4 * KIB), false).expect("extent");
        session
            .insert_directory(2, [("a", 5), ("dir", 6)])
            .expect("dentries");
        session.insert_inode(&b, "/dir/b.log").expect("b");
        session
            .insert_extent(
                &b,
                &RawExtent::new(0, 300 * KIB, 16 * KIB, ExtentFlags::SHARED),
                false,
            )
            .expect("extent");
        session.insert_extent(&b, &raw(0, 400 * KIB, 4 * KIB), true).expect("xattr");
        session.insert_inode(&link, "/dir/link").expect("link");
        session
            .insert_directory(6, [("b.log", 7), ("link", 8)])
            .expect("dentries");
        session.finish().expect("finish");
        store
    }
}
