//! Namespace walk that feeds a scan session.
//!
//! The walk is an iterative depth-first traversal of one device:
//! - Every object is inserted before its extents are mapped
//! - A directory's entries are recorded once all its children were stat'ed
//! - Hard-linked inodes get every path but are mapped only once
//! - Mount points below the root are skipped
//!
//! Failures on a single object are logged and counted; the walk goes on.

use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use fnv::FnvHashSet;

use super::freespace::{self, FreeSpaceReport};
use super::mapper::ExtentMapper;
use crate::cancel::CancellationToken;
use crate::config::ScanOptions;
use crate::error::{FilemapError, Result};
use crate::store::{ExtentStore, ScanSession, SummaryReport};
use crate::types::{InodeInfo, InodeType};

/// Live counters a caller can poll from another thread.
#[derive(Debug, Default)]
pub struct ScanProgress {
    pub scanned_files: AtomicUsize,
    pub scanned_dirs: AtomicUsize,
    pub extents: AtomicU64,
    pub errors: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub scanned_files: usize,
    pub scanned_dirs: usize,
    pub extents: u64,
    pub errors: usize,
}

impl ScanProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            scanned_files: self.scanned_files.load(Ordering::Relaxed),
            scanned_dirs: self.scanned_dirs.load(Ordering::Relaxed),
            extents: self.extents.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanReport {
    pub summary: SummaryReport,
    pub inodes: usize,
    /// Objects whose stat or extent mapping failed.
    pub errors: usize,
    /// Extent records dropped as uncommitted or empty.
    pub discarded: u64,
    /// Regular files were mapped with FIBMAP after FIEMAP proved unsupported.
    pub fibmap_fallback: bool,
    pub free_space: Option<FreeSpaceReport>,
}

/// A stat'ed object waiting to be visited.
struct Pending {
    path: PathBuf,
    relative: String,
    info: InodeInfo,
}

struct WalkState {
    mapper: ExtentMapper,
    mapped: FnvHashSet<i64>,
    visited: u64,
    errors: usize,
}

/// Walk configuration; `run` performs one full scan into a store.
pub struct ScanWalk<'a> {
    options: &'a ScanOptions,
    cancel: CancellationToken,
    progress: Option<&'a ScanProgress>,
}

impl<'a> ScanWalk<'a> {
    pub fn new(options: &'a ScanOptions) -> Self {
        Self {
            options,
            cancel: CancellationToken::noop(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: &'a ScanProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Rescans the store's filesystem. Returns `None` if cancelled; the store
    /// is then left unfinished with whatever the last checkpoint wrote.
    pub fn run(&self, store: &mut ExtentStore) -> Result<Option<ScanReport>> {
        let root = PathBuf::from(store.fs_path());
        let root_metadata = fs::symlink_metadata(&root)?;
        let device = root_metadata.dev();
        let root_info = InodeInfo::from_metadata(&root_metadata).ok_or_else(|| {
            FilemapError::InvalidPath(format!("{} cannot be scanned", root.display()))
        })?;

        let mut session = store.begin_scan()?;
        let separator = session.path_separator();
        let mut state = WalkState {
            mapper: ExtentMapper::new(self.options),
            mapped: FnvHashSet::default(),
            visited: 0,
            errors: 0,
        };

        let mut stack = vec![Pending {
            path: root.clone(),
            relative: String::new(),
            info: root_info,
        }];
        while let Some(pending) = stack.pop() {
            if self.cancel.is_cancelled().is_none() {
                log::debug!("scan of {} cancelled", root.display());
                return Ok(None);
            }
            let info = pending.info;
            session.insert_inode(&info, &pending.relative)?;
            self.map_inode(&mut session, &mut state, &pending.path, &info);

            if info.kind == InodeType::Directory {
                self.bump(|progress| &progress.scanned_dirs);
                let children = self.read_children(&pending, device, separator, &mut state);
                session.insert_directory(
                    info.ino,
                    children
                        .iter()
                        .map(|(name, child)| (name.clone(), child.info.ino)),
                )?;
                stack.extend(children.into_iter().rev().map(|(_, child)| child));
            } else {
                self.bump(|progress| &progress.scanned_files);
            }

            state.visited += 1;
            if let Some(interval) = self.options.checkpoint_interval {
                if state.visited % interval == 0 {
                    session.checkpoint()?;
                }
            }
        }

        let free_space = if self.options.map_free_space {
            match freespace::map_free_space(&mut session, &root, device, self.options, &self.cancel)
            {
                Ok(Some(report)) => Some(report),
                Ok(None) => return Ok(None),
                Err(error) if error.is_unsupported() => {
                    log::debug!("no free space map for {}: {}", root.display(), error);
                    None
                }
                Err(error) => {
                    log::warn!("free space map of {} failed: {}", root.display(), error);
                    state.errors += 1;
                    None
                }
            }
        } else {
            None
        };

        let inodes = session.inode_count();
        let discarded = session.discarded();
        let summary = session.finish()?;
        log::debug!(
            "scanned {} ({} inodes, {} errors)",
            root.display(),
            inodes,
            state.errors
        );
        Ok(Some(ScanReport {
            summary,
            inodes,
            errors: state.errors,
            discarded,
            fibmap_fallback: state.mapper.fiemap_unsupported(),
            free_space,
        }))
    }

    /// Maps the extents of `info` unless another link already did.
    fn map_inode(
        &self,
        session: &mut ScanSession<'_>,
        state: &mut WalkState,
        path: &Path,
        info: &InodeInfo,
    ) {
        if !state.mapped.insert(info.ino) {
            return;
        }
        // Opening a symlink would map its target.
        if info.kind == InodeType::Symlink {
            return;
        }
        let file = match File::open(path) {
            Ok(file) => file,
            Err(error) => {
                log::warn!("skipping extents of {}: {}", path.display(), error);
                self.fail(state);
                return;
            }
        };
        let result = state.mapper.map(&file, info, |extent, is_xattr| {
            session.insert_extent(info, extent, is_xattr).map(|_| ())
        });
        match result {
            Ok(outcome) => {
                if let Some(progress) = self.progress {
                    progress
                        .extents
                        .fetch_add(outcome.extents + outcome.xattr_extents, Ordering::Relaxed);
                }
            }
            Err(error) => {
                log::warn!("failed to map {}: {}", path.display(), error);
                self.fail(state);
            }
        }
    }

    /// Stats the entries of a directory, sorted by name. Entries on other
    /// devices and kinds without extents are left out.
    fn read_children(
        &self,
        parent: &Pending,
        device: u64,
        separator: char,
        state: &mut WalkState,
    ) -> Vec<(String, Pending)> {
        let entries = match fs::read_dir(&parent.path) {
            Ok(entries) => entries,
            Err(error) => {
                log::warn!("cannot list {}: {}", parent.path.display(), error);
                self.fail(state);
                return Vec::new();
            }
        };

        let mut children = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    log::warn!("cannot read entry of {}: {}", parent.path.display(), error);
                    self.fail(state);
                    continue;
                }
            };
            let path = entry.path();
            let metadata = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                Err(error) => {
                    log::warn!("cannot stat {}: {}", path.display(), error);
                    self.fail(state);
                    continue;
                }
            };
            if metadata.dev() != device {
                continue;
            }
            let Some(info) = InodeInfo::from_metadata(&metadata) else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let relative = format!("{}{}{}", parent.relative, separator, name);
            children.push((
                name,
                Pending {
                    path,
                    relative,
                    info,
                },
            ));
        }
        children.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        children
    }

    fn fail(&self, state: &mut WalkState) {
        state.errors += 1;
        self.bump(|progress| &progress.errors);
    }

    fn bump(&self, counter: impl Fn(&ScanProgress) -> &AtomicUsize) {
        if let Some(progress) = self.progress {
            counter(progress).fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Rescans the filesystem a store tracks with default walk settings.
pub fn scan_filesystem(
    store: &mut ExtentStore,
    options: &ScanOptions,
    cancel: &CancellationToken,
) -> Result<Option<ScanReport>> {
    ScanWalk::new(options).with_cancel(cancel.clone()).run(store)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::error::FilemapError;
    use crate::store::backend::MemoryBackend;

    fn store_for(dir: &Path) -> ExtentStore {
        ExtentStore::with_backend(Box::new(MemoryBackend::new()), dir.to_string_lossy())
            .expect("store")
    }

    fn options() -> ScanOptions {
        ScanOptions::default()
            .with_free_space(false)
            .with_checkpoint_interval(2)
    }

    fn names(store: &ExtentStore, ino: i64) -> Vec<String> {
        store
            .list_directory(ino)
            .map(|entry| entry.name.to_string())
            .collect()
    }

    #[test]
    fn walk_records_the_namespace() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join("a.txt"), vec![7u8; 64 * 1024]).expect("write");
        fs::create_dir(temp.path().join("sub")).expect("mkdir");
        fs::write(temp.path().join("sub/b.txt"), b"hello").expect("write");
        fs::hard_link(temp.path().join("a.txt"), temp.path().join("sub/c.txt")).expect("link");
        std::os::unix::fs::symlink("a.txt", temp.path().join("link")).expect("symlink");

        let mut store = store_for(temp.path());
        let progress = ScanProgress::new();
        let options = options();
        let report = ScanWalk::new(&options)
            .with_progress(&progress)
            .run(&mut store)
            .expect("scan")
            .expect("not cancelled");

        assert!(!store.is_stale());
        assert_eq!(report.inodes, 5);
        assert!(report.free_space.is_none());

        let root = store.lookup_path("").expect("root");
        assert_eq!(names(&store, root), vec!["a.txt", "link", "sub"]);
        let sub = store.lookup_path("/sub").expect("sub");
        assert_eq!(names(&store, sub), vec!["b.txt", "c.txt"]);
        for entry in store.list_directory(root).chain(store.list_directory(sub)) {
            let ino = store.inode(entry.child).map(|inode| inode.ino);
            assert_eq!(ino, Some(entry.child), "entry {}", entry.name);
            let meta_ino = fs::symlink_metadata(temp.path().join(if entry.parent == root {
                entry.name.to_string()
            } else {
                format!("sub/{}", entry.name)
            }))
            .expect("stat")
            .ino();
            assert_eq!(i64::try_from(meta_ino).ok(), Some(entry.child));
        }

        let a = store.lookup_path("/a.txt").expect("a");
        assert_eq!(store.lookup_path("/sub/c.txt"), Some(a));
        assert_eq!(store.paths_of(a), ["/a.txt".to_string(), "/sub/c.txt".to_string()]);
        let physical: Vec<u64> = store.extents_of(a).map(|extent| extent.physical).collect();
        let unique: BTreeSet<u64> = physical.iter().copied().collect();
        assert_eq!(physical.len(), unique.len());

        let link = store.lookup_path("/link").expect("link");
        assert_eq!(store.inode(link).map(|inode| inode.kind), Some(InodeType::Symlink));
        assert_eq!(store.extents_of(link).count(), 0);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.scanned_dirs, 2);
        assert_eq!(snapshot.scanned_files, 4);
        assert_eq!(snapshot.errors, report.errors);
    }

    #[test]
    fn cancelled_walk_leaves_store_unfinished() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join("a.txt"), b"data").expect("write");
        let mut store = store_for(temp.path());
        let token = CancellationToken::new();
        token.cancel();
        let report = scan_filesystem(&mut store, &options(), &token).expect("scan");
        assert!(report.is_none());
        assert!(store.is_stale());
        assert!(matches!(
            store.query_summary(),
            Err(FilemapError::IncompleteDatabase)
        ));
    }

    #[test]
    fn missing_root_is_an_io_error() {
        let temp = TempDir::new().expect("tempdir");
        let mut store = store_for(&temp.path().join("missing"));
        let error = scan_filesystem(&mut store, &options(), &CancellationToken::noop())
            .expect_err("missing");
        assert!(matches!(error, FilemapError::Io(_)));
        assert!(store.summary().is_none());
    }
}
