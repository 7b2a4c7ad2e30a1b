//! Per-inode extent mapping with FIEMAP and a FIBMAP fallback.
//!
//! FIEMAP is tried first. When a regular file reports it as unsupported the
//! mapper switches every later regular file straight to FIBMAP for the rest of
//! the scan. Other inode kinds fall back for that inode only. Extended
//! attributes can only be mapped through FIEMAP and are skipped otherwise.

use std::fs::File;

use crate::config::ScanOptions;
use crate::error::Result;
use crate::protocol::fiemap::{FIEMAP_FLAG_SYNC, FIEMAP_FLAG_XATTR};
use crate::protocol::{
    coalesce, BlockMapSource, FibmapScan, FiemapPager, FiemapSource, FileBlockMap, FileFiemap,
    RawExtent,
};
use crate::types::{InodeInfo, InodeType};

/// Something both mapping interfaces can be pointed at.
pub trait MapTarget {
    type Fiemap<'a>: FiemapSource
    where
        Self: 'a;
    type Blocks<'a>: BlockMapSource
    where
        Self: 'a;

    fn fiemap_source(&self) -> Self::Fiemap<'_>;
    fn block_source(&self) -> Self::Blocks<'_>;
}

impl MapTarget for File {
    type Fiemap<'a> = FileFiemap<'a>;
    type Blocks<'a> = FileBlockMap<'a>;

    fn fiemap_source(&self) -> FileFiemap<'_> {
        FileFiemap::new(self)
    }

    fn block_source(&self) -> FileBlockMap<'_> {
        FileBlockMap::new(self)
    }
}

/// What one `map` call produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapOutcome {
    pub extents: u64,
    pub xattr_extents: u64,
    pub used_fibmap: bool,
}

pub struct ExtentMapper {
    fiemap_batch: u32,
    max_bmap_run_blocks: u64,
    force_fibmap: bool,
    request_flags: u32,
    fiemap_unsupported: bool,
}

impl ExtentMapper {
    pub fn new(options: &ScanOptions) -> Self {
        Self {
            fiemap_batch: options.fiemap_batch,
            max_bmap_run_blocks: options.max_bmap_run_blocks,
            force_fibmap: options.force_fibmap,
            request_flags: if options.sync_before_map {
                FIEMAP_FLAG_SYNC
            } else {
                0
            },
            fiemap_unsupported: false,
        }
    }

    /// True once a regular file found FIEMAP unsupported.
    pub fn fiemap_unsupported(&self) -> bool {
        self.fiemap_unsupported
    }

    /// Maps `target` and hands every record to `emit` with its xattr flag.
    ///
    /// Any error other than an unsupported interface aborts this inode only;
    /// records already emitted stay emitted.
    pub fn map<T, F>(&mut self, target: &T, info: &InodeInfo, mut emit: F) -> Result<MapOutcome>
    where
        T: MapTarget + ?Sized,
        F: FnMut(&RawExtent, bool) -> Result<()>,
    {
        let mut outcome = MapOutcome::default();
        let size = info.size.unwrap_or(0);

        if self.force_fibmap || (self.fiemap_unsupported && info.kind == InodeType::File) {
            self.map_blocks(target, size, &mut emit, &mut outcome)?;
            return Ok(outcome);
        }

        let mut pager = FiemapPager::new(target.fiemap_source(), self.fiemap_batch)
            .with_flags(self.request_flags);
        match pager.prime() {
            Ok(()) => {
                for extent in coalesce(pager) {
                    emit(&extent?, false)?;
                    outcome.extents += 1;
                }
            }
            Err(error) if error.is_unsupported() => {
                if info.kind == InodeType::File && !self.fiemap_unsupported {
                    log::info!("{}; mapping regular files with fibmap from now on", error);
                    self.fiemap_unsupported = true;
                }
                self.map_blocks(target, size, &mut emit, &mut outcome)?;
                return Ok(outcome);
            }
            Err(error) => return Err(error),
        }

        let mut xattrs = FiemapPager::new(target.fiemap_source(), self.fiemap_batch)
            .with_flags(self.request_flags | FIEMAP_FLAG_XATTR);
        match xattrs.prime() {
            Ok(()) => {
                for extent in coalesce(xattrs) {
                    emit(&extent?, true)?;
                    outcome.xattr_extents += 1;
                }
            }
            Err(error) if error.is_unsupported() => {
                log::debug!("no xattr map for inode {}: {}", info.ino, error);
            }
            Err(error) => return Err(error),
        }
        Ok(outcome)
    }

    fn map_blocks<T, F>(
        &self,
        target: &T,
        size: u64,
        emit: &mut F,
        outcome: &mut MapOutcome,
    ) -> Result<()>
    where
        T: MapTarget + ?Sized,
        F: FnMut(&RawExtent, bool) -> Result<()>,
    {
        outcome.used_fibmap = true;
        let scan = FibmapScan::new(target.block_source(), size, self.max_bmap_run_blocks)?;
        for extent in scan {
            emit(&extent?, false)?;
            outcome.extents += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::error::FilemapError;
    use crate::protocol::FiemapBuffer;
    use crate::types::ExtentFlags;

    const KIB: u64 = 1024;

    /// A file whose FIEMAP and FIBMAP answers are canned.
    #[derive(Default)]
    struct ScriptedTarget {
        data: Vec<RawExtent>,
        xattrs: Vec<RawExtent>,
        blocks: Vec<u64>,
        fiemap_errno: Option<i32>,
        xattr_errno: Option<i32>,
        fiemap_calls: Cell<usize>,
        block_calls: Cell<usize>,
    }

    struct ScriptedFiemap<'a>(&'a ScriptedTarget);

    impl FiemapSource for ScriptedFiemap<'_> {
        fn fiemap(&mut self, buffer: &mut FiemapBuffer) -> Result<()> {
            let target = self.0;
            target.fiemap_calls.set(target.fiemap_calls.get() + 1);
            let xattr = buffer.request_flags() & FIEMAP_FLAG_XATTR != 0;
            let (extents, errno) = if xattr {
                (&target.xattrs, target.xattr_errno)
            } else {
                (&target.data, target.fiemap_errno)
            };
            if let Some(errno) = errno {
                return Err(FilemapError::from_ioctl(
                    std::io::Error::from_raw_os_error(errno),
                    "FIEMAP",
                ));
            }
            let start = buffer.request_start();
            let page: Vec<(usize, RawExtent)> = extents
                .iter()
                .copied()
                .enumerate()
                .filter(|(_, extent)| extent.logical >= start)
                .take(buffer.capacity() as usize)
                .collect();
            for (slot, (index, mut extent)) in page.iter().copied().enumerate() {
                if index + 1 == extents.len() {
                    extent.flags |= ExtentFlags::LAST;
                }
                buffer.set_extent(slot as u32, &extent);
            }
            buffer.set_mapped_extents(page.len() as u32);
            Ok(())
        }
    }

    struct ScriptedBlocks<'a>(&'a ScriptedTarget);

    impl BlockMapSource for ScriptedBlocks<'_> {
        fn block_size(&mut self) -> Result<u64> {
            Ok(4 * KIB)
        }

        fn map_block(&mut self, block: u64) -> Result<u64> {
            let target = self.0;
            target.block_calls.set(target.block_calls.get() + 1);
            Ok(target.blocks.get(block as usize).copied().unwrap_or(0))
        }
    }

    impl MapTarget for ScriptedTarget {
        type Fiemap<'a> = ScriptedFiemap<'a>;
        type Blocks<'a> = ScriptedBlocks<'a>;

        fn fiemap_source(&self) -> ScriptedFiemap<'_> {
            ScriptedFiemap(self)
        }

        fn block_source(&self) -> ScriptedBlocks<'_> {
            ScriptedBlocks(self)
        }
    }

    fn ext(logical: u64, physical: u64, length: u64) -> RawExtent {
        RawExtent::new(logical, physical, length, ExtentFlags::empty())
    }

    fn file(size: u64) -> InodeInfo {
        InodeInfo::new(12, InodeType::File).with_size(size)
    }

    fn collect<T: MapTarget>(
        mapper: &mut ExtentMapper,
        target: &T,
        info: &InodeInfo,
    ) -> Result<(MapOutcome, Vec<(RawExtent, bool)>)> {
        let mut records = Vec::new();
        let outcome = mapper.map(target, info, |extent, xattr| {
            records.push((*extent, xattr));
            Ok(())
        })?;
        Ok((outcome, records))
    }

    #[test]
    fn fiemap_records_are_coalesced_then_xattrs_follow() {
        let target = ScriptedTarget {
            data: vec![ext(0, 100 * KIB, 4 * KIB), ext(4 * KIB, 104 * KIB, 4 * KIB)],
            xattrs: vec![ext(0, 400 * KIB, 4 * KIB)],
            ..ScriptedTarget::default()
        };
        let mut mapper = ExtentMapper::new(&ScanOptions::default());
        let (outcome, records) = collect(&mut mapper, &target, &file(8 * KIB)).expect("map");
        assert_eq!(
            outcome,
            MapOutcome {
                extents: 1,
                xattr_extents: 1,
                used_fibmap: false
            }
        );
        assert_eq!(
            records,
            vec![
                (
                    RawExtent::new(0, 100 * KIB, 8 * KIB, ExtentFlags::MERGED),
                    false
                ),
                (ext(0, 400 * KIB, 4 * KIB), true),
            ]
        );
    }

    #[test]
    fn unsupported_fiemap_is_remembered_for_regular_files() {
        let target = ScriptedTarget {
            blocks: vec![25, 26],
            fiemap_errno: Some(libc::EOPNOTSUPP),
            ..ScriptedTarget::default()
        };
        let mut mapper = ExtentMapper::new(&ScanOptions::default());
        let (outcome, records) = collect(&mut mapper, &target, &file(8 * KIB)).expect("map");
        assert!(outcome.used_fibmap);
        assert!(mapper.fiemap_unsupported());
        assert_eq!(records.len(), 1);
        assert_eq!(target.fiemap_calls.get(), 1);

        collect(&mut mapper, &target, &file(8 * KIB)).expect("map");
        assert_eq!(target.fiemap_calls.get(), 1);
        assert_eq!(target.block_calls.get(), 4);
    }

    #[test]
    fn directories_fall_back_without_remembering() {
        let target = ScriptedTarget {
            blocks: vec![3],
            fiemap_errno: Some(libc::ENOTTY),
            ..ScriptedTarget::default()
        };
        let mut mapper = ExtentMapper::new(&ScanOptions::default());
        let dir = InodeInfo::new(2, InodeType::Directory).with_size(4 * KIB);
        let (outcome, _) = collect(&mut mapper, &target, &dir).expect("map");
        assert!(outcome.used_fibmap);
        assert!(!mapper.fiemap_unsupported());
    }

    #[test]
    fn forced_fibmap_never_asks_fiemap() {
        let target = ScriptedTarget {
            data: vec![ext(0, 0, 4 * KIB)],
            xattrs: vec![ext(0, 400 * KIB, 4 * KIB)],
            blocks: vec![7],
            ..ScriptedTarget::default()
        };
        let mut mapper = ExtentMapper::new(&ScanOptions::default().with_force_fibmap(true));
        let (outcome, records) = collect(&mut mapper, &target, &file(4 * KIB)).expect("map");
        assert_eq!(target.fiemap_calls.get(), 0);
        assert_eq!(outcome.xattr_extents, 0);
        assert_eq!(
            records,
            vec![(
                RawExtent::new(0, 28 * KIB, 4 * KIB, ExtentFlags::MERGED),
                false
            )]
        );
    }

    #[test]
    fn unsupported_xattr_map_is_skipped() {
        let target = ScriptedTarget {
            data: vec![ext(0, 0, 4 * KIB)],
            xattr_errno: Some(libc::EOPNOTSUPP),
            ..ScriptedTarget::default()
        };
        let mut mapper = ExtentMapper::new(&ScanOptions::default());
        let (outcome, _) = collect(&mut mapper, &target, &file(4 * KIB)).expect("map");
        assert_eq!(outcome.extents, 1);
        assert_eq!(outcome.xattr_extents, 0);
        assert!(!mapper.fiemap_unsupported());
    }

    #[test]
    fn io_errors_abort_the_inode_only() {
        let target = ScriptedTarget {
            fiemap_errno: Some(libc::EIO),
            ..ScriptedTarget::default()
        };
        let mut mapper = ExtentMapper::new(&ScanOptions::default());
        let error = collect(&mut mapper, &target, &file(4 * KIB)).expect_err("io");
        assert!(matches!(error, FilemapError::Io(_)));
        assert!(!mapper.fiemap_unsupported());
        assert_eq!(target.block_calls.get(), 0);
    }
}
