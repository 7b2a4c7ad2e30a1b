//! Block-at-a-time FIBMAP mapping, the fallback when FIEMAP is unavailable.

use std::fs::File;
use std::os::fd::AsRawFd;

use super::ioctl::{ioctl_int, FIBMAP, FIGETBSZ};
use super::RawExtent;
use crate::error::{FilemapError, Result};
use crate::types::ExtentFlags;

pub trait BlockMapSource {
    /// Filesystem block size in bytes.
    fn block_size(&mut self) -> Result<u64>;

    /// Physical block backing logical `block`; zero means a hole.
    fn map_block(&mut self, block: u64) -> Result<u64>;
}

/// FIBMAP against an open file. Needs `CAP_SYS_RAWIO` on most kernels.
pub struct FileBlockMap<'f> {
    file: &'f File,
}

impl<'f> FileBlockMap<'f> {
    pub fn new(file: &'f File) -> Self {
        Self { file }
    }
}

impl BlockMapSource for FileBlockMap<'_> {
    fn block_size(&mut self) -> Result<u64> {
        let mut value: libc::c_int = 0;
        ioctl_int(self.file.as_raw_fd(), FIGETBSZ, &mut value)
            .map_err(|error| FilemapError::from_ioctl(error, "FIGETBSZ"))?;
        u64::try_from(value)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| FilemapError::Unsupported(format!("FIGETBSZ returned {value}")))
    }

    fn map_block(&mut self, block: u64) -> Result<u64> {
        let mut value = libc::c_int::try_from(block).map_err(|_| {
            FilemapError::Unsupported(format!("block {block} is beyond FIBMAP's range"))
        })?;
        ioctl_int(self.file.as_raw_fd(), FIBMAP, &mut value)
            .map_err(|error| FilemapError::from_ioctl(error, "FIBMAP"))?;
        // The kernel hands back an unsigned 32-bit block number.
        Ok(u64::from(value as u32))
    }
}

/// Maps blocks one by one, skipping holes and greedily joining physically and
/// logically contiguous blocks. Runs are capped at `max_run_blocks`; every
/// record carries `MERGED`.
pub struct FibmapScan<S> {
    source: S,
    block_size: u64,
    next_block: u64,
    end_block: u64,
    max_run_blocks: u64,
    current: Option<RawExtent>,
    done: bool,
}

impl<S: BlockMapSource> FibmapScan<S> {
    pub fn new(mut source: S, file_size: u64, max_run_blocks: u64) -> Result<Self> {
        let block_size = source.block_size()?;
        Ok(Self {
            source,
            block_size,
            next_block: 0,
            end_block: file_size.div_ceil(block_size),
            max_run_blocks: max_run_blocks.max(1),
            current: None,
            done: false,
        })
    }

    /// Restricts mapping to the blocks overlapping `start..start + length`.
    pub fn with_range(mut self, start: u64, length: u64) -> Self {
        self.next_block = start / self.block_size;
        let end = start.saturating_add(length).div_ceil(self.block_size);
        self.end_block = self.end_block.min(end);
        self
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    fn extends_run(&self, logical: u64, physical: u64) -> bool {
        self.current.as_ref().is_some_and(|run| {
            run.physical.checked_add(run.length) == Some(physical)
                && run.logical.checked_add(run.length) == Some(logical)
                && run.length / self.block_size < self.max_run_blocks
        })
    }
}

impl<S: BlockMapSource> Iterator for FibmapScan<S> {
    type Item = Result<RawExtent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.next_block >= self.end_block {
                self.done = true;
                return self.current.take().map(Ok);
            }
            let block = self.next_block;
            self.next_block += 1;

            let physical_block = match self.source.map_block(block) {
                Ok(value) => value,
                Err(error) => {
                    self.done = true;
                    return Some(Err(error));
                }
            };
            if physical_block == 0 {
                if let Some(run) = self.current.take() {
                    return Some(Ok(run));
                }
                continue;
            }

            let logical = block * self.block_size;
            let physical = physical_block * self.block_size;
            if self.extends_run(logical, physical) {
                if let Some(run) = self.current.as_mut() {
                    run.length += self.block_size;
                }
                continue;
            }
            let fresh = RawExtent::new(logical, physical, self.block_size, ExtentFlags::MERGED);
            if let Some(run) = self.current.replace(fresh) {
                return Some(Ok(run));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: u64 = 1024;

    struct ScriptedBlocks {
        block_size: u64,
        blocks: Vec<u64>,
    }

    impl BlockMapSource for ScriptedBlocks {
        fn block_size(&mut self) -> Result<u64> {
            Ok(self.block_size)
        }

        fn map_block(&mut self, block: u64) -> Result<u64> {
            Ok(self.blocks.get(block as usize).copied().unwrap_or(0))
        }
    }

    fn scan(blocks: Vec<u64>, file_size: u64, cap: u64) -> Vec<RawExtent> {
        let source = ScriptedBlocks {
            block_size: 4 * KIB,
            blocks,
        };
        FibmapScan::new(source, file_size, cap)
            .expect("scan")
            .collect::<Result<Vec<_>>>()
            .expect("extents")
    }

    #[test]
    fn contiguous_blocks_coalesce_into_one_merged_extent() {
        // 100 KiB / 4 KiB = block 25.
        let extents = scan(vec![25, 26, 27], 12 * KIB, 1024);
        assert_eq!(
            extents,
            vec![RawExtent::new(0, 100 * KIB, 12 * KIB, ExtentFlags::MERGED)]
        );
    }

    #[test]
    fn holes_split_runs_and_are_skipped() {
        let extents = scan(vec![10, 0, 12, 13], 16 * KIB, 1024);
        assert_eq!(
            extents,
            vec![
                RawExtent::new(0, 40 * KIB, 4 * KIB, ExtentFlags::MERGED),
                RawExtent::new(8 * KIB, 48 * KIB, 8 * KIB, ExtentFlags::MERGED),
            ]
        );
    }

    #[test]
    fn physical_discontinuity_starts_new_record() {
        let extents = scan(vec![10, 11, 50], 12 * KIB, 1024);
        assert_eq!(extents.len(), 2);
        assert_eq!(extents[1].physical, 200 * KIB);
    }

    #[test]
    fn run_length_is_capped() {
        let extents = scan(vec![1, 2, 3, 4, 5], 20 * KIB, 2);
        let lengths: Vec<u64> = extents.iter().map(|e| e.length).collect();
        assert_eq!(lengths, vec![8 * KIB, 8 * KIB, 4 * KIB]);
        assert_eq!(extents[1].logical, 8 * KIB);
    }

    #[test]
    fn partial_last_block_is_mapped() {
        let extents = scan(vec![7, 8], 4 * KIB + 1, 1024);
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].length, 8 * KIB);
    }

    #[test]
    fn range_restricts_blocks_queried() {
        let source = ScriptedBlocks {
            block_size: 4 * KIB,
            blocks: vec![1, 2, 3, 4],
        };
        let extents = FibmapScan::new(source, 16 * KIB, 1024)
            .expect("scan")
            .with_range(4 * KIB, 8 * KIB)
            .collect::<Result<Vec<_>>>()
            .expect("extents");
        assert_eq!(
            extents,
            vec![RawExtent::new(4 * KIB, 8 * KIB, 8 * KIB, ExtentFlags::MERGED)]
        );
    }
}
