//! Kernel block-mapping protocols.
//!
//! Three interfaces are decoded into one canonical record:
//!
//! - `fiemap`: many extents per call, paged by logical offset, then coalesced.
//! - `fibmap`: one block per call, used when FIEMAP is unavailable.
//! - `fsmap`: device-wide ownership records (free space, metadata, inodes).
//!
//! Every interface sits behind a small source trait so paging and decoding can
//! be driven by scripted buffers as well as by real ioctls.

pub mod fibmap;
pub mod fiemap;
pub mod fsmap;
pub mod ioctl;

pub use fibmap::{BlockMapSource, FibmapScan, FileBlockMap};
pub use fiemap::{coalesce, Coalesce, FiemapBuffer, FiemapPager, FiemapSource, FileFiemap};
pub use fsmap::{FileFsmap, FsmapFlags, FsmapHead, FsmapOwner, FsmapPager, FsmapRecord, FsmapSource, SpecialOwner};

use crate::types::ExtentFlags;

/// One extent as reported by a mapping interface, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawExtent {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
    pub flags: ExtentFlags,
}

impl RawExtent {
    pub fn new(logical: u64, physical: u64, length: u64, flags: ExtentFlags) -> Self {
        Self {
            logical,
            physical,
            length,
            flags,
        }
    }

    /// Inclusive last physical byte.
    #[inline]
    pub fn physical_end(&self) -> u64 {
        self.physical + self.length.saturating_sub(1)
    }
}
