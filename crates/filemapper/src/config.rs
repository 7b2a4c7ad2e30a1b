//! Tunables for opening stores and running scans.

/// Default number of extents requested per FIEMAP call.
pub const DEFAULT_FIEMAP_BATCH: u32 = 512;

/// Default number of records requested per GETFSMAP call.
pub const DEFAULT_FSMAP_BATCH: u32 = 10_000;

/// Default cap on blocks coalesced into one FIBMAP record.
pub const DEFAULT_MAX_BMAP_RUN_BLOCKS: u64 = 32_768;

/// Default zstd level for snapshot files.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub mode: StoreMode,
    pub compression_level: i32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            mode: StoreMode::ReadWrite,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl StoreOptions {
    pub fn read_only() -> Self {
        Self {
            mode: StoreMode::ReadOnly,
            ..Self::default()
        }
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }
}

/// Options for the namespace walk and the block-mapping protocols.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub fiemap_batch: u32,
    pub fsmap_batch: u32,
    /// Upper bound on the blocks merged into one FIBMAP record.
    pub max_bmap_run_blocks: u64,
    /// Skip FIEMAP entirely and map every file block by block.
    pub force_fibmap: bool,
    /// Ask the kernel to flush delayed allocations before mapping.
    pub sync_before_map: bool,
    /// Run the GETFSMAP pass for free space and metadata after the walk.
    pub map_free_space: bool,
    /// Persist the unfinished tables after this many inodes.
    pub checkpoint_interval: Option<u64>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            fiemap_batch: DEFAULT_FIEMAP_BATCH,
            fsmap_batch: DEFAULT_FSMAP_BATCH,
            max_bmap_run_blocks: DEFAULT_MAX_BMAP_RUN_BLOCKS,
            force_fibmap: false,
            sync_before_map: false,
            map_free_space: true,
            checkpoint_interval: None,
        }
    }
}

impl ScanOptions {
    pub fn with_force_fibmap(mut self, force: bool) -> Self {
        self.force_fibmap = force;
        self
    }

    pub fn with_max_bmap_run_blocks(mut self, blocks: u64) -> Self {
        self.max_bmap_run_blocks = blocks.max(1);
        self
    }

    pub fn with_free_space(mut self, enabled: bool) -> Self {
        self.map_free_space = enabled;
        self
    }

    pub fn with_checkpoint_interval(mut self, inodes: u64) -> Self {
        self.checkpoint_interval = (inodes > 0).then_some(inodes);
        self
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync_before_map = sync;
        self
    }
}
