//! GETFSMAP: device-wide ownership of every physical range.

use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::AsRawFd;

use bitflags::bitflags;

use super::ioctl::{get_u32, get_u64, ioctl_buffer, put_u32, put_u64, FS_IOC_GETFSMAP};
use crate::error::{FilemapError, Result};

/// `struct fsmap`.
pub const FSMAP_RECORD_SIZE: usize = 64;

/// `struct fsmap_head` including both keys.
pub const FSMAP_HEAD_SIZE: usize = 64 + 2 * FSMAP_RECORD_SIZE;

/// Output header flag: `fmr_device` holds an encoded `dev_t`.
pub const FMH_OF_DEV_T: u32 = 0x1;

const FMH_OFLAGS: usize = 4;
const FMH_COUNT: usize = 8;
const FMH_ENTRIES: usize = 12;
const FMH_KEYS: usize = 64;

const FMR_DEVICE: usize = 0;
const FMR_FLAGS: usize = 4;
const FMR_PHYSICAL: usize = 8;
const FMR_OWNER: usize = 16;
const FMR_OFFSET: usize = 24;
const FMR_LENGTH: usize = 32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FsmapFlags: u32 {
        const PREALLOC      = 0x01;
        const ATTR_FORK     = 0x02;
        const EXTENT_MAP    = 0x04;
        const SHARED        = 0x08;
        const SPECIAL_OWNER = 0x10;
        const LAST          = 0x20;
    }
}

// ---------------------------------------------------------------------------
// Owners
// ---------------------------------------------------------------------------

/// A non-inode owner: a filesystem type tag plus a subcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpecialOwner {
    pub fs_type: u32,
    pub code: u32,
}

const XFS_OWNER_TYPE: u32 = b'X' as u32;
const EXT4_OWNER_TYPE: u32 = b'f' as u32;

impl SpecialOwner {
    pub const FREE: Self = Self::new(0, 1);
    pub const UNKNOWN: Self = Self::new(0, 2);
    pub const METADATA: Self = Self::new(0, 3);

    pub const fn new(fs_type: u32, code: u32) -> Self {
        Self { fs_type, code }
    }

    pub fn from_raw(owner: u64) -> Self {
        Self::new((owner >> 32) as u32, owner as u32)
    }

    pub fn raw(self) -> u64 {
        (u64::from(self.fs_type) << 32) | u64::from(self.code)
    }

    /// Human-readable owner name; unknown codes render as `type:code`.
    pub fn name(self) -> String {
        let known = match (self.fs_type, self.code) {
            (0, 1) => Some("freespace"),
            (0, 2) => Some("unknown"),
            (0, 3) => Some("metadata"),
            (XFS_OWNER_TYPE, 1) => Some("XFS:fs"),
            (XFS_OWNER_TYPE, 2) => Some("XFS:log"),
            (XFS_OWNER_TYPE, 3) => Some("XFS:ag"),
            (XFS_OWNER_TYPE, 4) => Some("XFS:inobt"),
            (XFS_OWNER_TYPE, 5) => Some("XFS:inodes"),
            (XFS_OWNER_TYPE, 6) => Some("XFS:refcount"),
            (XFS_OWNER_TYPE, 7) => Some("XFS:cow"),
            (XFS_OWNER_TYPE, 8) => Some("XFS:defective"),
            (EXT4_OWNER_TYPE, 1) => Some("ext4:gdt"),
            (EXT4_OWNER_TYPE, 2) => Some("ext4:resv_gdt"),
            (EXT4_OWNER_TYPE, 3) => Some("ext4:block_bitmap"),
            (EXT4_OWNER_TYPE, 4) => Some("ext4:inode_bitmap"),
            _ => None,
        };
        if let Some(name) = known {
            return name.to_string();
        }
        match u8::try_from(self.fs_type) {
            Ok(tag) if tag.is_ascii_graphic() => format!("{}:{}", tag as char, self.code),
            _ => format!("{}:{}", self.fs_type, self.code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmapOwner {
    Inode(u64),
    Special(SpecialOwner),
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One `struct fsmap`. Also used as a query key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsmapRecord {
    pub device: u32,
    pub flags: FsmapFlags,
    pub physical: u64,
    pub owner: u64,
    pub offset: u64,
    pub length: u64,
}

impl FsmapRecord {
    /// The key past every possible record.
    pub fn high_key() -> Self {
        Self {
            device: u32::MAX,
            flags: FsmapFlags::from_bits_retain(u32::MAX),
            physical: u64::MAX,
            owner: u64::MAX,
            offset: u64::MAX,
            length: 0,
        }
    }

    pub fn owner(&self) -> FsmapOwner {
        if self.flags.contains(FsmapFlags::SPECIAL_OWNER) {
            FsmapOwner::Special(SpecialOwner::from_raw(self.owner))
        } else {
            FsmapOwner::Inode(self.owner)
        }
    }

    fn read(bytes: &[u8], base: usize) -> Self {
        Self {
            device: get_u32(bytes, base + FMR_DEVICE),
            flags: FsmapFlags::from_bits_retain(get_u32(bytes, base + FMR_FLAGS)),
            physical: get_u64(bytes, base + FMR_PHYSICAL),
            owner: get_u64(bytes, base + FMR_OWNER),
            offset: get_u64(bytes, base + FMR_OFFSET),
            length: get_u64(bytes, base + FMR_LENGTH),
        }
    }

    fn write(&self, bytes: &mut [u8], base: usize) {
        put_u32(bytes, base + FMR_DEVICE, self.device);
        put_u32(bytes, base + FMR_FLAGS, self.flags.bits());
        put_u64(bytes, base + FMR_PHYSICAL, self.physical);
        put_u64(bytes, base + FMR_OWNER, self.owner);
        put_u64(bytes, base + FMR_OFFSET, self.offset);
        put_u64(bytes, base + FMR_LENGTH, self.length);
    }
}

/// Encodes a `dev_t` the way the kernel reports it in `fmr_device`.
pub fn encode_device(dev: u64) -> u32 {
    let major = ((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0000_0fff);
    let minor = ((dev >> 12) & 0xffff_ff00) | (dev & 0x0000_00ff);
    ((minor & 0xff) | (major << 8) | ((minor & !0xff) << 12)) as u32
}

// ---------------------------------------------------------------------------
// Request/response buffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FsmapHead {
    bytes: Vec<u8>,
    capacity: u32,
}

impl FsmapHead {
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            bytes: vec![0u8; FSMAP_HEAD_SIZE + FSMAP_RECORD_SIZE * capacity as usize],
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn prepare(&mut self, low: &FsmapRecord, high: &FsmapRecord) {
        self.bytes.fill(0);
        put_u32(&mut self.bytes, FMH_COUNT, self.capacity);
        low.write(&mut self.bytes, FMH_KEYS);
        high.write(&mut self.bytes, FMH_KEYS + FSMAP_RECORD_SIZE);
    }

    pub fn low_key(&self) -> FsmapRecord {
        FsmapRecord::read(&self.bytes, FMH_KEYS)
    }

    pub fn oflags(&self) -> u32 {
        get_u32(&self.bytes, FMH_OFLAGS)
    }

    pub fn set_oflags(&mut self, flags: u32) {
        put_u32(&mut self.bytes, FMH_OFLAGS, flags);
    }

    pub fn entries(&self) -> u32 {
        get_u32(&self.bytes, FMH_ENTRIES)
    }

    pub fn set_entries(&mut self, entries: u32) {
        put_u32(&mut self.bytes, FMH_ENTRIES, entries);
    }

    pub fn record(&self, index: u32) -> FsmapRecord {
        FsmapRecord::read(&self.bytes, Self::record_offset(index))
    }

    pub fn set_record(&mut self, index: u32, record: &FsmapRecord) {
        record.write(&mut self.bytes, Self::record_offset(index));
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn record_offset(index: u32) -> usize {
        FSMAP_HEAD_SIZE + FSMAP_RECORD_SIZE * index as usize
    }
}

// ---------------------------------------------------------------------------
// Sources and paging
// ---------------------------------------------------------------------------

pub trait FsmapSource {
    fn getfsmap(&mut self, head: &mut FsmapHead) -> Result<()>;
}

/// GETFSMAP issued through any open file on the filesystem.
pub struct FileFsmap<'f> {
    file: &'f File,
}

impl<'f> FileFsmap<'f> {
    pub fn new(file: &'f File) -> Self {
        Self { file }
    }
}

impl FsmapSource for FileFsmap<'_> {
    fn getfsmap(&mut self, head: &mut FsmapHead) -> Result<()> {
        ioctl_buffer(self.file.as_raw_fd(), FS_IOC_GETFSMAP, head.as_mut_bytes())
            .map_err(|error| FilemapError::from_ioctl(error, "GETFSMAP"))
    }
}

/// Walks the whole device map. Each request's low key is the last record of
/// the previous response; the sequence ends on an empty response or a record
/// flagged `LAST`.
pub struct FsmapPager<S> {
    source: S,
    head: FsmapHead,
    low: FsmapRecord,
    high: FsmapRecord,
    pending: VecDeque<FsmapRecord>,
    device_is_dev_t: bool,
    fetched: bool,
    done: bool,
}

impl<S: FsmapSource> FsmapPager<S> {
    pub fn new(source: S, batch: u32) -> Self {
        Self {
            source,
            head: FsmapHead::new(batch),
            low: FsmapRecord::default(),
            high: FsmapRecord::high_key(),
            pending: VecDeque::new(),
            device_is_dev_t: false,
            fetched: false,
            done: false,
        }
    }

    /// Issues the first request so an unsupported filesystem is reported up
    /// front.
    pub fn prime(&mut self) -> Result<()> {
        if self.fetched || self.done {
            return Ok(());
        }
        self.fetch_page()
    }

    /// Whether record devices are encoded `dev_t` values (see `encode_device`).
    pub fn device_is_dev_t(&self) -> bool {
        self.device_is_dev_t
    }

    fn fetch_page(&mut self) -> Result<()> {
        self.fetched = true;
        self.head.prepare(&self.low, &self.high);
        if let Err(error) = self.source.getfsmap(&mut self.head) {
            self.done = true;
            return Err(error);
        }
        self.device_is_dev_t = self.head.oflags() & FMH_OF_DEV_T != 0;

        let entries = self.head.entries().min(self.head.capacity());
        if entries == 0 {
            self.done = true;
            return Ok(());
        }
        for index in 0..entries {
            let record = self.head.record(index);
            self.pending.push_back(record);
            self.low = record;
            if record.flags.contains(FsmapFlags::LAST) {
                self.done = true;
                break;
            }
        }
        Ok(())
    }
}

impl<S: FsmapSource> Iterator for FsmapPager<S> {
    type Item = Result<FsmapRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some(Ok(record));
            }
            if self.done {
                return None;
            }
            if let Err(error) = self.fetch_page() {
                return Some(Err(error));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedFsmap {
        pages: VecDeque<Vec<FsmapRecord>>,
        low_keys: Vec<FsmapRecord>,
    }

    impl FsmapSource for &mut ScriptedFsmap {
        fn getfsmap(&mut self, head: &mut FsmapHead) -> Result<()> {
            self.low_keys.push(head.low_key());
            let page = self.pages.pop_front().unwrap_or_default();
            for (index, record) in page.iter().enumerate() {
                head.set_record(index as u32, record);
            }
            head.set_entries(page.len() as u32);
            head.set_oflags(FMH_OF_DEV_T);
            Ok(())
        }
    }

    fn rec(physical: u64, length: u64, owner: u64, flags: FsmapFlags) -> FsmapRecord {
        FsmapRecord {
            device: 0x801,
            flags,
            physical,
            owner,
            offset: 0,
            length,
        }
    }

    #[test]
    fn continuation_key_is_last_record() {
        let first = vec![
            rec(0, 4096, SpecialOwner::METADATA.raw(), FsmapFlags::SPECIAL_OWNER),
            rec(4096, 8192, 131, FsmapFlags::empty()),
        ];
        let second = vec![rec(
            12288,
            4096,
            SpecialOwner::FREE.raw(),
            FsmapFlags::SPECIAL_OWNER | FsmapFlags::LAST,
        )];
        let mut source = ScriptedFsmap {
            pages: VecDeque::from(vec![first.clone(), second]),
            low_keys: Vec::new(),
        };
        let mut pager = FsmapPager::new(&mut source, 2);
        let records = pager
            .by_ref()
            .collect::<Result<Vec<_>>>()
            .expect("records");
        assert!(pager.device_is_dev_t());
        drop(pager);
        assert_eq!(records.len(), 3);
        assert_eq!(source.low_keys.len(), 2);
        assert_eq!(source.low_keys[0], FsmapRecord::default());
        assert_eq!(source.low_keys[1], first[1]);
    }

    #[test]
    fn empty_response_ends_map() {
        let mut source = ScriptedFsmap {
            pages: VecDeque::from(vec![vec![rec(0, 4096, 12, FsmapFlags::empty())]]),
            low_keys: Vec::new(),
        };
        let records = FsmapPager::new(&mut source, 1)
            .collect::<Result<Vec<_>>>()
            .expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(source.low_keys.len(), 2);
    }

    #[test]
    fn owners_decode_and_render() {
        let special = rec(
            0,
            1,
            SpecialOwner::new(u32::from(b'X'), 2).raw(),
            FsmapFlags::SPECIAL_OWNER,
        );
        assert_eq!(
            special.owner(),
            FsmapOwner::Special(SpecialOwner::new(u32::from(b'X'), 2))
        );
        assert_eq!(SpecialOwner::new(u32::from(b'X'), 2).name(), "XFS:log");
        assert_eq!(SpecialOwner::new(u32::from(b'X'), 42).name(), "X:42");
        assert_eq!(SpecialOwner::new(7, 3).name(), "7:3");
        assert_eq!(SpecialOwner::FREE.name(), "freespace");
        assert_eq!(rec(0, 1, 99, FsmapFlags::empty()).owner(), FsmapOwner::Inode(99));
    }

    #[test]
    fn device_encoding_matches_kernel_layout() {
        // 8:1 (sda1) encodes as 0x801.
        let dev = (8u64 << 8) | 1;
        assert_eq!(encode_device(dev), 0x801);
        // 259:3 (nvme partition).
        let dev = (259u64 << 8) | 3;
        assert_eq!(encode_device(dev), (259 << 8) | 3);
    }
}
