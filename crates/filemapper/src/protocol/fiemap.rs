//! FIEMAP paging and extent coalescing.

use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::AsRawFd;

use super::ioctl::{get_u32, get_u64, ioctl_buffer, put_u32, put_u64, FS_IOC_FIEMAP};
use super::RawExtent;
use crate::error::{FilemapError, Result};
use crate::types::ExtentFlags;

/// `struct fiemap` without its trailing extent array.
pub const FIEMAP_HEADER_SIZE: usize = 32;

/// `struct fiemap_extent`.
pub const FIEMAP_EXTENT_SIZE: usize = 56;

pub const FIEMAP_FLAG_SYNC: u32 = 0x0000_0001;
pub const FIEMAP_FLAG_XATTR: u32 = 0x0000_0002;

/// Largest mappable offset; requests cover `start..FIEMAP_MAX_OFFSET`.
pub const FIEMAP_MAX_OFFSET: u64 = u64::MAX;

// Header field offsets.
const FM_START: usize = 0;
const FM_LENGTH: usize = 8;
const FM_FLAGS: usize = 16;
const FM_MAPPED_EXTENTS: usize = 20;
const FM_EXTENT_COUNT: usize = 24;

// Extent field offsets, relative to the extent.
const FE_LOGICAL: usize = 0;
const FE_PHYSICAL: usize = 8;
const FE_LENGTH: usize = 16;
const FE_FLAGS: usize = 40;

// ---------------------------------------------------------------------------
// Request/response buffer
// ---------------------------------------------------------------------------

/// A `struct fiemap` followed by room for `capacity` extents.
#[derive(Debug, Clone)]
pub struct FiemapBuffer {
    bytes: Vec<u8>,
    capacity: u32,
}

impl FiemapBuffer {
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            bytes: vec![0u8; FIEMAP_HEADER_SIZE + FIEMAP_EXTENT_SIZE * capacity as usize],
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Clears the buffer and writes a request header.
    pub fn prepare(&mut self, start: u64, length: u64, flags: u32) {
        self.bytes.fill(0);
        put_u64(&mut self.bytes, FM_START, start);
        put_u64(&mut self.bytes, FM_LENGTH, length);
        put_u32(&mut self.bytes, FM_FLAGS, flags);
        put_u32(&mut self.bytes, FM_EXTENT_COUNT, self.capacity);
    }

    pub fn request_start(&self) -> u64 {
        get_u64(&self.bytes, FM_START)
    }

    pub fn request_length(&self) -> u64 {
        get_u64(&self.bytes, FM_LENGTH)
    }

    pub fn request_flags(&self) -> u32 {
        get_u32(&self.bytes, FM_FLAGS)
    }

    /// Extent count claimed by the response.
    pub fn mapped_extents(&self) -> u32 {
        get_u32(&self.bytes, FM_MAPPED_EXTENTS)
    }

    pub fn set_mapped_extents(&mut self, count: u32) {
        put_u32(&mut self.bytes, FM_MAPPED_EXTENTS, count);
    }

    pub fn extent(&self, index: u32) -> RawExtent {
        let base = Self::extent_offset(index);
        RawExtent {
            logical: get_u64(&self.bytes, base + FE_LOGICAL),
            physical: get_u64(&self.bytes, base + FE_PHYSICAL),
            length: get_u64(&self.bytes, base + FE_LENGTH),
            flags: ExtentFlags::from_bits_retain(get_u32(&self.bytes, base + FE_FLAGS)),
        }
    }

    pub fn set_extent(&mut self, index: u32, extent: &RawExtent) {
        let base = Self::extent_offset(index);
        put_u64(&mut self.bytes, base + FE_LOGICAL, extent.logical);
        put_u64(&mut self.bytes, base + FE_PHYSICAL, extent.physical);
        put_u64(&mut self.bytes, base + FE_LENGTH, extent.length);
        put_u32(&mut self.bytes, base + FE_FLAGS, extent.flags.bits());
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn extent_offset(index: u32) -> usize {
        FIEMAP_HEADER_SIZE + FIEMAP_EXTENT_SIZE * index as usize
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Anything that can answer one FIEMAP request in place.
pub trait FiemapSource {
    fn fiemap(&mut self, buffer: &mut FiemapBuffer) -> Result<()>;
}

/// FIEMAP against an open file.
pub struct FileFiemap<'f> {
    file: &'f File,
}

impl<'f> FileFiemap<'f> {
    pub fn new(file: &'f File) -> Self {
        Self { file }
    }
}

impl FiemapSource for FileFiemap<'_> {
    fn fiemap(&mut self, buffer: &mut FiemapBuffer) -> Result<()> {
        ioctl_buffer(self.file.as_raw_fd(), FS_IOC_FIEMAP, buffer.as_mut_bytes())
            .map_err(|error| FilemapError::from_ioctl(error, "FIEMAP"))
    }
}

// ---------------------------------------------------------------------------
// Pager
// ---------------------------------------------------------------------------

/// Walks a file's extents one bounded request at a time.
///
/// Each request starts right after the last extent of the previous response.
/// A response with no extents ends the sequence, as does the first extent
/// carrying `LAST`, whatever count the response claimed. `LAST` is stripped
/// from the yielded records.
pub struct FiemapPager<S> {
    source: S,
    buffer: FiemapBuffer,
    flags: u32,
    next_start: u64,
    end: u64,
    pending: VecDeque<RawExtent>,
    fetched: bool,
    done: bool,
}

impl<S: FiemapSource> FiemapPager<S> {
    pub fn new(source: S, batch: u32) -> Self {
        Self {
            source,
            buffer: FiemapBuffer::new(batch),
            flags: 0,
            next_start: 0,
            end: FIEMAP_MAX_OFFSET,
            pending: VecDeque::new(),
            fetched: false,
            done: false,
        }
    }

    /// Restricts mapping to `start..start + length`.
    pub fn with_range(mut self, start: u64, length: u64) -> Self {
        self.next_start = start;
        self.end = start.saturating_add(length);
        self
    }

    /// Sets request flags (`FIEMAP_FLAG_SYNC`, `FIEMAP_FLAG_XATTR`).
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Issues the first request now so an unsupported interface is reported
    /// before any record is consumed.
    pub fn prime(&mut self) -> Result<()> {
        if self.fetched || self.done {
            return Ok(());
        }
        self.fetch_page()
    }

    fn fetch_page(&mut self) -> Result<()> {
        self.fetched = true;
        if self.next_start >= self.end {
            self.done = true;
            return Ok(());
        }

        let request_start = self.next_start;
        self.buffer
            .prepare(request_start, self.end - request_start, self.flags);
        if let Err(error) = self.source.fiemap(&mut self.buffer) {
            self.done = true;
            return Err(error);
        }

        let mapped = self.buffer.mapped_extents().min(self.buffer.capacity());
        if mapped == 0 {
            self.done = true;
            return Ok(());
        }

        let mut tail = None;
        for index in 0..mapped {
            let mut extent = self.buffer.extent(index);
            let last = extent.flags.contains(ExtentFlags::LAST);
            extent.flags.remove(ExtentFlags::LAST);
            tail = Some(extent);
            self.pending.push_back(extent);
            if last {
                self.done = true;
                break;
            }
        }

        if let Some(tail) = tail {
            let next = tail.logical.saturating_add(tail.length);
            if next <= request_start {
                log::warn!(
                    "fiemap made no progress at offset {}; stopping",
                    request_start
                );
                self.done = true;
            }
            self.next_start = next;
        }
        Ok(())
    }
}

impl<S: FiemapSource> Iterator for FiemapPager<S> {
    type Item = Result<RawExtent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(extent) = self.pending.pop_front() {
                return Some(Ok(extent));
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

// ---------------------------------------------------------------------------
// Coalescing
// ---------------------------------------------------------------------------

/// Merges neighbours that are physically and logically contiguous and carry
/// identical flags (ignoring `LAST`). Merged records gain `MERGED`.
pub struct Coalesce<I> {
    inner: I,
    current: Option<(RawExtent, ExtentFlags)>,
    deferred_error: Option<FilemapError>,
}

pub fn coalesce<I>(inner: I) -> Coalesce<I>
where
    I: Iterator<Item = Result<RawExtent>>,
{
    Coalesce {
        inner,
        current: None,
        deferred_error: None,
    }
}

fn continues(current: &RawExtent, current_flags: ExtentFlags, next: &RawExtent, next_flags: ExtentFlags) -> bool {
    current.physical.checked_add(current.length) == Some(next.physical)
        && current.logical.checked_add(current.length) == Some(next.logical)
        && current_flags == next_flags
}

impl<I> Iterator for Coalesce<I>
where
    I: Iterator<Item = Result<RawExtent>>,
{
    type Item = Result<RawExtent>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(error) = self.deferred_error.take() {
            return Some(Err(error));
        }
        loop {
            match self.inner.next() {
                None => return self.current.take().map(|(extent, _)| Ok(extent)),
                Some(Err(error)) => {
                    return match self.current.take() {
                        Some((extent, _)) => {
                            self.deferred_error = Some(error);
                            Some(Ok(extent))
                        }
                        None => Some(Err(error)),
                    };
                }
                Some(Ok(next)) => {
                    let next_flags = next.flags.difference(ExtentFlags::LAST);
                    if let Some((current, current_flags)) = self.current.as_mut() {
                        if continues(current, *current_flags, &next, next_flags) {
                            current.length += next.length;
                            current.flags |= ExtentFlags::MERGED;
                            continue;
                        }
                    }
                    let fresh = RawExtent {
                        flags: next_flags,
                        ..next
                    };
                    if let Some((finished, _)) = self.current.replace((fresh, next_flags)) {
                        return Some(Ok(finished));
                    }
                }
            }
        }
    }
}
