//! Raw ioctl plumbing for the Linux block-mapping interfaces.
//!
//! Request numbers use the generic `_IOC` encoding (x86, arm, riscv).

use std::io;
use std::os::fd::RawFd;

const IOC_NRSHIFT: u64 = 0;
const IOC_TYPESHIFT: u64 = 8;
const IOC_SIZESHIFT: u64 = 16;
const IOC_DIRSHIFT: u64 = 30;

const IOC_NONE: u64 = 0;
const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, kind: u8, nr: u8, size: usize) -> u64 {
    (dir << IOC_DIRSHIFT)
        | ((kind as u64) << IOC_TYPESHIFT)
        | ((nr as u64) << IOC_NRSHIFT)
        | ((size as u64) << IOC_SIZESHIFT)
}

const fn io(kind: u8, nr: u8) -> u64 {
    ioc(IOC_NONE, kind, nr, 0)
}

const fn iowr(kind: u8, nr: u8, size: usize) -> u64 {
    ioc(IOC_READ | IOC_WRITE, kind, nr, size)
}

/// `FIBMAP`: map one logical block to a physical block.
pub const FIBMAP: u64 = io(0x00, 1);

/// `FIGETBSZ`: filesystem block size of an open file.
pub const FIGETBSZ: u64 = io(0x00, 2);

/// `FS_IOC_FIEMAP`, sized by the fixed `struct fiemap` header.
pub const FS_IOC_FIEMAP: u64 = iowr(b'f', 11, super::fiemap::FIEMAP_HEADER_SIZE);

/// `FS_IOC_GETFSMAP`, sized by `struct fsmap_head` including both keys.
pub const FS_IOC_GETFSMAP: u64 = iowr(b'X', 59, super::fsmap::FSMAP_HEAD_SIZE);

/// Issues an ioctl whose argument is a caller-owned byte buffer.
pub(crate) fn ioctl_buffer(fd: RawFd, request: u64, buffer: &mut [u8]) -> io::Result<()> {
    // SAFETY: the buffer is at least as large as the structure the request
    // encodes and stays borrowed mutably for the duration of the call.
    let ret = unsafe { libc::ioctl(fd, request as _, buffer.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Issues an ioctl whose argument is a pointer to one C `int`.
pub(crate) fn ioctl_int(fd: RawFd, request: u64, value: &mut libc::c_int) -> io::Result<()> {
    // SAFETY: `value` is a valid, exclusively borrowed int for the call.
    let ret = unsafe { libc::ioctl(fd, request as _, value as *mut libc::c_int) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Native-endian field access
// ---------------------------------------------------------------------------

#[inline]
pub(crate) fn get_u32(buffer: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buffer[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

#[inline]
pub(crate) fn get_u64(buffer: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buffer[offset..offset + 8]);
    u64::from_ne_bytes(bytes)
}

#[inline]
pub(crate) fn put_u32(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

#[inline]
pub(crate) fn put_u64(buffer: &mut [u8], offset: usize, value: u64) {
    buffer[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_numbers_match_kernel_headers() {
        assert_eq!(FIBMAP, 1);
        assert_eq!(FIGETBSZ, 2);
        assert_eq!(FS_IOC_FIEMAP, 0xC020_660B);
        assert_eq!(FS_IOC_GETFSMAP, 0xC0C0_583B);
    }

    #[test]
    fn field_access_round_trips() {
        let mut buffer = vec![0u8; 16];
        put_u32(&mut buffer, 0, 0xdead_beef);
        put_u64(&mut buffer, 8, 0x0123_4567_89ab_cdef);
        assert_eq!(get_u32(&buffer, 0), 0xdead_beef);
        assert_eq!(get_u64(&buffer, 8), 0x0123_4567_89ab_cdef);
    }
}
