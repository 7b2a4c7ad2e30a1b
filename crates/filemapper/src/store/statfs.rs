//! Live filesystem statistics for the provisional summary row.

use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use super::schema::FilesystemSummary;
use crate::error::{FilemapError, Result};

/// Builds a summary from `statvfs` and `statfs` on `path`.
pub fn live_summary(path: &Path) -> Result<FilesystemSummary> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FilemapError::InvalidPath(path.display().to_string()))?;

    let mut vfs = MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: `c_path` is NUL-terminated and `vfs` is writable storage of the
    // right type; it is only read after the call reports success.
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), vfs.as_mut_ptr()) };
    if ret < 0 {
        return Err(FilemapError::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: statvfs succeeded and filled the structure.
    let vfs = unsafe { vfs.assume_init() };

    let mut fs = MaybeUninit::<libc::statfs>::uninit();
    // SAFETY: as above.
    let fs_type = if unsafe { libc::statfs(c_path.as_ptr(), fs.as_mut_ptr()) } == 0 {
        // SAFETY: statfs succeeded and filled the structure.
        let fs = unsafe { fs.assume_init() };
        fs_type_label(fs.f_type as u32)
    } else {
        "unknown"
    };

    let fragment = vfs.f_frsize as u64;
    let mut summary = FilesystemSummary::new(path.to_string_lossy());
    summary.block_size = vfs.f_bsize as u64;
    summary.frag_size = fragment;
    summary.total_bytes = vfs.f_blocks as u64 * fragment;
    summary.free_bytes = vfs.f_bfree as u64 * fragment;
    summary.avail_bytes = vfs.f_bavail as u64 * fragment;
    summary.total_inodes = vfs.f_files as u64;
    summary.free_inodes = vfs.f_ffree as u64;
    summary.avail_inodes = vfs.f_favail as u64;
    summary.max_name_len = vfs.f_namemax as u64;
    summary.fs_type = fs_type.to_string();
    Ok(summary)
}

/// Names a filesystem by its `statfs` magic number.
pub fn fs_type_label(magic: u32) -> &'static str {
    match magic {
        0xEF53 => "ext2/ext3/ext4",
        0x5846_5342 => "xfs",
        0x9123_683E => "btrfs",
        0x4d44 => "vfat",
        0x2011_BAB0 => "exfat",
        0x5346_544E => "ntfs",
        0x0102_1994 => "tmpfs",
        0x794C_7630 => "overlayfs",
        0xF2F5_2010 => "f2fs",
        0x2FC1_2FC1 => "zfs",
        0x6969 => "nfs",
        0x3153_464A => "jfs",
        0x5265_4973 => "reiserfs",
        0x9FA0 => "proc",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_summary_reads_temp_dir() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let summary = live_summary(dir.path()).expect("statvfs");
        assert!(summary.block_size > 0);
        assert!(summary.total_bytes >= summary.free_bytes);
        assert!(!summary.finished);
        assert!(!summary.fs_type.is_empty());
    }

    #[test]
    fn known_magic_numbers_have_labels() {
        assert_eq!(fs_type_label(0x5846_5342), "xfs");
        assert_eq!(fs_type_label(0xEF53), "ext2/ext3/ext4");
        assert_eq!(fs_type_label(0x1234), "unknown");
    }
}
