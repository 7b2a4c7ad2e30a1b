//! Core value types shared by the protocol, store, and query layers.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Inode types
// ---------------------------------------------------------------------------

/// Kind of object an inode row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum InodeType {
    File = 0,
    Directory = 1,
    Metadata = 2,
    Symlink = 3,
    FreeSpace = 4,
}

impl InodeType {
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::File),
            1 => Some(Self::Directory),
            2 => Some(Self::Metadata),
            3 => Some(Self::Symlink),
            4 => Some(Self::FreeSpace),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Metadata => "metadata",
            Self::Symlink => "symlink",
            Self::FreeSpace => "free space",
        }
    }

    /// Extent type holding this inode's own content; used for travel scores.
    pub fn primary_extent_type(self) -> ExtentType {
        match self {
            Self::File => ExtentType::File,
            Self::Directory => ExtentType::Directory,
            Self::Metadata => ExtentType::Metadata,
            Self::Symlink => ExtentType::Symlink,
            Self::FreeSpace => ExtentType::FreeSpace,
        }
    }

    /// Maps a stat file type; sockets, fifos and device nodes have no mapping.
    pub fn from_file_type(file_type: std::fs::FileType) -> Option<Self> {
        if file_type.is_file() {
            Some(Self::File)
        } else if file_type.is_dir() {
            Some(Self::Directory)
        } else if file_type.is_symlink() {
            Some(Self::Symlink)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Extent types
// ---------------------------------------------------------------------------

pub const EXTENT_TYPE_COUNT: usize = 7;

/// What a physical range is used for.
///
/// Declaration order is the tie-break priority used when rendering mixed
/// overview cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExtentType {
    File = 0,
    Directory = 1,
    ExtentMap = 2,
    Metadata = 3,
    Xattr = 4,
    Symlink = 5,
    FreeSpace = 6,
}

impl ExtentType {
    pub const ALL: [ExtentType; EXTENT_TYPE_COUNT] = [
        Self::File,
        Self::Directory,
        Self::ExtentMap,
        Self::Metadata,
        Self::Xattr,
        Self::Symlink,
        Self::FreeSpace,
    ];

    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::ExtentMap => "extent map",
            Self::Metadata => "metadata",
            Self::Xattr => "extended attribute",
            Self::Symlink => "symlink",
            Self::FreeSpace => "free space",
        }
    }

    /// Overview symbol for a cell made up entirely of this type.
    pub fn symbol(self) -> char {
        match self {
            Self::File => 'F',
            Self::Directory => 'D',
            Self::ExtentMap => 'E',
            Self::Metadata => 'M',
            Self::Xattr => 'X',
            Self::Symlink => 'S',
            Self::FreeSpace => 'R',
        }
    }

    /// Looks up a type by its symbol (either case) or its name.
    pub fn lookup(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|kind| {
            (normalized.len() == 1
                && normalized.starts_with(kind.symbol().to_ascii_lowercase()))
                || normalized == kind.as_str()
                || normalized == kind.as_str().replace(' ', "")
        })
    }

    pub fn bit(self) -> ExtentTypeSet {
        ExtentTypeSet::from_bits_truncate(1 << self as u8)
    }
}

bitflags! {
    /// A subset of extent types.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ExtentTypeSet: u8 {
        const FILE       = 1 << 0;
        const DIRECTORY  = 1 << 1;
        const EXTENT_MAP = 1 << 2;
        const METADATA   = 1 << 3;
        const XATTR      = 1 << 4;
        const SYMLINK    = 1 << 5;
        const FREE_SPACE = 1 << 6;
    }
}

impl ExtentTypeSet {
    #[inline]
    pub fn has(self, kind: ExtentType) -> bool {
        self.contains(kind.bit())
    }

    pub fn types(self) -> impl Iterator<Item = ExtentType> {
        ExtentType::ALL.into_iter().filter(move |kind| self.has(*kind))
    }
}

impl Default for ExtentTypeSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<ExtentType> for ExtentTypeSet {
    fn from_iter<I: IntoIterator<Item = ExtentType>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::empty(), |set, kind| set | kind.bit())
    }
}

// ---------------------------------------------------------------------------
// Extent flags
// ---------------------------------------------------------------------------

bitflags! {
    /// Per-extent flag bits. Values follow the kernel's FIEMAP extent flags;
    /// `MERGED` is set by coalescing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ExtentFlags: u32 {
        const LAST           = 0x0000_0001;
        const UNKNOWN        = 0x0000_0002;
        const DELALLOC       = 0x0000_0004;
        const ENCODED        = 0x0000_0008;
        const DATA_ENCRYPTED = 0x0000_0080;
        const NOT_ALIGNED    = 0x0000_0100;
        const DATA_INLINE    = 0x0000_0200;
        const DATA_TAIL      = 0x0000_0400;
        const UNWRITTEN      = 0x0000_0800;
        const MERGED         = 0x0000_1000;
        const SHARED         = 0x0000_2000;
    }
}

impl ExtentFlags {
    /// Flags marking state that has no committed physical placement yet.
    pub const UNCOMMITTED: Self = Self::UNKNOWN.union(Self::DELALLOC);

    /// Looks up a single flag by name, case-insensitively.
    pub fn lookup(raw: &str) -> Option<Self> {
        let wanted = raw.trim().to_ascii_uppercase().replace('-', "_");
        Self::all()
            .iter_names()
            .find(|(name, _)| *name == wanted)
            .map(|(_, flag)| flag)
    }
}

// ---------------------------------------------------------------------------
// Ingestion input
// ---------------------------------------------------------------------------

/// Timestamps in unix seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeTimes {
    pub atime: Option<i64>,
    pub crtime: Option<i64>,
    pub ctime: Option<i64>,
    pub mtime: Option<i64>,
}

/// The stat information handed to the store for one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeInfo {
    pub ino: i64,
    pub kind: InodeType,
    pub size: Option<u64>,
    pub times: InodeTimes,
}

impl InodeInfo {
    pub fn new(ino: i64, kind: InodeType) -> Self {
        Self {
            ino,
            kind,
            size: None,
            times: InodeTimes::default(),
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Builds the ingestion record from `lstat` output.
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let kind = InodeType::from_file_type(metadata.file_type())?;
        let crtime = metadata
            .created()
            .ok()
            .and_then(|value| value.duration_since(std::time::UNIX_EPOCH).ok())
            .and_then(|value| i64::try_from(value.as_secs()).ok());
        Some(Self {
            ino: i64::try_from(metadata.ino()).ok()?,
            kind,
            size: Some(metadata.size()),
            times: InodeTimes {
                atime: Some(metadata.atime()),
                crtime,
                ctime: Some(metadata.ctime()),
                mtime: Some(metadata.mtime()),
            },
        })
    }
}
