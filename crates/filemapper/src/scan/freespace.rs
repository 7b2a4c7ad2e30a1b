//! Free space, metadata and unlinked inodes from the device-wide GETFSMAP map.
//!
//! Owners that are not reachable through the namespace are attached to
//! synthetic inodes under `/$metadata`:
//!
//! | id          | path                          | type      |
//! |-------------|-------------------------------|-----------|
//! | -1          | /$metadata                    | directory |
//! | -2          | /$metadata/metadata           | metadata  |
//! | -3          | /$metadata/freespace          | free space|
//! | -4          | /$metadata/unlinked           | directory |
//! | -5, -6, ... | /$metadata/<owner name>       | metadata  |
//! | ino         | /$metadata/unlinked/<ino>     | file      |
//!
//! Special owner ids are handed out in discovery order. Pseudo-inodes and
//! their directory entries are created the first time a record needs them.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use fnv::{FnvHashMap, FnvHashSet};

use crate::cancel::CancellationToken;
use crate::config::ScanOptions;
use crate::error::Result;
use crate::protocol::fsmap::encode_device;
use crate::protocol::{FileFsmap, FsmapFlags, FsmapOwner, FsmapPager, FsmapSource, SpecialOwner};
use crate::store::{Extent, ScanSession};
use crate::types::{ExtentFlags, ExtentType, InodeType};

pub const METADATA_DIR_INO: i64 = -1;
pub const METADATA_INO: i64 = -2;
pub const FREE_SPACE_INO: i64 = -3;
pub const UNLINKED_DIR_INO: i64 = -4;
const FIRST_SPECIAL_INO: i64 = -5;

pub const METADATA_DIR_NAME: &str = "$metadata";

/// A storage consumer without a name in the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PseudoOwner {
    MetadataDir,
    Metadata,
    FreeSpace,
    UnlinkedDir,
    Special(SpecialOwner),
}

impl PseudoOwner {
    /// The generic owners get fixed pseudo-inodes; everything else is a
    /// filesystem-specific owner.
    pub fn from_special(owner: SpecialOwner) -> Self {
        match owner {
            SpecialOwner::FREE => Self::FreeSpace,
            SpecialOwner::METADATA => Self::Metadata,
            other => Self::Special(other),
        }
    }

    fn kind(self) -> InodeType {
        match self {
            Self::MetadataDir | Self::UnlinkedDir => InodeType::Directory,
            Self::Metadata | Self::Special(_) => InodeType::Metadata,
            Self::FreeSpace => InodeType::FreeSpace,
        }
    }

    fn name(self) -> String {
        match self {
            Self::MetadataDir => METADATA_DIR_NAME.to_string(),
            Self::Metadata => "metadata".to_string(),
            Self::FreeSpace => "freespace".to_string(),
            Self::UnlinkedDir => "unlinked".to_string(),
            Self::Special(owner) => owner.name(),
        }
    }
}

/// Stable id assignment for pseudo-owners.
#[derive(Debug)]
pub struct PseudoOwners {
    specials: FnvHashMap<SpecialOwner, i64>,
    next_special: i64,
}

impl Default for PseudoOwners {
    fn default() -> Self {
        Self {
            specials: FnvHashMap::default(),
            next_special: FIRST_SPECIAL_INO,
        }
    }
}

impl PseudoOwners {
    pub fn id(&mut self, owner: PseudoOwner) -> i64 {
        match owner {
            PseudoOwner::MetadataDir => METADATA_DIR_INO,
            PseudoOwner::Metadata => METADATA_INO,
            PseudoOwner::FreeSpace => FREE_SPACE_INO,
            PseudoOwner::UnlinkedDir => UNLINKED_DIR_INO,
            PseudoOwner::Special(owner) => *self.specials.entry(owner).or_insert_with(|| {
                let id = self.next_special;
                self.next_special -= 1;
                id
            }),
        }
    }

    pub fn special_count(&self) -> usize {
        self.specials.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeSpaceReport {
    /// Records on this device.
    pub records: u64,
    /// Records dropped because they describe another device.
    pub foreign: u64,
    pub free_bytes: u64,
    pub special_owners: usize,
    pub unlinked_inodes: usize,
    pub extent_map_records: u64,
}

/// Ownership flags translated to extent flags.
fn extent_flags(flags: FsmapFlags) -> ExtentFlags {
    let mut out = ExtentFlags::empty();
    if flags.contains(FsmapFlags::PREALLOC) {
        out |= ExtentFlags::UNWRITTEN;
    }
    if flags.contains(FsmapFlags::SHARED) {
        out |= ExtentFlags::SHARED;
    }
    out
}

/// Runs the GETFSMAP pass through any open handle on the filesystem at
/// `root`. Returns `None` if cancelled.
pub fn map_free_space(
    session: &mut ScanSession<'_>,
    root: &Path,
    device: u64,
    options: &ScanOptions,
    token: &CancellationToken,
) -> Result<Option<FreeSpaceReport>> {
    let file = File::open(root)?;
    let pager = FsmapPager::new(FileFsmap::new(&file), options.fsmap_batch);
    FreeSpaceIngest::new(session, Some(device)).run(pager, token)
}

/// Feeds one device map into a scan session.
pub struct FreeSpaceIngest<'a, 's> {
    session: &'a mut ScanSession<'s>,
    device: Option<u64>,
    owners: PseudoOwners,
    unlinked: FnvHashSet<i64>,
    dentries: BTreeMap<i64, Vec<(String, i64)>>,
    report: FreeSpaceReport,
}

impl<'a, 's> FreeSpaceIngest<'a, 's> {
    /// `device` is the `st_dev` of the scanned filesystem; records for other
    /// devices are dropped when the kernel reports encoded device numbers.
    pub fn new(session: &'a mut ScanSession<'s>, device: Option<u64>) -> Self {
        Self {
            session,
            device,
            owners: PseudoOwners::default(),
            unlinked: FnvHashSet::default(),
            dentries: BTreeMap::new(),
            report: FreeSpaceReport::default(),
        }
    }

    pub fn run<S: FsmapSource>(
        mut self,
        mut pager: FsmapPager<S>,
        token: &CancellationToken,
    ) -> Result<Option<FreeSpaceReport>> {
        pager.prime()?;
        let wanted = self
            .device
            .filter(|_| pager.device_is_dev_t())
            .map(encode_device);

        for (count, record) in pager.enumerate() {
            if token.is_cancelled_sparse(count).is_none() {
                log::debug!("free space map cancelled after {} records", count);
                return Ok(None);
            }
            let record = record?;
            if wanted.is_some_and(|device| device != record.device) {
                self.report.foreign += 1;
                continue;
            }
            self.report.records += 1;
            let flags = extent_flags(record.flags);

            match record.owner() {
                FsmapOwner::Special(owner) => {
                    let owner = PseudoOwner::from_special(owner);
                    let ino = self.attach(owner)?;
                    let kind = match owner {
                        PseudoOwner::FreeSpace => {
                            self.report.free_bytes += record.length;
                            ExtentType::FreeSpace
                        }
                        _ => ExtentType::Metadata,
                    };
                    self.session.push_extent(Extent {
                        ino,
                        physical: record.physical,
                        logical: None,
                        length: record.length,
                        flags,
                        kind,
                    })?;
                }
                FsmapOwner::Inode(raw) => {
                    let Ok(ino) = i64::try_from(raw) else {
                        log::warn!("skipping fsmap record for out-of-range inode {}", raw);
                        continue;
                    };
                    let visited = self.session.contains_inode(ino) && !self.unlinked.contains(&ino);
                    if record.flags.contains(FsmapFlags::EXTENT_MAP) {
                        if !visited {
                            self.attach_unlinked(ino)?;
                        }
                        self.report.extent_map_records += 1;
                        self.session.push_extent(Extent {
                            ino,
                            physical: record.physical,
                            logical: None,
                            length: record.length,
                            flags,
                            kind: ExtentType::ExtentMap,
                        })?;
                        continue;
                    }
                    // Data and attribute forks of walked inodes came from FIEMAP.
                    if visited {
                        continue;
                    }
                    self.attach_unlinked(ino)?;
                    let kind = if record.flags.contains(FsmapFlags::ATTR_FORK) {
                        ExtentType::Xattr
                    } else {
                        ExtentType::File
                    };
                    self.session.push_extent(Extent {
                        ino,
                        physical: record.physical,
                        logical: Some(record.offset),
                        length: record.length,
                        flags,
                        kind,
                    })?;
                }
            }
        }

        for (parent, entries) in std::mem::take(&mut self.dentries) {
            self.session.insert_directory(parent, entries)?;
        }
        self.report.special_owners = self.owners.special_count();
        self.report.unlinked_inodes = self.unlinked.len();
        log::debug!(
            "free space map: {} records, {} foreign, {} bytes free, {} unlinked inodes",
            self.report.records,
            self.report.foreign,
            self.report.free_bytes,
            self.report.unlinked_inodes
        );
        Ok(Some(self.report))
    }

    /// Creates `owner`'s pseudo-inode and its parents on first use.
    fn attach(&mut self, owner: PseudoOwner) -> Result<i64> {
        let ino = self.owners.id(owner);
        if self.session.contains_inode(ino) {
            return Ok(ino);
        }
        let separator = self.session.path_separator();
        let (parent, parent_path) = match owner {
            PseudoOwner::MetadataDir => (self.session.lookup_path(""), String::new()),
            _ => {
                let parent = self.attach(PseudoOwner::MetadataDir)?;
                (Some(parent), format!("{separator}{METADATA_DIR_NAME}"))
            }
        };
        let name = owner.name();
        self.session
            .ensure_inode(ino, owner.kind(), &format!("{parent_path}{separator}{name}"))?;
        if let Some(parent) = parent {
            self.dentries.entry(parent).or_default().push((name, ino));
        }
        Ok(ino)
    }

    fn attach_unlinked(&mut self, ino: i64) -> Result<()> {
        if !self.unlinked.insert(ino) {
            return Ok(());
        }
        let parent = self.attach(PseudoOwner::UnlinkedDir)?;
        let separator = self.session.path_separator();
        let name = ino.to_string();
        self.session.ensure_inode(
            ino,
            InodeType::File,
            &format!("{separator}{METADATA_DIR_NAME}{separator}unlinked{separator}{name}"),
        )?;
        self.dentries.entry(parent).or_default().push((name, ino));
        Ok(())
    }
}
