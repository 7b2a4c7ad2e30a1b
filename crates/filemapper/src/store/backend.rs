//! Storage backends for the extent store.
//!
//! The production backend is a single snapshot file:
//!
//! - 8-byte magic and a little-endian format version, uncompressed
//! - a zstd stream (multi-threaded) of the postcard-encoded tables
//! - atomic replacement (temp file + rename)
//!
//! Writers hold an exclusive `flock` on a sidecar lock file for as long as the
//! backend lives. Readers never lock; rename keeps every snapshot they see whole.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread::available_parallelism;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::schema::{CalculatedState, Tables};
use crate::config::{StoreMode, StoreOptions};
use crate::error::{FilemapError, Result};

/// Identifies snapshot files written by this crate.
pub const SNAPSHOT_MAGIC: [u8; 8] = *b"FILEMAP\0";

/// Snapshot format version - increment when changing the layout.
pub const SNAPSHOT_VERSION: u32 = 1;

const HEADER_LEN: usize = SNAPSHOT_MAGIC.len() + 4;

/// Where the store's tables live between runs.
pub trait Backend: Send {
    /// Returns `None` when nothing usable has been persisted yet.
    fn load(&mut self) -> Result<Option<(Tables, CalculatedState)>>;

    fn save(&mut self, tables: &Tables, calculated: &CalculatedState) -> Result<()>;

    fn is_writable(&self) -> bool;

    fn location(&self) -> &Path;
}

// ---------------------------------------------------------------------------
// Snapshot format
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PersistentStoreRef<'a> {
    saved_at: i64,
    tables: &'a Tables,
    calculated: &'a CalculatedState,
}

/// Owned twin of `PersistentStoreRef`; field order must match.
#[derive(Deserialize)]
struct PersistentStore {
    saved_at: i64,
    tables: Tables,
    calculated: CalculatedState,
}

/// A snapshot file on disk.
#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    writable: bool,
    compression_level: i32,
    _lock: Option<File>,
}

impl SnapshotFile {
    pub fn open(path: impl Into<PathBuf>, options: &StoreOptions) -> Result<Self> {
        let path = path.into();
        let writable = options.mode == StoreMode::ReadWrite;
        let lock = if writable {
            Some(acquire_writer_lock(&path)?)
        } else {
            None
        };
        Ok(Self {
            path,
            writable,
            compression_level: options.compression_level,
            _lock: lock,
        })
    }

    fn lock_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }
}

fn acquire_writer_lock(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let lock_path = SnapshotFile::lock_path(path);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    // SAFETY: flock only inspects the descriptor, which `file` keeps open.
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret < 0 {
        let error = std::io::Error::last_os_error();
        if error.kind() == ErrorKind::WouldBlock {
            return Err(FilemapError::Locked(path.to_path_buf()));
        }
        return Err(FilemapError::Io(error));
    }
    Ok(file)
}

impl Backend for SnapshotFile {
    fn load(&mut self) -> Result<Option<(Tables, CalculatedState)>> {
        let mut input = match File::open(&self.path) {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(FilemapError::Io(error)),
        };

        let mut header = [0u8; HEADER_LEN];
        match input.read_exact(&mut header) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::UnexpectedEof => {
                log::warn!("extent store {} is truncated; ignoring it", self.path.display());
                return Ok(None);
            }
            Err(error) => return Err(FilemapError::Io(error)),
        }
        if header[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
            log::warn!(
                "extent store {} has an unrecognized magic number; reading anyway",
                self.path.display()
            );
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&header[SNAPSHOT_MAGIC.len()..]);
        let version = u32::from_le_bytes(version);
        if version != SNAPSHOT_VERSION {
            log::debug!(
                "extent store version mismatch: {} != {}",
                version,
                SNAPSHOT_VERSION
            );
            return Ok(None);
        }

        let mut encoded = Vec::new();
        zstd::Decoder::new(input)
            .and_then(|mut decoder| decoder.read_to_end(&mut encoded))
            .map_err(|error| {
                FilemapError::Serialization(format!(
                    "failed to decompress {}: {error}",
                    self.path.display()
                ))
            })?;
        let storage: PersistentStore = postcard::from_bytes(&encoded).map_err(|error| {
            FilemapError::Serialization(format!(
                "failed to decode {}: {error}",
                self.path.display()
            ))
        })?;

        log::debug!(
            "loaded extent store from {} ({} extents, saved at {})",
            self.path.display(),
            storage.tables.extents.len(),
            storage.saved_at
        );
        Ok(Some((storage.tables, storage.calculated)))
    }

    fn save(&mut self, tables: &Tables, calculated: &CalculatedState) -> Result<()> {
        if !self.writable {
            return Err(FilemapError::NotWritable(self.path.clone()));
        }

        let storage = PersistentStoreRef {
            saved_at: Utc::now().timestamp(),
            tables,
            calculated,
        };

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut output = File::create(&tmp_path)?;
            output.write_all(&SNAPSHOT_MAGIC)?;
            output.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;

            let mut encoder = zstd::Encoder::new(output, self.compression_level).map_err(|error| {
                FilemapError::Serialization(format!("failed to create zstd encoder: {error}"))
            })?;
            let threads = available_parallelism().map(|x| x.get() as u32).unwrap_or(4);
            encoder.multithread(threads).map_err(|error| {
                FilemapError::Serialization(format!("failed to enable multi-threaded zstd: {error}"))
            })?;

            let mut output = BufWriter::new(encoder);
            postcard::to_io(&storage, &mut output).map_err(|error| {
                FilemapError::Serialization(format!("failed to encode extent store: {error}"))
            })?;
            let encoder = output.into_inner().map_err(|error| error.into_error())?;
            encoder.finish()?.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;

        log::debug!(
            "wrote extent store to {} ({} extents)",
            self.path.display(),
            tables.extents.len()
        );
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// In-memory backend for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) struct MemoryBackend {
    path: PathBuf,
    writable: bool,
    saved: Option<(Tables, CalculatedState)>,
}

#[cfg(test)]
impl MemoryBackend {
    pub(crate) fn new() -> Self {
        Self {
            path: PathBuf::from("memory"),
            writable: true,
            saved: None,
        }
    }

    pub(crate) fn read_only() -> Self {
        Self {
            writable: false,
            ..Self::new()
        }
    }
}

#[cfg(test)]
impl Backend for MemoryBackend {
    fn load(&mut self) -> Result<Option<(Tables, CalculatedState)>> {
        Ok(self.saved.clone())
    }

    fn save(&mut self, tables: &Tables, calculated: &CalculatedState) -> Result<()> {
        if !self.writable {
            return Err(FilemapError::NotWritable(self.path.clone()));
        }
        self.saved = Some((tables.clone(), calculated.clone()));
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::FilesystemSummary;

    fn sample_tables() -> Tables {
        let mut summary = FilesystemSummary::new("/mnt");
        summary.total_bytes = 1 << 20;
        summary.finished = true;
        Tables {
            summary: Some(summary),
            ..Tables::default()
        }
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("fs.fmdb");
        let mut writer = SnapshotFile::open(&path, &StoreOptions::default()).expect("open");
        writer
            .save(&sample_tables(), &CalculatedState::default())
            .expect("save");
        drop(writer);

        let mut reader = SnapshotFile::open(&path, &StoreOptions::read_only()).expect("open");
        let (tables, _) = reader.load().expect("load").expect("snapshot");
        assert_eq!(tables.summary, sample_tables().summary);
    }

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let mut reader =
            SnapshotFile::open(dir.path().join("absent"), &StoreOptions::read_only()).expect("open");
        assert!(reader.load().expect("load").is_none());
    }

    #[test]
    fn read_only_snapshot_refuses_writes() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let mut reader =
            SnapshotFile::open(dir.path().join("ro"), &StoreOptions::read_only()).expect("open");
        let error = reader
            .save(&Tables::default(), &CalculatedState::default())
            .expect_err("read-only");
        assert!(matches!(error, FilemapError::NotWritable(_)));
    }

    #[test]
    fn second_writer_is_locked_out() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("locked");
        let _writer = SnapshotFile::open(&path, &StoreOptions::default()).expect("open");
        let error = SnapshotFile::open(&path, &StoreOptions::default()).expect_err("locked");
        assert!(matches!(error, FilemapError::Locked(_)));
        assert!(SnapshotFile::open(&path, &StoreOptions::read_only()).is_ok());
    }

    #[test]
    fn foreign_magic_is_read_with_warning() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("foreign");
        let mut writer = SnapshotFile::open(&path, &StoreOptions::default()).expect("open");
        writer
            .save(&sample_tables(), &CalculatedState::default())
            .expect("save");
        drop(writer);

        let mut bytes = fs::read(&path).expect("read");
        bytes[..4].copy_from_slice(b"JUNK");
        fs::write(&path, bytes).expect("write");

        let mut reader = SnapshotFile::open(&path, &StoreOptions::read_only()).expect("open");
        assert!(reader.load().expect("load").is_some());
    }

    #[test]
    fn version_mismatch_loads_nothing() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("old");
        let mut bytes = SNAPSHOT_MAGIC.to_vec();
        bytes.extend_from_slice(&(SNAPSHOT_VERSION + 1).to_le_bytes());
        fs::write(&path, bytes).expect("write");
        let mut reader = SnapshotFile::open(&path, &StoreOptions::read_only()).expect("open");
        assert!(reader.load().expect("load").is_none());
    }
}
