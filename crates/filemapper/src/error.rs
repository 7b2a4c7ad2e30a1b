use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum FilemapError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Store is not writable: {0}")]
    NotWritable(PathBuf),

    #[error("Store is locked by another writer: {0}")]
    Locked(PathBuf),

    #[error("Incomplete database: the last scan did not finish")]
    IncompleteDatabase,

    #[error("Empty database: no scan has been recorded")]
    EmptyDatabase,

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Query parse error: {0}")]
    QueryParse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, FilemapError>;

impl FilemapError {
    /// Classifies an error returned by a block-mapping ioctl.
    ///
    /// Interfaces that a filesystem does not implement come back as one of a
    /// handful of errno values; those become `Unsupported` so the caller can
    /// fall back or skip. Everything else is a real I/O failure.
    pub fn from_ioctl(error: io::Error, interface: &str) -> Self {
        match error.raw_os_error() {
            Some(libc::ENOTTY)
            | Some(libc::EOPNOTSUPP)
            | Some(libc::ENOSYS)
            | Some(libc::EINVAL)
            | Some(libc::EBADR) => Self::Unsupported(format!("{interface}: {error}")),
            _ => Self::Io(error),
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_errno_classification() {
        let error = FilemapError::from_ioctl(io::Error::from_raw_os_error(libc::ENOTTY), "fiemap");
        assert!(error.is_unsupported());
        let error =
            FilemapError::from_ioctl(io::Error::from_raw_os_error(libc::EOPNOTSUPP), "fibmap");
        assert!(error.is_unsupported());
        let error = FilemapError::from_ioctl(io::Error::from_raw_os_error(libc::EIO), "fiemap");
        assert!(matches!(error, FilemapError::Io(_)));
    }
}
