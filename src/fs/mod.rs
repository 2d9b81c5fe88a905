//! Filesystem abstraction
//!
//! Every persistent byte the engine touches goes through a
//! [`StorageBackend`]. The local POSIX implementation maps directly onto
//! `std::fs`; stores that forbid appending wrap any backend in
//! [`BufferedFs`], which emulates append with read-modify-write and turns
//! off consolidation support.

use std::io;
use std::path::{Path, PathBuf};

use crate::config::StorageConfig;
use crate::error::{Result, StoreError};

mod buffered;
mod posix;

pub use buffered::BufferedFs;
pub use posix::PosixFs;

/// Largest single write handed to the OS; larger buffers are split.
pub const MAX_WRITE_BYTES: usize = 1_500_000_000;

/// Default unix permission bits for files created by the engine.
pub const FILE_MODE: u32 = 0o644;

/// Uniform file and directory operations over a storage medium.
///
/// All paths are absolute. `write` has append semantics; a path is never
/// open for reading and writing at the same time by the engine.
pub trait StorageBackend: Send + Sync {
    fn is_dir(&self, path: &Path) -> bool;
    fn is_file(&self, path: &Path) -> bool;

    fn list_dirs(&self, path: &Path) -> Result<Vec<PathBuf>>;
    fn list_files(&self, path: &Path) -> Result<Vec<PathBuf>>;

    fn current_dir(&self) -> Result<PathBuf>;
    fn canonicalize(&self, path: &Path) -> Result<PathBuf>;

    fn file_size(&self, path: &Path) -> Result<u64>;

    fn create_dir(&self, path: &Path) -> Result<()>;
    fn delete_dir(&self, path: &Path) -> Result<()>;

    /// Create an empty file exclusively with the given unix mode bits.
    fn create_file(&self, path: &Path, mode: u32) -> Result<()>;
    fn delete_file(&self, path: &Path) -> Result<()>;

    fn move_path(&self, old_path: &Path, new_path: &Path) -> Result<()>;

    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Append `buf` to the file, creating it if needed.
    fn write(&self, path: &Path, buf: &[u8]) -> Result<()>;

    /// Flush buffered data for `path` (file or directory) to the medium.
    fn sync(&self, path: &Path) -> Result<()>;

    /// Drop any open handle for `path`, flushing first.
    fn close(&self, path: &Path) -> Result<()>;

    /// Whether fragment consolidation can run safely on this backend.
    fn supports_consolidation(&self) -> bool;
}

impl std::fmt::Debug for dyn StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<dyn StorageBackend>")
    }
}

/// Select a backend from the configured home URL scheme.
///
/// Plain paths and `file://` map to [`PosixFs`]; any other scheme is a
/// remote store this build does not link a client for.
pub fn backend_for(config: &StorageConfig) -> Result<Box<dyn StorageBackend>> {
    match config.home_scheme() {
        None | Some("file") => Ok(Box::new(PosixFs::new(config.read_method))),
        Some(scheme) => Err(StoreError::Unsupported(format!(
            "no backend linked for scheme '{}'",
            scheme
        ))),
    }
}

/// Normalize an `io::Error` into the engine taxonomy, tagging the path.
pub(crate) fn map_io(err: io::Error, path: &Path) -> StoreError {
    match err.kind() {
        io::ErrorKind::NotFound => StoreError::NotFound(path.display().to_string()),
        io::ErrorKind::AlreadyExists => StoreError::AlreadyExists(path.display().to_string()),
        _ => StoreError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    #[test]
    fn test_backend_selection() {
        assert!(backend_for(&StorageConfig::new("/tmp/x")).is_ok());
        assert!(backend_for(&StorageConfig::new("file:///tmp/x")).is_ok());
        let err = backend_for(&StorageConfig::new("hdfs://nn/x")).unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));
    }

    #[test]
    fn test_map_io_kinds() {
        let path = Path::new("/nope");
        let e = map_io(io::Error::new(io::ErrorKind::NotFound, "x"), path);
        assert!(matches!(e, StoreError::NotFound(_)));
        let e = map_io(io::Error::new(io::ErrorKind::AlreadyExists, "x"), path);
        assert!(matches!(e, StoreError::AlreadyExists(_)));
        let e = map_io(io::Error::new(io::ErrorKind::PermissionDenied, "x"), path);
        assert!(matches!(e, StoreError::Io(_)));
    }
}
