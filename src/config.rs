//! Storage configuration
//!
//! A [`StorageConfig`] selects the filesystem backend (through the `home`
//! path or URL) and the low-level read/write methods. It is consumed once by
//! [`crate::Context::init`].

use std::env;
use std::path::PathBuf;

/// How file reads are performed by the local backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMethod {
    /// Plain positioned reads
    ReadIo,
    /// Memory-map the file and copy out of the mapping
    Mmap,
    /// MPI-IO collective reads (recognized, but this build carries no MPI
    /// runtime and `Context::init` rejects it)
    MpiIo,
}

/// How file writes are performed by the local backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMethod {
    /// Plain appending writes
    WriteIo,
    /// MPI-IO collective writes (recognized but rejected, as with reads)
    MpiIo,
}

/// Configuration for a storage context
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory or URL; the URL scheme selects the backend.
    /// Empty means the current working directory.
    pub home: String,
    /// Read method (default: memory-map for local POSIX)
    pub read_method: ReadMethod,
    /// Write method (default: plain write)
    pub write_method: WriteMethod,
    /// Opaque MPI communicator handle; must be non-zero iff an MPI-IO
    /// method was selected
    pub mpi_communicator: usize,
    /// Byte budget of the decompressed-tile cache, per fragment
    pub tile_cache_bytes: usize,
    /// Byte budget of the variable-value tile cache, per fragment
    pub tile_cache_var_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            home: String::new(),
            read_method: ReadMethod::Mmap,
            write_method: WriteMethod::WriteIo,
            mpi_communicator: 0,
            tile_cache_bytes: 64 * 1024 * 1024,
            tile_cache_var_bytes: 64 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    /// Create a config rooted at `home`
    pub fn new(home: impl Into<String>) -> Self {
        Self {
            home: home.into(),
            ..Self::default()
        }
    }

    /// Set the read method
    pub fn with_read_method(mut self, method: ReadMethod) -> Self {
        self.read_method = method;
        self
    }

    /// Set the write method
    pub fn with_write_method(mut self, method: WriteMethod) -> Self {
        self.write_method = method;
        self
    }

    /// True if either method requires an MPI runtime
    pub fn needs_mpi(&self) -> bool {
        self.read_method == ReadMethod::MpiIo || self.write_method == WriteMethod::MpiIo
    }

    /// The URL scheme of `home`, if any (`"hdfs"` for `hdfs://...`).
    /// Plain paths have no scheme and map to the local backend.
    pub fn home_scheme(&self) -> Option<&str> {
        let idx = self.home.find("://")?;
        let scheme = &self.home[..idx];
        if !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            Some(scheme)
        } else {
            None
        }
    }

    /// Scratch directory for consolidation, honoring `TMPDIR`
    pub fn scratch_dir() -> PathBuf {
        env::var_os("TMPDIR")
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir)
    }
}
