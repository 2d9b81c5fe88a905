//! Append-emulating backend wrapper
//!
//! Object stores generally reject appending to an existing object. This
//! wrapper buffers appended bytes per path in memory and materializes them
//! with read-modify-write on sync/close, the way the original engine's
//! remote backends upload whole objects. Because a crashed rewrite can leave
//! a torn object, consolidation is reported unsupported and the manager
//! skips it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Result;
use crate::fs::StorageBackend;

pub struct BufferedFs<B> {
    inner: B,
    pending: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl<B: StorageBackend> BufferedFs<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Rewrite `path` as existing-bytes + pending-bytes through the inner
    /// backend. No-op when nothing is pending.
    fn flush_path(&self, path: &Path) -> Result<()> {
        let pending = match self.pending.lock().remove(path) {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => return Ok(()),
        };
        let mut whole = if self.inner.is_file(path) {
            let size = self.inner.file_size(path)? as usize;
            let mut existing = vec![0u8; size];
            self.inner.read(path, 0, &mut existing)?;
            self.inner.delete_file(path)?;
            existing
        } else {
            Vec::new()
        };
        whole.extend_from_slice(&pending);
        self.inner.write(path, &whole)?;
        self.inner.close(path)
    }
}

impl<B: StorageBackend> StorageBackend for BufferedFs<B> {
    fn is_dir(&self, path: &Path) -> bool {
        self.inner.is_dir(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.inner.is_file(path) || self.pending.lock().contains_key(path)
    }

    fn list_dirs(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.inner.list_dirs(path)
    }

    fn list_files(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.inner.list_files(path)
    }

    fn current_dir(&self) -> Result<PathBuf> {
        self.inner.current_dir()
    }

    fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        self.inner.canonicalize(path)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        let buffered = self
            .pending
            .lock()
            .get(path)
            .map(|b| b.len() as u64)
            .unwrap_or(0);
        let on_disk = if self.inner.is_file(path) {
            self.inner.file_size(path)?
        } else {
            0
        };
        Ok(on_disk + buffered)
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        self.inner.create_dir(path)
    }

    fn delete_dir(&self, path: &Path) -> Result<()> {
        self.pending.lock().retain(|p, _| !p.starts_with(path));
        self.inner.delete_dir(path)
    }

    fn create_file(&self, path: &Path, mode: u32) -> Result<()> {
        self.inner.create_file(path, mode)
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        self.pending.lock().remove(path);
        self.inner.delete_file(path)
    }

    fn move_path(&self, old_path: &Path, new_path: &Path) -> Result<()> {
        self.flush_path(old_path)?;
        self.inner.move_path(old_path, new_path)
    }

    fn read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<()> {
        // A reader must observe its own unflushed appends.
        self.flush_path(path)?;
        self.inner.read(path, offset, buf)
    }

    fn write(&self, path: &Path, buf: &[u8]) -> Result<()> {
        self.pending
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .extend_from_slice(buf);
        Ok(())
    }

    fn sync(&self, path: &Path) -> Result<()> {
        self.flush_path(path)?;
        self.inner.sync(path)
    }

    fn close(&self, path: &Path) -> Result<()> {
        self.flush_path(path)?;
        self.inner.close(path)
    }

    fn supports_consolidation(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadMethod;
    use crate::fs::PosixFs;
    use tempfile::TempDir;

    fn buffered() -> (TempDir, BufferedFs<PosixFs>) {
        (
            TempDir::new().unwrap(),
            BufferedFs::new(PosixFs::new(ReadMethod::ReadIo)),
        )
    }

    #[test]
    fn test_append_emulation() {
        let (dir, backend) = buffered();
        let path = dir.path().join("obj.tdb");

        backend.write(&path, b"aaa").unwrap();
        assert_eq!(backend.file_size(&path).unwrap(), 3);
        backend.sync(&path).unwrap();

        // Second round of appends triggers read-modify-write
        backend.write(&path, b"bbb").unwrap();
        backend.close(&path).unwrap();

        let mut buf = [0u8; 6];
        backend.read(&path, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"aaabbb");
    }

    #[test]
    fn test_read_flushes_pending() {
        let (dir, backend) = buffered();
        let path = dir.path().join("obj.tdb");
        backend.write(&path, b"xyz").unwrap();

        let mut buf = [0u8; 3];
        backend.read(&path, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"xyz");
    }

    #[test]
    fn test_no_consolidation() {
        let (_dir, backend) = buffered();
        assert!(!backend.supports_consolidation());
    }
}
