//! Local POSIX filesystem backend

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::config::ReadMethod;
use crate::error::{Result, StoreError};
use crate::fs::{map_io, StorageBackend, MAX_WRITE_BYTES};

/// Backend over the local filesystem.
///
/// Append writes keep one open handle per path in a mutex-protected map so
/// that successive tile appends do not reopen the file. Reads either open
/// the file per call (plain reads) or go through a cached memory map.
pub struct PosixFs {
    read_method: ReadMethod,
    write_handles: Mutex<HashMap<PathBuf, File>>,
    read_maps: Mutex<HashMap<PathBuf, memmap2::Mmap>>,
}

impl PosixFs {
    pub fn new(read_method: ReadMethod) -> Self {
        Self {
            read_method,
            write_handles: Mutex::new(HashMap::new()),
            read_maps: Mutex::new(HashMap::new()),
        }
    }

    fn read_plain(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = File::open(path).map_err(|e| map_io(e, path))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| map_io(e, path))?;
        file.read_exact(buf).map_err(|e| map_io(e, path))
    }

    fn read_mmap(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut maps = self.read_maps.lock();
        if !maps.contains_key(path) {
            let file = File::open(path).map_err(|e| map_io(e, path))?;
            // Safety contract: the engine never writes a file it has open
            // for reading, so the mapping cannot observe a mutation.
            let map = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| map_io(e, path))?;
            maps.insert(path.to_path_buf(), map);
        }
        let map = &maps[path];
        let start = offset as usize;
        let end = start + buf.len();
        if end > map.len() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read at {} in {}", offset, path.display()),
            )));
        }
        buf.copy_from_slice(&map[start..end]);
        Ok(())
    }
}

impl StorageBackend for PosixFs {
    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn list_dirs(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| map_io(e, path))? {
            let entry = entry.map_err(|e| map_io(e, path))?;
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn list_files(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| map_io(e, path))? {
            let entry = entry.map_err(|e| map_io(e, path))?;
            if entry.path().is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    fn current_dir(&self) -> Result<PathBuf> {
        std::env::current_dir().map_err(StoreError::Io)
    }

    fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            return Ok(normalize(path));
        }
        Ok(normalize(&self.current_dir()?.join(path)))
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        let meta = fs::metadata(path).map_err(|e| map_io(e, path))?;
        if !meta.is_file() {
            return Err(StoreError::InvalidArg(format!(
                "{} is not a file",
                path.display()
            )));
        }
        Ok(meta.len())
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        if path.exists() {
            return Err(StoreError::AlreadyExists(path.display().to_string()));
        }
        fs::create_dir_all(path).map_err(|e| map_io(e, path))
    }

    fn delete_dir(&self, path: &Path) -> Result<()> {
        // Drop cached read maps under the doomed directory first.
        self.read_maps.lock().retain(|p, _| !p.starts_with(path));
        self.write_handles.lock().retain(|p, _| !p.starts_with(path));
        fs::remove_dir_all(path).map_err(|e| map_io(e, path))
    }

    fn create_file(&self, path: &Path, mode: u32) -> Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        let file = options.open(path).map_err(|e| map_io(e, path))?;
        file.sync_all().map_err(|e| map_io(e, path))
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        self.read_maps.lock().remove(path);
        self.write_handles.lock().remove(path);
        fs::remove_file(path).map_err(|e| map_io(e, path))
    }

    fn move_path(&self, old_path: &Path, new_path: &Path) -> Result<()> {
        if new_path.exists() {
            return Err(StoreError::AlreadyExists(new_path.display().to_string()));
        }
        fs::rename(old_path, new_path).map_err(|e| map_io(e, old_path))
    }

    fn read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        match self.read_method {
            ReadMethod::Mmap => self.read_mmap(path, offset, buf),
            _ => self.read_plain(path, offset, buf),
        }
    }

    fn write(&self, path: &Path, buf: &[u8]) -> Result<()> {
        let mut handles = self.write_handles.lock();
        if !handles.contains_key(path) {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .map_err(|e| map_io(e, path))?;
            handles.insert(path.to_path_buf(), file);
        }
        let file = handles.get_mut(path).expect("handle just inserted");
        for chunk in buf.chunks(MAX_WRITE_BYTES) {
            file.write_all(chunk).map_err(|e| map_io(e, path))?;
        }
        Ok(())
    }

    fn sync(&self, path: &Path) -> Result<()> {
        if let Some(file) = self.write_handles.lock().get_mut(path) {
            return file.sync_all().map_err(|e| map_io(e, path));
        }
        // Syncing a directory makes freshly created entries durable.
        if path.is_dir() {
            #[cfg(unix)]
            {
                let dir = File::open(path).map_err(|e| map_io(e, path))?;
                return dir.sync_all().map_err(|e| map_io(e, path));
            }
        }
        Ok(())
    }

    fn close(&self, path: &Path) -> Result<()> {
        if let Some(mut file) = self.write_handles.lock().remove(path) {
            file.flush().map_err(|e| map_io(e, path))?;
            file.sync_all().map_err(|e| map_io(e, path))?;
        }
        self.read_maps.lock().remove(path);
        Ok(())
    }

    fn supports_consolidation(&self) -> bool {
        true
    }
}

/// Lexically normalize `.` and `..` components of an absolute path.
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fs_at(method: ReadMethod) -> (TempDir, PosixFs) {
        (TempDir::new().unwrap(), PosixFs::new(method))
    }

    #[test]
    fn test_append_and_read_plain() {
        let (dir, backend) = fs_at(ReadMethod::ReadIo);
        let path = dir.path().join("data.tdb");
        backend.write(&path, b"hello ").unwrap();
        backend.write(&path, b"world").unwrap();
        backend.close(&path).unwrap();

        assert_eq!(backend.file_size(&path).unwrap(), 11);
        let mut buf = [0u8; 5];
        backend.read(&path, 6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn test_read_mmap() {
        let (dir, backend) = fs_at(ReadMethod::Mmap);
        let path = dir.path().join("data.tdb");
        backend.write(&path, b"0123456789").unwrap();
        backend.close(&path).unwrap();

        let mut buf = [0u8; 4];
        backend.read(&path, 3, &mut buf).unwrap();
        assert_eq!(&buf, b"3456");

        // Past EOF is a short read
        let mut buf = [0u8; 4];
        assert!(backend.read(&path, 8, &mut buf).is_err());
    }

    #[test]
    fn test_create_file_exclusive() {
        let (dir, backend) = fs_at(ReadMethod::ReadIo);
        let path = dir.path().join("__sentinel");
        backend.create_file(&path, 0o644).unwrap();
        let err = backend.create_file(&path, 0o644).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn test_dirs_and_listing() {
        let (dir, backend) = fs_at(ReadMethod::ReadIo);
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        backend.create_dir(&a).unwrap();
        backend.create_dir(&b).unwrap();
        backend.write(&dir.path().join("f.tdb"), b"x").unwrap();
        backend.close(&dir.path().join("f.tdb")).unwrap();

        assert_eq!(backend.list_dirs(dir.path()).unwrap(), vec![a.clone(), b]);
        assert_eq!(backend.list_files(dir.path()).unwrap().len(), 1);

        backend.delete_dir(&a).unwrap();
        assert!(!backend.is_dir(&a));
    }

    #[test]
    fn test_move_refuses_overwrite() {
        let (dir, backend) = fs_at(ReadMethod::ReadIo);
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        backend.create_dir(&src).unwrap();
        backend.create_dir(&dst).unwrap();
        assert!(backend.move_path(&src, &dst).is_err());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }
}
