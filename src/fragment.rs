//! Fragment naming and discovery
//!
//! A fragment is one atomic write: a directory named
//! `__<uuid>_<timestamp-ms>` inside the array directory. The directory only
//! becomes visible to readers once its `__fragment` sentinel exists, which
//! is the last thing a finalize creates.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::fs::StorageBackend;
use crate::schema::{ArraySchema, COORDS_NAME};

/// Marks a directory as a committed fragment
pub const FRAGMENT_SENTINEL: &str = "__fragment";

/// Suffix of every attribute data file
pub const FILE_SUFFIX: &str = ".tdb";

/// Suffix of the variable-value file of a variable attribute
pub const VAR_FILE_SUFFIX: &str = "_var.tdb";

/// Data file of an attribute inside a fragment directory
pub fn attr_file_name(schema: &ArraySchema, attribute_id: usize) -> String {
    if schema.is_coords(attribute_id) {
        format!("{}{}", COORDS_NAME, FILE_SUFFIX)
    } else {
        format!("{}{}", schema.attributes()[attribute_id].name, FILE_SUFFIX)
    }
}

/// Variable-value file of a variable attribute
pub fn attr_var_file_name(schema: &ArraySchema, attribute_id: usize) -> String {
    format!("{}{}", schema.attributes()[attribute_id].name, VAR_FILE_SUFFIX)
}

/// Produce a timestamp strictly greater than any produced before through
/// the same counter, so two fragments of one context can never collide.
pub fn unique_timestamp(counter: &AtomicU64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .map(|last| now.max(last + 1))
        .unwrap_or(now)
}

/// New fragment directory name
pub fn new_fragment_name(timestamp: u64) -> String {
    format!("__{}_{}", Uuid::new_v4().simple(), timestamp)
}

/// Timestamp encoded in a fragment directory name
pub fn fragment_timestamp(dir: &Path) -> Result<u64> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::InvalidArg(format!("bad fragment path {}", dir.display())))?;
    name.rsplit('_')
        .next()
        .and_then(|ts| ts.parse::<u64>().ok())
        .ok_or_else(|| StoreError::InvalidArg(format!("bad fragment name '{}'", name)))
}

/// True if `dir` is a committed fragment
pub fn is_fragment(fs: &dyn StorageBackend, dir: &Path) -> bool {
    fs.is_dir(dir) && fs.is_file(&dir.join(FRAGMENT_SENTINEL))
}

/// Committed fragments of an array, oldest first.
///
/// Uncommitted directories (no sentinel) are invisible; they belong to
/// in-flight or crashed writes.
pub fn list_fragments(fs: &dyn StorageBackend, array_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut fragments: Vec<(u64, PathBuf)> = Vec::new();
    for dir in fs.list_dirs(array_dir)? {
        if is_fragment(fs, &dir) {
            fragments.push((fragment_timestamp(&dir)?, dir));
        }
    }
    fragments.sort();
    Ok(fragments.into_iter().map(|(_, dir)| dir).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadMethod;
    use crate::fs::PosixFs;
    use tempfile::TempDir;

    #[test]
    fn test_unique_timestamps_monotonic() {
        let counter = AtomicU64::new(0);
        let a = unique_timestamp(&counter);
        let b = unique_timestamp(&counter);
        let c = unique_timestamp(&counter);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_fragment_name_roundtrip() {
        let name = new_fragment_name(1234567);
        assert!(name.starts_with("__"));
        assert_eq!(fragment_timestamp(Path::new(&name)).unwrap(), 1234567);
    }

    #[test]
    fn test_list_fragments_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        let fs = PosixFs::new(ReadMethod::ReadIo);

        let young = dir.path().join(new_fragment_name(2000));
        let old = dir.path().join(new_fragment_name(1000));
        let uncommitted = dir.path().join(new_fragment_name(3000));
        for d in [&young, &old, &uncommitted] {
            fs.create_dir(d).unwrap();
        }
        fs.create_file(&young.join(FRAGMENT_SENTINEL), 0o644).unwrap();
        fs.create_file(&old.join(FRAGMENT_SENTINEL), 0o644).unwrap();

        let fragments = list_fragments(&fs, dir.path()).unwrap();
        assert_eq!(fragments, vec![old, young]);
    }
}
