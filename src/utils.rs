//! Workspace, group and directory management
//!
//! Every managed directory carries a sentinel file naming what it is, so
//! the helpers here refuse to touch directories the engine does not own.

use std::path::{Path, PathBuf};

use log::debug;

use crate::array::ARRAY_SENTINEL;
use crate::error::{Result, StoreError};
use crate::fragment::is_fragment;
use crate::fs::{StorageBackend, FILE_MODE};

/// Marks a directory as a workspace
pub const WORKSPACE_SENTINEL: &str = "__workspace";

/// Marks a directory as a group
pub const GROUP_SENTINEL: &str = "__group";

/// What a managed directory is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Workspace,
    Group,
    Array,
    Fragment,
}

pub fn is_workspace(fs: &dyn StorageBackend, dir: &Path) -> bool {
    fs.is_dir(dir) && fs.is_file(&dir.join(WORKSPACE_SENTINEL))
}

pub fn is_group(fs: &dyn StorageBackend, dir: &Path) -> bool {
    fs.is_dir(dir) && fs.is_file(&dir.join(GROUP_SENTINEL))
}

pub fn is_array(fs: &dyn StorageBackend, dir: &Path) -> bool {
    fs.is_dir(dir) && fs.is_file(&dir.join(ARRAY_SENTINEL))
}

/// Type of the object at `dir`, if the engine owns it
pub fn object_type(fs: &dyn StorageBackend, dir: &Path) -> Option<ObjectType> {
    if is_workspace(fs, dir) {
        Some(ObjectType::Workspace)
    } else if is_group(fs, dir) {
        Some(ObjectType::Group)
    } else if is_array(fs, dir) {
        Some(ObjectType::Array)
    } else if is_fragment(fs, dir) {
        Some(ObjectType::Fragment)
    } else {
        None
    }
}

/// Create a workspace. Workspaces cannot nest.
pub fn workspace_create(fs: &dyn StorageBackend, dir: &Path) -> Result<()> {
    if object_type(fs, dir).is_some() {
        return Err(StoreError::AlreadyExists(dir.display().to_string()));
    }
    let mut ancestor = dir.parent();
    while let Some(parent) = ancestor {
        if is_workspace(fs, parent) {
            return Err(StoreError::InvalidArg(format!(
                "{} lies inside workspace {}",
                dir.display(),
                parent.display()
            )));
        }
        ancestor = parent.parent();
    }
    if !fs.is_dir(dir) {
        fs.create_dir(dir)?;
    }
    fs.create_file(&dir.join(WORKSPACE_SENTINEL), FILE_MODE)?;
    fs.sync(dir)?;
    debug!("created workspace {}", dir.display());
    Ok(())
}

/// Create a group inside a workspace or another group
pub fn group_create(fs: &dyn StorageBackend, dir: &Path) -> Result<()> {
    if object_type(fs, dir).is_some() {
        return Err(StoreError::AlreadyExists(dir.display().to_string()));
    }
    dir.parent()
        .filter(|p| is_workspace(fs, p) || is_group(fs, p))
        .ok_or_else(|| {
            StoreError::InvalidArg(format!(
                "{} is not inside a workspace or group",
                dir.display()
            ))
        })?;
    if !fs.is_dir(dir) {
        fs.create_dir(dir)?;
    }
    fs.create_file(&dir.join(GROUP_SENTINEL), FILE_MODE)?;
    fs.sync(dir)?;
    debug!("created group {}", dir.display());
    Ok(())
}

/// Managed objects directly under `dir`
pub fn ls(fs: &dyn StorageBackend, dir: &Path) -> Result<Vec<(PathBuf, ObjectType)>> {
    let mut objects = Vec::new();
    for child in fs.list_dirs(dir)? {
        if let Some(kind) = object_type(fs, &child) {
            objects.push((child, kind));
        }
    }
    Ok(objects)
}

/// Workspaces directly under `dir`
pub fn ls_workspaces(fs: &dyn StorageBackend, dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(ls(fs, dir)?
        .into_iter()
        .filter(|(_, kind)| *kind == ObjectType::Workspace)
        .map(|(path, _)| path)
        .collect())
}

/// Empty an object without deleting it: an array loses its fragments, a
/// workspace or group loses the objects inside it.
pub fn clear(fs: &dyn StorageBackend, dir: &Path) -> Result<()> {
    match object_type(fs, dir) {
        Some(ObjectType::Array) => {
            for child in fs.list_dirs(dir)? {
                debug!("clearing fragment {}", child.display());
                fs.delete_dir(&child)?;
            }
            Ok(())
        }
        Some(ObjectType::Workspace) | Some(ObjectType::Group) => {
            for (child, _) in ls(fs, dir)? {
                debug!("clearing object {}", child.display());
                fs.delete_dir(&child)?;
            }
            Ok(())
        }
        Some(ObjectType::Fragment) | None => Err(StoreError::InvalidArg(format!(
            "{} is not a clearable object",
            dir.display()
        ))),
    }
}

/// Delete a managed object entirely
pub fn delete(fs: &dyn StorageBackend, dir: &Path) -> Result<()> {
    if object_type(fs, dir).is_none() {
        return Err(StoreError::InvalidArg(format!(
            "{} is not a managed object",
            dir.display()
        )));
    }
    fs.delete_dir(dir)
}

/// Rename a managed object
pub fn move_object(fs: &dyn StorageBackend, old_dir: &Path, new_dir: &Path) -> Result<()> {
    if object_type(fs, old_dir).is_none() {
        return Err(StoreError::InvalidArg(format!(
            "{} is not a managed object",
            old_dir.display()
        )));
    }
    fs.move_path(old_dir, new_dir)
}
