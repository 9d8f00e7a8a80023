//! Volume and snapshot directory utilities.
//!
//! Volumes are plain directories `<pool>/<volume-id>`; snapshots are
//! directories `<snapshot-root>/<snapshot-id>` holding one archive.

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::pool::StoragePools;

/// Permission bits for volume, snapshot and target directories.
pub const DIR_MODE: u32 = 0o750;

const BYTES_PER_MIB: i64 = 1024 * 1024;
const BYTES_PER_GIB: i64 = 1024 * BYTES_PER_MIB;
/// Smallest multiple of a unit that may be reported in that unit.
const MIN_UNITS: i64 = 10;

/// A volume directory found while listing pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDir {
    pub pool: String,
    pub path: PathBuf,
}

impl VolumeDir {
    /// The volume id, i.e. the directory base name.
    pub fn volume_id(&self) -> String {
        base_name(&self.path)
    }
}

impl AsRef<Path> for VolumeDir {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Create a directory (and any missing parents) with [`DIR_MODE`].
pub fn create_dir(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
        .map_err(|e| Error::path("create directory", path, e))
}

/// Create the directory backing a volume.
pub fn create_volume_dir(path: &Path) -> Result<()> {
    create_dir(path)?;
    debug!(path = %path.display(), "created volume directory");
    Ok(())
}

/// Create the directory holding a snapshot archive.
pub fn create_snapshot_dir(path: &Path) -> Result<()> {
    create_dir(path)?;
    debug!(path = %path.display(), "created snapshot directory");
    Ok(())
}

/// Remove a directory tree. A missing directory is not an error.
pub fn remove_dir_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::path("remove directory", path, e)),
    }
}

/// Delete a volume directory tree.
pub fn delete_volume_dir(path: &Path) -> Result<()> {
    remove_dir_tree(path)?;
    debug!(path = %path.display(), "deleted volume directory");
    Ok(())
}

/// Whether a path exists. Errors other than NotFound are reported.
pub fn check_path_exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::path("stat", path, e)),
    }
}

/// Every volume directory across every pool, sorted by full path.
///
/// Missing pool directories contribute nothing.
pub fn list_volume_dirs(pools: &StoragePools) -> Result<Vec<VolumeDir>> {
    let mut dirs = Vec::new();
    for pool in pools.iter() {
        let entries = match fs::read_dir(&pool.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::path("read directory", &pool.path, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::path("read directory", &pool.path, e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| Error::path("stat", entry.path(), e))?;
            if file_type.is_dir() {
                dirs.push(VolumeDir {
                    pool: pool.name.clone(),
                    path: entry.path(),
                });
            }
        }
    }
    dirs.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(dirs)
}

/// Final component of a path as a string.
pub fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Round a byte count down to whole GiB or MiB.
///
/// The largest unit that still leaves at least ten units is used. Smaller
/// values are returned unchanged.
pub fn round_down_capacity_pretty(bytes: i64) -> i64 {
    for unit in [BYTES_PER_GIB, BYTES_PER_MIB] {
        let units = bytes / unit;
        if units >= MIN_UNITS {
            return units * unit;
        }
    }
    bytes
}

/// Mode bits of a path and its ancestors, for mount failure diagnostics.
pub fn describe_path_modes(path: &Path) -> String {
    path.ancestors()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| match fs::metadata(p) {
            Ok(meta) => {
                use std::os::unix::fs::PermissionsExt;
                format!("{}: {:o}", p.display(), meta.permissions().mode() & 0o7777)
            }
            Err(e) => format!("{}: {e}", p.display()),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
