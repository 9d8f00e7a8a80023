//! Volume health and filesystem capacity probing.
//!
//! Controller-side checks look at the volume directory. Node-side checks look
//! at the published target path and require it to be a mount point. Both then
//! apply the same space and inode exhaustion rule.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::csi;
use crate::error::{Error, Result};
use crate::volume::check_path_exists;

pub const MSG_SOURCE_MISSING: &str = "The source path of the volume doesn't exist";
pub const MSG_NOT_MOUNTED: &str = "The volume isn't mounted";
pub const MSG_NO_SPACE: &str = "No space left on device";
pub const MSG_NO_INODES: &str = "No inodes remaining on device";

/// Filesystem usage of the filesystem holding a path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStats {
    pub available: i64,
    pub capacity: i64,
    pub used: i64,
    pub inodes: i64,
    pub inodes_free: i64,
    pub inodes_used: i64,
}

/// Source of filesystem statistics.
pub trait FsStatsProvider: Send + Sync {
    fn stats(&self, path: &Path) -> Result<FsStats>;
}

/// Reads statistics with `statvfs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProvider;

impl FsStatsProvider for StatvfsProvider {
    fn stats(&self, path: &Path) -> Result<FsStats> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(|e| Error::FsStats {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let block_size = stat.fragment_size() as i64;
        let blocks = stat.blocks() as i64;
        let blocks_free = stat.blocks_free() as i64;
        let files = stat.files() as i64;
        let files_free = stat.files_free() as i64;

        Ok(FsStats {
            available: stat.blocks_available() as i64 * block_size,
            capacity: blocks * block_size,
            used: (blocks - blocks_free) * block_size,
            inodes: files,
            inodes_free: files_free,
            inodes_used: files - files_free,
        })
    }
}

/// Mount table queries used by health checks and startup diagnostics.
pub trait MountPointChecker: Send + Sync {
    /// Whether `path` is itself the target of a mount.
    fn is_mount_point(&self, path: &Path) -> Result<bool>;

    /// Source device of the filesystem containing `path`.
    fn source_device(&self, path: &Path) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct FindmntOutput {
    #[serde(default)]
    filesystems: Vec<FindmntEntry>,
}

#[derive(Debug, Deserialize)]
struct FindmntEntry {
    target: String,
    #[serde(default)]
    source: String,
}

/// Queries the mount table by running `findmnt --json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FindmntChecker;

impl FindmntChecker {
    fn run(path: &Path, args: &[&str]) -> Result<Option<Vec<FindmntEntry>>> {
        let mount_table_error = |message: String| Error::MountTable {
            path: path.to_path_buf(),
            message,
        };

        let output = Command::new("findmnt")
            .args(args)
            .arg(path)
            .arg("--json")
            .output()
            .map_err(|e| mount_table_error(format!("findmnt: {e}")))?;

        // findmnt exits 1 without output when nothing matches.
        if output.status.code() == Some(1) && output.stdout.is_empty() {
            return Ok(None);
        }
        if !output.status.success() {
            return Err(mount_table_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(Some(parse_findmnt(&output.stdout).map_err(|e| {
            mount_table_error(format!("failed to parse the mount infos: {e}"))
        })?))
    }
}

fn parse_findmnt(stdout: &[u8]) -> Result<Vec<FindmntEntry>> {
    let parsed: FindmntOutput = serde_json::from_slice(stdout)?;
    if parsed.filesystems.is_empty() {
        return Err(Error::Io(std::io::Error::other("failed to get mount info")));
    }
    Ok(parsed.filesystems)
}

impl MountPointChecker for FindmntChecker {
    fn is_mount_point(&self, path: &Path) -> Result<bool> {
        let Some(entries) = Self::run(path, &[])? else {
            return Ok(false);
        };
        Ok(entries.iter().any(|entry| Path::new(&entry.target) == path))
    }

    fn source_device(&self, path: &Path) -> Result<String> {
        let entries = Self::run(path, &["-T"])?.ok_or_else(|| Error::MountTable {
            path: path.to_path_buf(),
            message: "no filesystem found".to_string(),
        })?;
        entries
            .into_iter()
            .next()
            .map(|entry| strip_bind_suffix(&entry.source).to_string())
            .ok_or_else(|| Error::MountTable {
                path: path.to_path_buf(),
                message: "no filesystem found".to_string(),
            })
    }
}

/// `/dev/sda1[/var/lib]` names the device `/dev/sda1`.
fn strip_bind_suffix(source: &str) -> &str {
    match source.find('[') {
        Some(index) => &source[..index],
        None => source,
    }
}

/// Outcome of a health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHealth {
    pub healthy: bool,
    /// Empty when healthy.
    pub message: String,
}

impl VolumeHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: String::new(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

impl From<VolumeHealth> for csi::VolumeCondition {
    fn from(health: VolumeHealth) -> Self {
        csi::VolumeCondition {
            abnormal: !health.healthy,
            message: health.message,
        }
    }
}

/// Health and capacity checks over injectable backends.
#[derive(Clone)]
pub struct HealthProbe {
    stats: Arc<dyn FsStatsProvider>,
    mounts: Arc<dyn MountPointChecker>,
}

impl HealthProbe {
    pub fn new(stats: Arc<dyn FsStatsProvider>, mounts: Arc<dyn MountPointChecker>) -> Self {
        Self { stats, mounts }
    }

    pub fn stats(&self, path: &Path) -> Result<FsStats> {
        self.stats.stats(path)
    }

    /// Check a volume directory: it must exist and have free space.
    pub fn check_controller_side(&self, volume_path: &Path) -> VolumeHealth {
        match check_path_exists(volume_path) {
            Ok(true) => self.check_space(volume_path),
            Ok(false) => VolumeHealth::unhealthy(MSG_SOURCE_MISSING),
            Err(e) => VolumeHealth::unhealthy(e.to_string()),
        }
    }

    /// Check a published path: it must be mounted and have free space.
    pub fn check_node_side(&self, volume_path: &Path) -> VolumeHealth {
        match self.mounts.is_mount_point(volume_path) {
            Ok(true) => self.check_space(volume_path),
            Ok(false) => VolumeHealth::unhealthy(MSG_NOT_MOUNTED),
            Err(e) => VolumeHealth::unhealthy(e.to_string()),
        }
    }

    pub fn check_space(&self, path: &Path) -> VolumeHealth {
        let stats = match self.stats.stats(path) {
            Ok(stats) => stats,
            Err(e) => return VolumeHealth::unhealthy(e.to_string()),
        };
        debug!(
            path = %path.display(),
            available = stats.available,
            capacity = stats.capacity,
            inodes_free = stats.inodes_free,
            "filesystem usage"
        );

        if stats.available == 0 {
            VolumeHealth::unhealthy(MSG_NO_SPACE)
        } else if stats.inodes_free == 0 {
            VolumeHealth::unhealthy(MSG_NO_INODES)
        } else {
            VolumeHealth::healthy()
        }
    }

    /// Whether two paths live on the same source device.
    pub fn shares_device(&self, a: &Path, b: &Path) -> Result<bool> {
        Ok(self.mounts.source_device(a)? == self.mounts.source_device(b)?)
    }
}

impl std::fmt::Debug for HealthProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProbe").finish_non_exhaustive()
    }
}
