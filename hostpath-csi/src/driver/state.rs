//! Driver state management.
//!
//! This module contains DriverState which manages:
//! - Volume directory lifecycle across storage pools
//! - Snapshot archive lifecycle
//! - Bind mounts of volumes into target paths
//! - Capacity and health queries
//!
//! Every method here blocks on the filesystem or a subprocess. Services call
//! them through [`run_blocking`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::csi;
use crate::error::{Error, Result};
use crate::health::{FsStats, FsStatsProvider, HealthProbe, MountPointChecker, VolumeHealth};
use crate::mount::{Mounter, SystemMounter};
use crate::pool::{PoolLookup, StoragePool, StoragePools, is_plain_name};
use crate::snapshot::{self, Archiver, SnapshotRecord};
use crate::volume::{
    VolumeDir, check_path_exists, create_dir, create_snapshot_dir, create_volume_dir,
    delete_volume_dir, describe_path_modes, list_volume_dirs, remove_dir_tree,
    round_down_capacity_pretty,
};

use super::{Config, TOPOLOGY_KEY_NODE, log_cleanup_error};

/// Run blocking work off the async runtime.
pub(crate) async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(io::Error::other(format!("task join error: {e}"))))?
}

/// Host-facing backends the driver talks through.
#[derive(Clone)]
pub struct Backends {
    pub mounter: Arc<dyn Mounter>,
    pub archiver: Arc<dyn Archiver>,
    pub stats: Arc<dyn FsStatsProvider>,
    pub mounts: Arc<dyn MountPointChecker>,
}

impl Backends {
    /// Backends that act on the running host.
    pub fn system() -> Self {
        Self {
            mounter: Arc::new(SystemMounter::new()),
            archiver: snapshot::default_archiver(),
            stats: Arc::new(crate::health::StatvfsProvider),
            mounts: Arc::new(crate::health::FindmntChecker),
        }
    }
}

/// Where a snapshot listing draws its entries from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFilter<'a> {
    All,
    SnapshotId(&'a str),
    SourceVolumeId(&'a str),
}

/// Shared driver state.
pub struct DriverState {
    pub config: Config,
    pub pools: StoragePools,
    pub health: HealthProbe,
    mounter: Arc<dyn Mounter>,
    archiver: Arc<dyn Archiver>,
}

impl DriverState {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_backends(config, Backends::system())
    }

    pub fn with_backends(config: Config, backends: Backends) -> Result<Self> {
        config.validate()?;
        let pools = StoragePools::new(config.storage_pools.clone(), config.default_pool.clone())?;
        Ok(Self {
            config,
            pools,
            health: HealthProbe::new(backends.stats, backends.mounts),
            mounter: backends.mounter,
            archiver: backends.archiver,
        })
    }

    pub fn snapshot_root(&self) -> &Path {
        &self.config.snapshot_dir
    }

    /// The single topology segment naming this node.
    pub fn node_topology(&self) -> csi::Topology {
        csi::Topology {
            segments: [(TOPOLOGY_KEY_NODE.to_string(), self.config.node_id.clone())].into(),
        }
    }

    /// Whether accessibility requirements admit this node.
    ///
    /// No requirements admit every node. Otherwise some requisite or
    /// preferred segment must name this node.
    pub fn accepts_topology(&self, requirement: Option<&csi::TopologyRequirement>) -> bool {
        let Some(requirement) = requirement else {
            return true;
        };
        requirement
            .requisite
            .iter()
            .chain(requirement.preferred.iter())
            .any(|topology| {
                topology.segments.get(TOPOLOGY_KEY_NODE) == Some(&self.config.node_id)
            })
    }

    // === Capacity ===

    /// Capacity advertised for volumes in a pool, rounded down.
    pub fn pool_capacity(&self, pool: &StoragePool) -> Result<i64> {
        let stats = self
            .health
            .stats(&pool.path)
            .map_err(|e| Error::Capacity(e.to_string()))?;
        Ok(round_down_capacity_pretty(stats.capacity))
    }

    /// Raw filesystem statistics of a pool.
    pub fn pool_stats(&self, pool: &StoragePool) -> Result<FsStats> {
        self.health
            .stats(&pool.path)
            .map_err(|e| Error::Capacity(e.to_string()))
    }

    // === Volumes ===

    /// Locate a volume directory by id across all pools.
    pub fn find_volume(&self, volume_id: &str) -> Option<(&StoragePool, PathBuf)> {
        self.pools.find_volume(volume_id)
    }

    /// Create the directory of a volume unless it already exists.
    ///
    /// Returns the volume path and whether this call created it. Volume
    /// names are unique across pools: a name already used in another pool
    /// is a conflict.
    pub fn create_volume(&self, name: &str, pool: &StoragePool) -> Result<(PathBuf, bool)> {
        check_name("volume", name)?;
        if let Some((existing, path)) = self.find_volume(name) {
            if existing.name != pool.name {
                return Err(Error::VolumeConflict {
                    volume_id: name.to_string(),
                    pool: existing.name.clone(),
                });
            }
            debug!(volume_id = name, pool = %pool.name, "volume already exists");
            return Ok((path, false));
        }

        let path = pool.volume_path(name);
        if check_path_exists(&path)? {
            // Something other than a directory holds the name.
            return Err(Error::VolumeConflict {
                volume_id: name.to_string(),
                pool: pool.name.clone(),
            });
        }
        create_volume_dir(&path)?;
        info!(volume_id = name, pool = %pool.name, path = %path.display(), "volume created");
        Ok((path, true))
    }

    /// Delete a volume directory. Unknown volumes are ignored.
    pub fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let Some((pool, path)) = self.find_volume(volume_id) else {
            debug!(volume_id, "volume not found, nothing to delete");
            return Ok(());
        };
        delete_volume_dir(&path)?;
        info!(volume_id, pool = %pool.name, "volume deleted");
        Ok(())
    }

    /// Every volume directory, sorted by full path.
    ///
    /// A snapshot root placed inside a pool is not a volume.
    pub fn list_volumes(&self) -> Result<Vec<VolumeDir>> {
        let mut dirs = list_volume_dirs(&self.pools)?;
        dirs.retain(|dir| dir.path != self.config.snapshot_dir);
        Ok(dirs)
    }

    /// Capacity of the pool a volume directory belongs to.
    pub fn volume_capacity(&self, dir: &VolumeDir) -> Result<i64> {
        match self.pools.lookup(&dir.pool) {
            PoolLookup::Found(pool) => self.pool_capacity(pool),
            PoolLookup::NotFound => Err(Error::StoragePoolNotFound(dir.pool.clone())),
        }
    }

    /// Controller-side health of a volume directory.
    pub fn volume_health(&self, volume_path: &Path) -> VolumeHealth {
        let health = self.health.check_controller_side(volume_path);
        debug!(path = %volume_path.display(), healthy = health.healthy, "volume health");
        health
    }

    // === Snapshots ===

    fn snapshot_dir(&self, snapshot_id: &str) -> PathBuf {
        self.snapshot_root().join(snapshot_id)
    }

    /// Archive a volume into a snapshot.
    ///
    /// Repeating the call for the same source volume returns the existing
    /// snapshot. Reusing the name for another volume is a conflict.
    pub fn create_snapshot(&self, name: &str, source_volume_id: &str) -> Result<csi::Snapshot> {
        check_name("snapshot", name)?;
        let snapshot_dir = self.snapshot_dir(name);

        if let Some(existing) = snapshot::find_in_dir(&snapshot_dir)? {
            if existing.source_volume_id != source_volume_id {
                return Err(Error::SnapshotConflict(name.to_string()));
            }
            debug!(snapshot_id = name, "snapshot already exists");
            return existing.to_proto(self.archiver.as_ref());
        }

        let (_, volume_path) = self
            .find_volume(source_volume_id)
            .ok_or_else(|| Error::VolumeNotFound(source_volume_id.to_string()))?;

        create_snapshot_dir(&snapshot_dir)?;
        let archive = snapshot::archive_path(self.snapshot_root(), name, source_volume_id);
        if let Err(e) = self.archiver.create(&volume_path, &archive) {
            log_cleanup_error("remove snapshot dir after archive failure", || {
                remove_dir_tree(&snapshot_dir)
            });
            return Err(e);
        }

        info!(snapshot_id = name, source_volume_id, "snapshot created");
        let record = SnapshotRecord {
            snapshot_id: name.to_string(),
            source_volume_id: source_volume_id.to_string(),
            archive,
        };
        record.to_proto(self.archiver.as_ref())
    }

    /// Remove a snapshot directory. Unknown snapshots are ignored.
    pub fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        if !is_plain_name(snapshot_id) {
            debug!(snapshot_id, "not a snapshot name, nothing to delete");
            return Ok(());
        }
        remove_dir_tree(&self.snapshot_dir(snapshot_id))?;
        info!(snapshot_id, "snapshot deleted");
        Ok(())
    }

    /// Snapshots matching a filter, sorted by id.
    ///
    /// Archives that cannot be read are skipped.
    pub fn list_snapshots(&self, filter: SnapshotFilter<'_>) -> Result<Vec<csi::Snapshot>> {
        let records = match filter {
            SnapshotFilter::SnapshotId(id) if !is_plain_name(id) => Vec::new(),
            SnapshotFilter::SnapshotId(id) => snapshot::find_in_dir(&self.snapshot_dir(id))?
                .into_iter()
                .collect(),
            SnapshotFilter::SourceVolumeId(source) => snapshot::scan(self.snapshot_root())?
                .into_iter()
                .filter(|record| record.source_volume_id == source)
                .collect(),
            SnapshotFilter::All => snapshot::scan(self.snapshot_root())?,
        };

        Ok(records
            .iter()
            .filter_map(|record| match record.to_proto(self.archiver.as_ref()) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(snapshot_id = %record.snapshot_id, error = %e, "skipping unreadable snapshot");
                    None
                }
            })
            .collect())
    }

    pub fn get_snapshot(&self, snapshot_id: &str) -> Result<csi::Snapshot> {
        self.list_snapshots(SnapshotFilter::SnapshotId(snapshot_id))?
            .pop()
            .ok_or_else(|| Error::SnapshotNotFound(snapshot_id.to_string()))
    }

    /// Unpack a snapshot archive into a volume directory.
    pub fn restore_snapshot(&self, snapshot_id: &str, volume_path: &Path) -> Result<()> {
        if !is_plain_name(snapshot_id) {
            return Err(Error::SnapshotNotFound(snapshot_id.to_string()));
        }
        let record = snapshot::find_in_dir(&self.snapshot_dir(snapshot_id))?
            .ok_or_else(|| Error::SnapshotNotFound(snapshot_id.to_string()))?;
        self.archiver.extract(&record.archive, volume_path)?;
        info!(snapshot_id, path = %volume_path.display(), "snapshot restored");
        Ok(())
    }

    // === Node operations ===

    /// Bind mount a volume onto a target path.
    ///
    /// The target is created when missing. An existing mount is left alone.
    pub fn publish_volume(
        &self,
        volume_id: &str,
        target_path: &Path,
        fs_type: &str,
        readonly: bool,
    ) -> Result<()> {
        let (_, source) = self
            .find_volume(volume_id)
            .ok_or_else(|| Error::VolumeNotFound(volume_id.to_string()))?;

        match self.mounter.is_mount_point(target_path) {
            Ok(true) => {
                debug!(volume_id, target = %target_path.display(), "target already mounted");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => create_dir(target_path)?,
            Err(e) => return Err(Error::path("check target path", target_path, e)),
        }

        let mut options = vec!["bind".to_string()];
        if readonly {
            options.push("ro".to_string());
        }

        self.mounter
            .mount(&source, target_path, fs_type, &options)
            .map_err(|e| match e {
                Error::Mount {
                    mount_source,
                    target,
                    message,
                } => Error::Mount {
                    message: format!("{message}; target modes: {}", describe_path_modes(&target)),
                    mount_source,
                    target,
                },
                other => other,
            })?;

        info!(volume_id, target = %target_path.display(), readonly, "volume published");
        Ok(())
    }

    /// Unmount a target path if mounted, then remove it.
    pub fn unpublish_volume(&self, volume_id: &str, target_path: &Path) -> Result<()> {
        match self.mounter.is_mount_point(target_path) {
            Ok(true) => self.mounter.unmount(target_path)?,
            Ok(false) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::path("check target path", target_path, e)),
        }
        remove_dir_tree(target_path)?;
        info!(volume_id, target = %target_path.display(), "volume unpublished");
        Ok(())
    }

    /// Usage and node-side health of a published volume path.
    pub fn volume_stats(&self, volume_path: &Path) -> Result<(FsStats, VolumeHealth)> {
        std::fs::metadata(volume_path).map_err(|source| Error::PathNotFound {
            path: volume_path.to_path_buf(),
            source,
        })?;

        let health = self.health.check_node_side(volume_path);
        if !health.healthy {
            warn!(path = %volume_path.display(), message = %health.message, "volume not healthy");
        }
        let stats = self.health.stats(volume_path)?;
        Ok((stats, health))
    }

    // === Startup diagnostics ===

    /// Warn about pools on the same device as the plugin socket.
    ///
    /// Filling such a pool fills the node's root filesystem.
    pub fn check_shared_paths(&self, socket_dir: &Path) {
        for pool in self.pools.iter() {
            match self.health.shares_device(&pool.path, socket_dir) {
                Ok(true) => warn!(
                    pool = %pool.name,
                    path = %pool.path.display(),
                    "storage pool shares path with OS which can lead to node disk pressure"
                ),
                Ok(false) => debug!(pool = %pool.name, "storage pool on dedicated device"),
                Err(e) => warn!(pool = %pool.name, error = %e, "unable to check storage pool device"),
            }
        }
    }
}

fn check_name(kind: &'static str, name: &str) -> Result<()> {
    if is_plain_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}
