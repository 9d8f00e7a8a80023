//! Shared test utilities for CSI driver tests.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use crate::controller::ControllerService;
use crate::driver::{Backends, Config, DRIVER_NAME, DRIVER_VERSION, DriverState};
use crate::error::{Error, Result};
use crate::health::{FsStats, FsStatsProvider, MountPointChecker};
use crate::identity::IdentityService;
use crate::mount::Mounter;
use crate::node::NodeService;
use crate::pool::StoragePool;
use crate::snapshot;

/// Statistics of a roomy, healthy filesystem.
pub fn healthy_stats() -> FsStats {
    FsStats {
        available: 8 << 30,
        capacity: 20 << 30,
        used: 12 << 30,
        inodes: 1000,
        inodes_free: 900,
        inodes_used: 100,
    }
}

/// Filesystem statistics that tests can change or make fail.
pub struct FakeStats {
    stats: Mutex<std::result::Result<FsStats, String>>,
}

impl FakeStats {
    pub fn new(stats: FsStats) -> Self {
        Self {
            stats: Mutex::new(Ok(stats)),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            stats: Mutex::new(Err(message.to_string())),
        }
    }

    pub fn set(&self, stats: FsStats) {
        *self.stats.lock().unwrap() = Ok(stats);
    }

    pub fn fail(&self, message: &str) {
        *self.stats.lock().unwrap() = Err(message.to_string());
    }
}

impl FsStatsProvider for FakeStats {
    fn stats(&self, path: &Path) -> Result<FsStats> {
        self.stats.lock().unwrap().clone().map_err(|message| Error::FsStats {
            path: path.to_path_buf(),
            message,
        })
    }
}

/// Mount table answering the same for every path.
pub struct FakeMountChecker {
    mounted: std::result::Result<bool, String>,
    device: String,
}

impl FakeMountChecker {
    pub fn new(mounted: bool) -> Self {
        Self {
            mounted: Ok(mounted),
            device: "/dev/fake0".to_string(),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            mounted: Err(message.to_string()),
            device: String::new(),
        }
    }

    pub fn with_device(mut self, device: &str) -> Self {
        self.device = device.to_string();
        self
    }

    fn error(&self, path: &Path, message: &str) -> Error {
        Error::MountTable {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}

impl MountPointChecker for FakeMountChecker {
    fn is_mount_point(&self, path: &Path) -> Result<bool> {
        self.mounted.clone().map_err(|message| self.error(path, &message))
    }

    fn source_device(&self, path: &Path) -> Result<String> {
        match &self.mounted {
            Ok(_) => Ok(self.device.clone()),
            Err(message) => Err(self.error(path, message)),
        }
    }
}

/// A mount recorded by [`FakeMounter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

/// In-memory mount table.
#[derive(Default)]
pub struct FakeMounter {
    mounts: Mutex<Vec<FakeMount>>,
    mount_error: Mutex<Option<String>>,
}

impl FakeMounter {
    pub fn mounts(&self) -> Vec<FakeMount> {
        self.mounts.lock().unwrap().clone()
    }

    pub fn fail_mounts(&self, message: &str) {
        *self.mount_error.lock().unwrap() = Some(message.to_string());
    }
}

impl Mounter for FakeMounter {
    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        std::fs::symlink_metadata(path)?;
        Ok(self.mounts.lock().unwrap().iter().any(|m| m.target == path))
    }

    fn mount(&self, source: &Path, target: &Path, fs_type: &str, options: &[String]) -> Result<()> {
        if let Some(message) = self.mount_error.lock().unwrap().clone() {
            return Err(Error::Mount {
                mount_source: source.to_path_buf(),
                target: target.to_path_buf(),
                message,
            });
        }
        self.mounts.lock().unwrap().push(FakeMount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fs_type: fs_type.to_string(),
            options: options.to_vec(),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.mounts.lock().unwrap().retain(|m| m.target != target);
        Ok(())
    }
}

/// Test fixture providing isolated driver state for each test.
///
/// Two pools, `fast` (the default) and `slow`, live in a temp directory
/// together with the snapshot root.
pub struct TestFixture {
    pub state: Arc<DriverState>,
    pub mounter: Arc<FakeMounter>,
    pub stats: Arc<FakeStats>,
    temp_dir: TempDir,
}

impl TestFixture {
    pub const NODE_ID: &'static str = "test-node";

    pub fn new() -> Self {
        Self::with_mount_checker(FakeMountChecker::new(true))
    }

    pub fn with_mount_checker(mounts: FakeMountChecker) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mounter = Arc::new(FakeMounter::default());
        let stats = Arc::new(FakeStats::new(healthy_stats()));
        let backends = Backends {
            mounter: mounter.clone(),
            archiver: snapshot::default_archiver(),
            stats: stats.clone(),
            mounts: Arc::new(mounts),
        };

        let config = Self::config(temp_dir.path());
        for pool in &config.storage_pools {
            std::fs::create_dir_all(&pool.path).expect("failed to create pool dir");
        }
        std::fs::create_dir_all(&config.snapshot_dir).expect("failed to create snapshot dir");

        let state = Arc::new(
            DriverState::with_backends(config, backends).expect("failed to build driver state"),
        );
        Self {
            state,
            mounter,
            stats,
            temp_dir,
        }
    }

    pub fn config(root: &Path) -> Config {
        Config {
            name: DRIVER_NAME.to_string(),
            version: DRIVER_VERSION.to_string(),
            node_id: Self::NODE_ID.to_string(),
            endpoint: "unix:///tmp/test.sock".to_string(),
            storage_pools: vec![
                StoragePool::new("fast", root.join("fast")),
                StoragePool::new("slow", root.join("slow")),
            ],
            default_pool: None,
            snapshot_dir: root.join("snapshots"),
        }
    }

    /// Backends that never touch the host mount table.
    pub fn fake_backends() -> Backends {
        Backends {
            mounter: Arc::new(FakeMounter::default()),
            archiver: snapshot::default_archiver(),
            stats: Arc::new(FakeStats::new(healthy_stats())),
            mounts: Arc::new(FakeMountChecker::new(true)),
        }
    }

    /// A path inside the fixture's temp directory.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.temp_dir.path().join(relative)
    }

    pub fn identity_service(&self) -> IdentityService {
        IdentityService::new(Arc::clone(&self.state))
    }

    pub fn controller_service(&self) -> ControllerService {
        ControllerService::new(Arc::clone(&self.state))
    }

    pub fn node_service(&self) -> NodeService {
        NodeService::new(Arc::clone(&self.state))
    }
}
