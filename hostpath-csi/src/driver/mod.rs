//! CSI driver implementation.
//!
//! This module contains the core driver components:
//! - `Config`: Driver configuration
//! - `Driver`: The main CSI driver that runs gRPC servers
//! - `DriverState`: Shared state and filesystem operations (in `state` submodule)

mod state;

pub use state::{Backends, DriverState, SnapshotFilter};
pub(crate) use state::run_blocking;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::controller::ControllerService;
use crate::csi::{
    FILE_DESCRIPTOR_SET, controller_server::ControllerServer, identity_server::IdentityServer,
    node_server::NodeServer,
};
use crate::error::{Error, Result};
use crate::identity::IdentityService;
use crate::mount::MOUNT_OPTIONS_MAX;
use crate::node::NodeService;
use crate::pool::{LEGACY_STORAGE_POOL, StoragePool};
use crate::types::Endpoint;
use crate::volume::create_dir;

/// Execute a cleanup operation, logging any errors without failing.
///
/// Use this for cleanup paths where we want to attempt recovery but
/// cannot let cleanup failures mask the original error.
pub(crate) fn log_cleanup_error<F, E>(operation: &str, f: F)
where
    F: FnOnce() -> std::result::Result<(), E>,
    E: std::fmt::Display,
{
    if let Err(e) = f() {
        warn!(operation, error = %e, "cleanup failed");
    }
}

pub const DRIVER_NAME: &str = "hostpath.csi.kubevirt.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Topology segment key naming the node a volume lives on.
pub const TOPOLOGY_KEY_NODE: &str = "topology.hostpath.csi/node";

pub const DEFAULT_ENDPOINT: &str = "unix:///csi/csi.sock";
pub const DEFAULT_DATA_DIR: &str = "/csi-data-dir";
pub const DEFAULT_SNAPSHOT_DIR: &str = "/csi-snapshot-dir";

// A read-only bind mount needs two options.
const _: () = assert!(MOUNT_OPTIONS_MAX >= 2);

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub version: String,
    pub node_id: String,
    pub endpoint: String,
    pub storage_pools: Vec<StoragePool>,
    /// Pool used when a request names none and no `legacy` pool exists.
    /// Defaults to the first configured pool.
    pub default_pool: Option<String>,
    pub snapshot_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: DRIVER_NAME.to_string(),
            version: DRIVER_VERSION.to_string(),
            node_id: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            storage_pools: vec![StoragePool::new(LEGACY_STORAGE_POOL, DEFAULT_DATA_DIR)],
            default_pool: None,
            snapshot_dir: PathBuf::from(DEFAULT_SNAPSHOT_DIR),
        }
    }
}

impl Config {
    /// Check that every required setting is present.
    ///
    /// Pool uniqueness is checked when the registry is built.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("no driver name provided".to_string()));
        }
        if self.node_id.is_empty() {
            return Err(Error::InvalidConfig("no node id provided".to_string()));
        }
        if self.endpoint.is_empty() {
            return Err(Error::InvalidConfig(
                "no driver endpoint provided".to_string(),
            ));
        }
        if self.version.is_empty() {
            return Err(Error::InvalidConfig("no version provided".to_string()));
        }
        if self.storage_pools.is_empty() {
            return Err(Error::InvalidStoragePools(
                "no storage pools provided".to_string(),
            ));
        }
        Endpoint::parse(&self.endpoint)?;
        Ok(())
    }
}

/// The CSI driver.
pub struct Driver {
    state: Arc<DriverState>,
}

impl Driver {
    /// Validate the configuration and create pool and snapshot directories.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_state(DriverState::new(config)?)
    }

    pub fn with_state(state: DriverState) -> Result<Self> {
        for pool in state.pools.iter() {
            info!(pool = %pool.name, path = %pool.path.display(), "storage pool");
            create_dir(&pool.path)?;
        }
        create_dir(&state.config.snapshot_dir)?;

        info!(
            name = %state.config.name,
            version = %state.config.version,
            node_id = %state.config.node_id,
            "driver initialized"
        );
        Ok(Self {
            state: Arc::new(state),
        })
    }

    pub fn state(&self) -> &Arc<DriverState> {
        &self.state
    }

    /// Run the CSI driver.
    pub async fn run(&self) -> Result<()> {
        let endpoint = Endpoint::parse(&self.state.config.endpoint)?;
        info!(%endpoint, "starting CSI driver");

        match endpoint {
            Endpoint::Unix(path) => self.run_unix(&path).await,
            Endpoint::Tcp(addr) => {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
                self.serve_grpc(incoming).await
            }
        }
    }

    async fn run_unix(&self, path: &Path) -> Result<()> {
        log_cleanup_error("remove stale socket", || match fs::remove_file(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        });
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::path("create directory", parent, e))?;

            let state = Arc::clone(&self.state);
            let parent = parent.to_path_buf();
            run_blocking(move || {
                state.check_shared_paths(&parent);
                Ok(())
            })
            .await?;
        }

        let listener = UnixListener::bind(path)?;
        let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);

        self.serve_grpc(incoming).await
    }

    async fn serve_grpc<S, IO, E>(&self, incoming: S) -> Result<()>
    where
        S: tokio_stream::Stream<Item = std::result::Result<IO, E>> + Send + 'static,
        IO: tokio::io::AsyncRead
            + tokio::io::AsyncWrite
            + tonic::transport::server::Connected
            + Send
            + Unpin
            + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        Server::builder()
            .add_service(reflection)
            .add_service(IdentityServer::new(IdentityService::new(
                self.state.clone(),
            )))
            .add_service(ControllerServer::new(ControllerService::new(
                self.state.clone(),
            )))
            .add_service(NodeServer::new(NodeService::new(self.state.clone())))
            .serve_with_incoming(incoming)
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        Ok(())
    }
}
