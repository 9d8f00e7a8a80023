//! hostpath-csi: CSI driver for directory-backed storage pools.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hostpath_csi::driver::{
    DEFAULT_DATA_DIR, DEFAULT_ENDPOINT, DEFAULT_SNAPSHOT_DIR, DRIVER_NAME, DRIVER_VERSION,
};
use hostpath_csi::{Config, Driver, StoragePool};

#[derive(Parser, Debug)]
#[command(name = "hostpath-csi")]
#[command(about = "CSI driver for directory-backed storage pools")]
#[command(disable_version_flag = true)]
struct Args {
    /// CSI endpoint (unix:// or tcp://).
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Name of the driver.
    #[arg(long = "drivername", default_value = DRIVER_NAME)]
    driver_name: String,

    /// Storage pools: a directory, or a JSON list of {"name", "path"} objects.
    #[arg(long = "datadir", default_value = DEFAULT_DATA_DIR)]
    data_dir: String,

    /// Pool used when a request names none and no legacy pool exists.
    #[arg(long = "defaultpool")]
    default_pool: Option<String>,

    /// Directory holding snapshot archives.
    #[arg(long = "snapshotdir", default_value = DEFAULT_SNAPSHOT_DIR)]
    snapshot_dir: PathBuf,

    /// Node ID.
    #[arg(long = "nodeid", env = "NODE_NAME")]
    node_id: Option<String>,

    /// Version reported by the driver.
    #[arg(long = "version", default_value = DRIVER_VERSION)]
    version: String,

    /// Verbosity level (0-4).
    #[arg(short, default_value = "0")]
    v: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Use targeted filters to avoid verbose logs from dependencies (h2, tonic, hyper).
    let filter = match args.v {
        0 => "warn".to_string(),
        1 => "hostpath_csi=info,warn".to_string(),
        2 => "hostpath_csi=debug,warn".to_string(),
        3 => "hostpath_csi=trace,warn".to_string(),
        _ => "hostpath_csi=trace,info".to_string(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let mut config = Config {
        name: args.driver_name,
        version: args.version,
        endpoint: args.endpoint,
        storage_pools: StoragePool::parse_data_dir(&args.data_dir)?,
        default_pool: args.default_pool,
        snapshot_dir: args.snapshot_dir,
        ..Default::default()
    };
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }

    info!(
        name = %config.name,
        version = %config.version,
        node_id = %config.node_id,
        endpoint = %config.endpoint,
        pools = config.storage_pools.len(),
        "starting hostpath CSI driver"
    );

    let driver = Driver::new(config)?;
    driver.run().await?;

    Ok(())
}
