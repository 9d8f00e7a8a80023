//! Storage-pool registry.
//!
//! A storage pool is a named directory under which volume directories are
//! created. The registry is built once at startup and never changes.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Storage class parameter selecting the pool of a volume.
pub const STORAGE_POOL_PARAMETER: &str = "storagePool";
/// Pool name used when a request names no pool and for a plain data directory.
pub const LEGACY_STORAGE_POOL: &str = "legacy";

/// A named backing directory for volumes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoragePool {
    pub name: String,
    pub path: PathBuf,
}

impl StoragePool {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Parse the data directory setting.
    ///
    /// Accepts either a JSON array of `{"name", "path"}` descriptors or a
    /// single directory path, which becomes the `legacy` pool.
    pub fn parse_data_dir(data_dir: &str) -> Result<Vec<StoragePool>> {
        let trimmed = data_dir.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidStoragePools(
                "no data directory provided".to_string(),
            ));
        }
        if trimmed.starts_with('[') {
            let pools: Vec<StoragePool> = serde_json::from_str(trimmed).map_err(|e| {
                Error::InvalidStoragePools(format!("unable to parse storage pool info: {e}"))
            })?;
            return Ok(pools);
        }
        Ok(vec![StoragePool::new(LEGACY_STORAGE_POOL, trimmed)])
    }

    /// Directory of the volume with the given name inside this pool.
    pub fn volume_path(&self, volume_id: &str) -> PathBuf {
        self.path.join(volume_id)
    }
}

/// Result of looking a pool up by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolLookup<'a> {
    Found(&'a StoragePool),
    NotFound,
}

/// Immutable map of pool name to pool.
#[derive(Debug, Clone)]
pub struct StoragePools {
    pools: Vec<StoragePool>,
    by_name: HashMap<String, usize>,
    default_pool: String,
}

impl StoragePools {
    /// Build the registry, checking that names and paths are unique.
    ///
    /// The default pool is `default_pool` when given, otherwise the first pool.
    pub fn new(pools: Vec<StoragePool>, default_pool: Option<String>) -> Result<Self> {
        if pools.is_empty() {
            return Err(Error::InvalidStoragePools(
                "at least one storage pool is required".to_string(),
            ));
        }

        let mut by_name = HashMap::with_capacity(pools.len());
        let mut paths = HashSet::with_capacity(pools.len());
        for (index, pool) in pools.iter().enumerate() {
            if pool.name.is_empty() {
                return Err(Error::InvalidStoragePools(
                    "storage pool name is empty".to_string(),
                ));
            }
            if pool.path.as_os_str().is_empty() {
                return Err(Error::InvalidStoragePools(format!(
                    "storage pool {} has an empty path",
                    pool.name
                )));
            }
            if by_name.insert(pool.name.clone(), index).is_some() {
                return Err(Error::InvalidStoragePools(format!(
                    "duplicate storage pool name {}",
                    pool.name
                )));
            }
            if !paths.insert(pool.path.clone()) {
                return Err(Error::InvalidStoragePools(format!(
                    "duplicate storage pool path {}",
                    pool.path.display()
                )));
            }
        }

        let default_pool = default_pool.unwrap_or_else(|| pools[0].name.clone());
        if !by_name.contains_key(&default_pool) {
            return Err(Error::StoragePoolNotFound(default_pool));
        }

        Ok(Self {
            pools,
            by_name,
            default_pool,
        })
    }

    pub fn lookup(&self, name: &str) -> PoolLookup<'_> {
        match self.by_name.get(name) {
            Some(&index) => PoolLookup::Found(&self.pools[index]),
            None => PoolLookup::NotFound,
        }
    }

    /// Resolve the pool named by the request parameters.
    ///
    /// An explicit `storagePool` parameter must name a known pool. Without it
    /// the `legacy` pool is used if configured, otherwise the default pool.
    pub fn resolve(&self, parameters: &HashMap<String, String>) -> Result<&StoragePool> {
        if let Some(name) = parameters.get(STORAGE_POOL_PARAMETER) {
            return match self.lookup(name) {
                PoolLookup::Found(pool) => Ok(pool),
                PoolLookup::NotFound => Err(Error::StoragePoolNotFound(name.clone())),
            };
        }

        match self.lookup(LEGACY_STORAGE_POOL) {
            PoolLookup::Found(pool) => Ok(pool),
            PoolLookup::NotFound => match self.lookup(&self.default_pool) {
                PoolLookup::Found(pool) => Ok(pool),
                PoolLookup::NotFound => Err(Error::StoragePoolNotFound(self.default_pool.clone())),
            },
        }
    }

    /// Find the pool holding a volume directory with the given name.
    pub fn find_volume(&self, volume_id: &str) -> Option<(&StoragePool, PathBuf)> {
        if !is_plain_name(volume_id) {
            return None;
        }
        self.pools.iter().find_map(|pool| {
            let path = pool.volume_path(volume_id);
            path.is_dir().then_some((pool, path))
        })
    }

    pub fn default_pool(&self) -> &str {
        &self.default_pool
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoragePool> {
        self.pools.iter()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

/// A single path component: no separators, not `.` or `..`.
pub(crate) fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}
