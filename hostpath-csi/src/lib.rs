//! hostpath-csi: CSI driver for directory-backed storage pools.
//!
//! This crate implements the Container Storage Interface (CSI) specification
//! to expose directories on a single node as volumes. Volumes live in named
//! storage pools, can be snapshotted into compressed archives and are bind
//! mounted into workloads.

// Generated protobuf code has doc formatting issues
#![allow(clippy::doc_overindented_list_items)]
#![allow(clippy::doc_lazy_continuation)]
// tonic::Status is large by design (176 bytes)
#![allow(clippy::result_large_err)]

pub mod controller;
pub mod driver;
pub mod error;
pub mod health;
pub mod identity;
pub mod mount;
pub mod node;
pub mod paginate;
pub mod pool;
pub mod snapshot;
pub mod types;
pub mod volume;

pub mod csi {
    tonic::include_proto!("csi.v1");

    pub use prost_types::Timestamp;

    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("csi_descriptor");
}

pub use driver::{Config, Driver};
pub use error::{Error, Result};
pub use pool::StoragePool;
pub use types::Endpoint;

#[cfg(test)]
pub(crate) mod test_util;
