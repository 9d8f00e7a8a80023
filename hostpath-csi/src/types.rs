//! Type-safe wrappers for CSI driver domain types.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// The listening endpoint of the gRPC server.
///
/// Parsed from `unix://<path>` or `tcp://<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    /// Parse an endpoint URI.
    ///
    /// A `unix://` endpoint must carry a non-empty path and a `tcp://`
    /// endpoint must carry a socket address with a valid port.
    pub fn parse(endpoint: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidEndpoint {
            endpoint: endpoint.to_string(),
        };

        if let Some(path) = endpoint.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(invalid());
            }
            // "unix://tmp/csi.sock" and "unix:///tmp/csi.sock" both name /tmp/csi.sock.
            let path = if path.starts_with('/') {
                PathBuf::from(path)
            } else {
                Path::new("/").join(path)
            };
            Ok(Self::Unix(path))
        } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
            addr.parse().map(Self::Tcp).map_err(|_| invalid())
        } else {
            Err(invalid())
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}
