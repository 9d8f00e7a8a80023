//! Error types for the CSI driver.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tonic::Status;

pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for validating required fields.
///
/// Returns `INVALID_ARGUMENT` status if the field is missing or empty.
pub trait Require<T> {
    fn require(self, name: &str) -> std::result::Result<T, Status>;
}

impl Require<String> for String {
    fn require(self, name: &str) -> std::result::Result<String, Status> {
        if self.is_empty() {
            Err(Status::invalid_argument(format!("{name} is required")))
        } else {
            Ok(self)
        }
    }
}

impl<T> Require<T> for Option<T> {
    fn require(self, name: &str) -> std::result::Result<T, Status> {
        self.ok_or_else(|| Status::invalid_argument(format!("{name} is required")))
    }
}

/// CSI driver errors with structured context.
#[derive(Debug, Error)]
pub enum Error {
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    #[error("storage pool {0} not found")]
    StoragePoolNotFound(String),

    #[error("Could not get file information from {path}: {source}")]
    PathNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "snapshot with the same name: {0} but with different SourceVolumeId already exist"
    )]
    SnapshotConflict(String),

    #[error("volume {volume_id} already exists in storage pool {pool}")]
    VolumeConflict { volume_id: String, pool: String },

    /// Names must be a single path component.
    #[error("invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("invalid endpoint: {endpoint}")]
    InvalidEndpoint { endpoint: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid storage pool configuration: {0}")]
    InvalidStoragePools(String),

    /// The starting token names no entry in a non-empty listing.
    #[error("starting token {0} does not match any entry")]
    InvalidStartingToken(String),

    /// The starting token cannot be applied to the listing at all.
    #[error("{0}")]
    AbortedStartingToken(String),

    #[error("failed to mount device: {mount_source} at {target}: {message}")]
    Mount {
        mount_source: PathBuf,
        target: PathBuf,
        message: String,
    },

    #[error("unmount target path {target}: {source}")]
    Unmount {
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("too many mount options: {count} exceeds maximum of {max}")]
    TooManyMountOptions { count: usize, max: usize },

    #[error("failed to {operation} archive {archive}: {message}")]
    Archive {
        operation: &'static str,
        archive: PathBuf,
        message: String,
    },

    #[error("snapshot support is not enabled")]
    SnapshotsDisabled,

    #[error("Unable to determine capacity: {0}")]
    Capacity(String),

    #[error("failed to stat filesystem at {path}: {message}")]
    FsStats { path: PathBuf, message: String },

    #[error("mount table query for {path} failed: {message}")]
    MountTable { path: PathBuf, message: String },

    #[error("{operation} {path}: {source}")]
    Path {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an I/O error with the operation and path it came from.
    pub fn path(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Path {
            operation,
            path: path.into(),
            source,
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match &err {
            // NOT_FOUND: Volume, snapshot or pool does not exist
            Error::VolumeNotFound(_)
            | Error::SnapshotNotFound(_)
            | Error::StoragePoolNotFound(_)
            | Error::PathNotFound { .. } => tonic::Status::not_found(err.to_string()),

            // ALREADY_EXISTS: Name reused for another volume or pool
            Error::SnapshotConflict(_) | Error::VolumeConflict { .. } => {
                tonic::Status::already_exists(err.to_string())
            }

            // ABORTED: Pagination token cannot be used with this listing
            Error::AbortedStartingToken(_) => tonic::Status::aborted(err.to_string()),

            // UNAVAILABLE: Plugin is misconfigured
            Error::InvalidConfig(_) | Error::InvalidStoragePools(_) => {
                tonic::Status::unavailable(err.to_string())
            }

            // UNIMPLEMENTED: Compiled without snapshot support
            Error::SnapshotsDisabled => tonic::Status::unimplemented(err.to_string()),

            // INVALID_ARGUMENT: Client provided invalid input
            Error::InvalidEndpoint { .. }
            | Error::InvalidName { .. }
            | Error::InvalidStartingToken(_)
            | Error::TooManyMountOptions { .. } => tonic::Status::invalid_argument(err.to_string()),

            // INTERNAL: Filesystem and subprocess failures
            Error::Mount { .. }
            | Error::Unmount { .. }
            | Error::Archive { .. }
            | Error::Capacity(_)
            | Error::FsStats { .. }
            | Error::MountTable { .. }
            | Error::Path { .. }
            | Error::Io(_)
            | Error::Json(_) => tonic::Status::internal(err.to_string()),
        }
    }
}
