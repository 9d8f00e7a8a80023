//! Snapshot archives.
//!
//! A snapshot is stored as `<root>/<snapshot-id>/<source-volume-id>.tar.std`,
//! a tar stream of the volume directory compressed with zstd.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::csi;
use crate::error::{Error, Result};
use crate::volume::base_name;

/// File name suffix of snapshot archives.
pub const SNAPSHOT_EXT: &str = ".tar.std";

/// Creates and restores volume archives.
pub trait Archiver: Send + Sync {
    /// Archive the contents of `src_dir` into a new file at `archive`.
    fn create(&self, src_dir: &Path, archive: &Path) -> Result<()>;

    /// Unpack `archive` into the existing directory `dest_dir`.
    fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<()>;

    /// Sum of the sizes of all archive members.
    fn content_size(&self, archive: &Path) -> Result<i64>;
}

/// The archiver for this build.
pub fn default_archiver() -> Arc<dyn Archiver> {
    #[cfg(feature = "snapshots")]
    {
        Arc::new(TarZstdArchiver::default())
    }
    #[cfg(not(feature = "snapshots"))]
    {
        Arc::new(DisabledArchiver)
    }
}

/// Writes tar streams through a zstd encoder.
#[cfg(feature = "snapshots")]
#[derive(Debug, Clone, Copy)]
pub struct TarZstdArchiver {
    level: i32,
}

#[cfg(feature = "snapshots")]
impl Default for TarZstdArchiver {
    fn default() -> Self {
        Self {
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

#[cfg(feature = "snapshots")]
impl TarZstdArchiver {
    fn write_archive(&self, src_dir: &Path, archive: &Path) -> io::Result<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(archive)?;
        let encoder = zstd::Encoder::new(file, self.level)?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", src_dir)?;
        let file = builder.into_inner()?.finish()?;
        file.sync_all()
    }
}

#[cfg(feature = "snapshots")]
impl Archiver for TarZstdArchiver {
    fn create(&self, src_dir: &Path, archive: &Path) -> Result<()> {
        if let Err(e) = self.write_archive(src_dir, archive) {
            // Leave no half-written archive behind.
            if e.kind() != io::ErrorKind::AlreadyExists {
                crate::driver::log_cleanup_error("remove partial archive", || {
                    fs::remove_file(archive)
                });
            }
            return Err(Error::Archive {
                operation: "create",
                archive: archive.to_path_buf(),
                message: e.to_string(),
            });
        }
        Ok(())
    }

    fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<()> {
        let unpack = || -> io::Result<()> {
            let decoder = zstd::Decoder::new(fs::File::open(archive)?)?;
            let mut tar = tar::Archive::new(decoder);
            tar.set_preserve_permissions(true);
            tar.unpack(dest_dir)
        };
        unpack().map_err(|e| Error::Archive {
            operation: "extract",
            archive: archive.to_path_buf(),
            message: e.to_string(),
        })
    }

    fn content_size(&self, archive: &Path) -> Result<i64> {
        let sum = || -> io::Result<u64> {
            let decoder = zstd::Decoder::new(fs::File::open(archive)?)?;
            let mut tar = tar::Archive::new(decoder);
            let mut total = 0u64;
            for entry in tar.entries()? {
                total += entry?.header().size()?;
            }
            Ok(total)
        };
        let total = sum().map_err(|e| Error::Archive {
            operation: "read",
            archive: archive.to_path_buf(),
            message: e.to_string(),
        })?;
        i64::try_from(total).map_err(|_| Error::Archive {
            operation: "read",
            archive: archive.to_path_buf(),
            message: format!("content size {total} overflows"),
        })
    }
}

/// Stand-in used when snapshot support is compiled out.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledArchiver;

impl Archiver for DisabledArchiver {
    fn create(&self, _src_dir: &Path, _archive: &Path) -> Result<()> {
        Err(Error::SnapshotsDisabled)
    }

    fn extract(&self, _archive: &Path, _dest_dir: &Path) -> Result<()> {
        Err(Error::SnapshotsDisabled)
    }

    fn content_size(&self, _archive: &Path) -> Result<i64> {
        Err(Error::SnapshotsDisabled)
    }
}

/// A snapshot archive found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub archive: PathBuf,
}

impl SnapshotRecord {
    /// Record for an archive, named by its parent directory.
    fn from_archive(archive: PathBuf) -> Option<Self> {
        let source_volume_id = base_name(&archive).strip_suffix(SNAPSHOT_EXT)?.to_string();
        let snapshot_id = base_name(archive.parent()?);
        Some(Self {
            snapshot_id,
            source_volume_id,
            archive,
        })
    }

    /// Build the wire object: archive change time and content size.
    pub fn to_proto(&self, archiver: &dyn Archiver) -> Result<csi::Snapshot> {
        let meta = fs::metadata(&self.archive).map_err(|e| Error::path("stat", &self.archive, e))?;
        let size_bytes = archiver.content_size(&self.archive)?;
        Ok(csi::Snapshot {
            size_bytes,
            snapshot_id: self.snapshot_id.clone(),
            source_volume_id: self.source_volume_id.clone(),
            creation_time: Some(csi::Timestamp {
                seconds: meta.ctime(),
                nanos: meta.ctime_nsec() as i32,
            }),
            ready_to_use: true,
            group_snapshot_id: String::new(),
        })
    }
}

/// Path of the archive for `source_volume_id` in snapshot `snapshot_id`.
pub fn archive_path(root: &Path, snapshot_id: &str, source_volume_id: &str) -> PathBuf {
    root.join(snapshot_id)
        .join(format!("{source_volume_id}{SNAPSHOT_EXT}"))
}

/// The archive inside one snapshot directory, if any.
pub fn find_in_dir(snapshot_dir: &Path) -> Result<Option<SnapshotRecord>> {
    let mut archives = Vec::new();
    collect_archives(snapshot_dir, &mut archives)?;
    let snapshot_id = base_name(snapshot_dir);
    Ok(archives.pop().and_then(|archive| {
        SnapshotRecord::from_archive(archive).map(|record| SnapshotRecord {
            snapshot_id,
            ..record
        })
    }))
}

/// Every archive under `root`, sorted by snapshot id.
pub fn scan(root: &Path) -> Result<Vec<SnapshotRecord>> {
    let mut archives = Vec::new();
    collect_archives(root, &mut archives)?;
    let mut records: Vec<_> = archives
        .into_iter()
        .filter_map(SnapshotRecord::from_archive)
        .collect();
    records.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
    Ok(records)
}

fn collect_archives(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::path("read directory", dir, e)),
    };
    let mut paths = entries
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| Error::path("read directory", dir, e))?;
    paths.sort();

    for path in paths {
        let file_type = fs::symlink_metadata(&path)
            .map_err(|e| Error::path("stat", &path, e))?
            .file_type();
        if file_type.is_dir() {
            collect_archives(&path, out)?;
        } else if base_name(&path).ends_with(SNAPSHOT_EXT) {
            out.push(path);
        }
    }
    Ok(())
}
