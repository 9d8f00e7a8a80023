//! Mount backend.
//!
//! The node service only talks to [`Mounter`]; [`SystemMounter`] runs the
//! host's `mount`/`umount` and reads the kernel mount table.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};

/// Maximum number of mount options accepted for one mount.
pub const MOUNT_OPTIONS_MAX: usize = 32;

const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

pub trait Mounter: Send + Sync {
    /// Whether `path` is the target of a mount.
    ///
    /// Fails with [`io::ErrorKind::NotFound`] when `path` does not exist.
    fn is_mount_point(&self, path: &Path) -> io::Result<bool>;

    fn mount(&self, source: &Path, target: &Path, fs_type: &str, options: &[String]) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SystemMounter {
    mountinfo: PathBuf,
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self {
            mountinfo: PathBuf::from(MOUNTINFO_PATH),
        }
    }
}

impl SystemMounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mounter for SystemMounter {
    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        fs::symlink_metadata(path)?;
        let path = fs::canonicalize(path)?;
        let table = fs::read_to_string(&self.mountinfo)?;
        Ok(mount_points(&table).any(|mount_point| mount_point == path))
    }

    fn mount(&self, source: &Path, target: &Path, fs_type: &str, options: &[String]) -> Result<()> {
        if options.len() > MOUNT_OPTIONS_MAX {
            return Err(Error::TooManyMountOptions {
                count: options.len(),
                max: MOUNT_OPTIONS_MAX,
            });
        }

        let mount_error = |message: String| Error::Mount {
            mount_source: source.to_path_buf(),
            target: target.to_path_buf(),
            message,
        };

        let mut cmd = Command::new("mount");
        if !fs_type.is_empty() {
            cmd.args(["-t", fs_type]);
        }
        for opt in options {
            cmd.args(["-o", opt]);
        }
        cmd.arg(source).arg(target);
        debug!(source = %source.display(), target = %target.display(), ?options, "mount");

        let output = cmd.output().map_err(|e| mount_error(e.to_string()))?;
        if !output.status.success() {
            return Err(mount_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        debug!(target = %target.display(), "umount");
        let output = Command::new("umount")
            .arg(target)
            .output()
            .map_err(|e| Error::Unmount {
                target: target.to_path_buf(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::Unmount {
                target: target.to_path_buf(),
                source: io::Error::other(stderr),
            });
        }
        Ok(())
    }
}

/// Mount points listed in a `mountinfo` table.
///
/// The fifth field is the mount point, with whitespace octal-escaped.
fn mount_points(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    table
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape_octal(field)))
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
