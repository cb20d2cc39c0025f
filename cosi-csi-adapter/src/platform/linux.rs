//! Linux host implementation of the provisioner capabilities
//!
//! Uses:
//! - std::fs with explicit unix permissions for directories and files
//! - mount --bind / umount for bind mounts
//! - /proc/self/mounts for mount point detection

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, error, warn};

use crate::provisioner::{FileSystem, Mounter};

/// Mount table consulted for mount point detection.
pub const MOUNT_TABLE: &str = "/proc/self/mounts";

/// [`FileSystem`] over the host's std::fs.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostFileSystem;

impl FileSystem for HostFileSystem {
    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        DirBuilder::new().recursive(true).mode(mode).create(path)
    }

    fn write_new(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(path)?;
        file.write_all(data)?;
        file.sync_all()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        path.try_exists()
    }
}

/// [`Mounter`] shelling out to `mount --bind` and `umount`.
#[derive(Debug, Clone)]
pub struct BindMounter {
    mount_table: PathBuf,
}

impl Default for BindMounter {
    fn default() -> Self {
        Self {
            mount_table: PathBuf::from(MOUNT_TABLE),
        }
    }
}

impl Mounter for BindMounter {
    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        // Surfaces NotFound for a missing path before touching the table
        let path = fs::canonicalize(path)?;
        let table = fs::read_to_string(&self.mount_table)?;
        Ok(mount_points(&table).any(|mp| mp == path))
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> io::Result<()> {
        let output = Command::new("mount")
            .arg("--bind")
            .arg(source)
            .arg(target)
            .output()
            .inspect_err(|e| error!(error = %e, "Failed to execute mount --bind"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "bind mount failed");
            return Err(io::Error::other(format!(
                "mount --bind exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        let output = Command::new("umount")
            .arg(target)
            .output()
            .inspect_err(|e| error!(error = %e, "Failed to execute umount"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Treat "not mounted" as success
            if stderr.contains("not mounted") || stderr.contains("no mount point") {
                warn!(target = %target.display(), "Path was not mounted");
                return Ok(());
            }
            error!(stderr = %stderr, "umount failed");
            return Err(io::Error::other(format!(
                "umount exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        debug!(target = %target.display(), "Unmounted");
        Ok(())
    }
}

/// Mount points listed in a `/proc/mounts` formatted table.
fn mount_points(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
}

/// Undo the octal escaping the kernel applies to space, tab, newline and
/// backslash in mount table fields.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            // A leading digit above 3 would overflow a byte
            if digits[0] <= b'3' && digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u8, |acc, d| acc * 8 + (d - b'0'));
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
