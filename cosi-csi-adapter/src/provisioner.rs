//! Volume provisioner.
//!
//! Owns every filesystem and mount action for one volume. On-disk layout:
//!
//! ```text
//! {data_root}/{volume_id}/                   volume root
//! {data_root}/{volume_id}/metadata.json      persisted record, not exposed
//! {data_root}/{volume_id}/bucket/            bind mount source
//! {data_root}/{volume_id}/bucket/protocolConn.json
//! {data_root}/{volume_id}/bucket/credentials
//! ```
//!
//! Raw filesystem and mount primitives are behind the [`FileSystem`] and
//! [`Mounter`] traits so the provisioner runs unchanged against the host
//! ([`crate::platform`]) or in memory (the `fake` module).

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::platform::{BindMounter, HostFileSystem};
use crate::types::{BUCKET_DIR_NAME, METADATA_FILE_NAME, Metadata};

/// Permissions of directories created under the data root.
pub const DIR_MODE: u32 = 0o750;
/// Permissions of files written under the data root.
pub const FILE_MODE: u32 = 0o640;

/// Raw filesystem operations.
pub trait FileSystem: Send + Sync {
    /// Create `path` and any missing parents with `mode`.
    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Create `path` exclusively and write `data` to it.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] if the file exists.
    fn write_new(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Remove an empty directory.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    /// Remove a directory and everything below it.
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> io::Result<bool>;
}

/// Bind mount primitives.
pub trait Mounter: Send + Sync {
    /// Whether `path` is a mount point.
    ///
    /// Fails with [`io::ErrorKind::NotFound`] if `path` does not exist.
    fn is_mount_point(&self, path: &Path) -> io::Result<bool>;

    fn bind_mount(&self, source: &Path, target: &Path) -> io::Result<()>;

    /// Unmount `target`. Unmounting a path that is not mounted succeeds.
    fn unmount(&self, target: &Path) -> io::Result<()>;
}

/// Filesystem-level actions for volumes under one data root.
#[derive(Clone)]
pub struct Provisioner {
    data_root: PathBuf,
    fs: Arc<dyn FileSystem>,
    mounter: Arc<dyn Mounter>,
}

impl Provisioner {
    pub fn new(
        data_root: impl Into<PathBuf>,
        fs: Arc<dyn FileSystem>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            data_root: data_root.into(),
            fs,
            mounter,
        }
    }

    /// Provisioner backed by the host filesystem and `mount --bind`.
    pub fn host(data_root: impl Into<PathBuf>) -> Self {
        Self::new(
            data_root,
            Arc::new(HostFileSystem),
            Arc::new(BindMounter::default()),
        )
    }

    /// Root directory of a volume.
    ///
    /// The volume ID becomes a single path component, so it must not be
    /// empty, contain a separator, or be a relative component.
    pub fn volume_path(&self, volume_id: &str) -> Result<PathBuf, ProvisionError> {
        if volume_id.is_empty()
            || volume_id == "."
            || volume_id == ".."
            || volume_id.contains('/')
            || volume_id.contains('\0')
        {
            return Err(ProvisionError::InvalidVolumeId(volume_id.to_string()));
        }
        Ok(self.data_root.join(volume_id))
    }

    /// Bucket subdirectory of a volume (the bind mount source).
    pub fn bucket_path(&self, volume_id: &str) -> Result<PathBuf, ProvisionError> {
        Ok(self.volume_path(volume_id)?.join(BUCKET_DIR_NAME))
    }

    /// Whether a publish of `volume_id` ran to completion.
    ///
    /// The metadata record is the last thing a publish writes, so a volume
    /// directory without it is leftover from an interrupted call.
    pub fn is_published(&self, volume_id: &str) -> Result<bool, ProvisionError> {
        let path = self.volume_path(volume_id)?.join(METADATA_FILE_NAME);
        self.fs
            .exists(&path)
            .map_err(|source| ProvisionError::Stat { path, source })
    }

    /// Create the bucket subdirectory and its parents.
    pub fn create_bucket_dir(&self, volume_id: &str) -> Result<PathBuf, ProvisionError> {
        let path = self.bucket_path(volume_id)?;
        debug!(path = %path.display(), "Creating bucket directory");
        self.fs
            .create_dir_all(&path, DIR_MODE)
            .map_err(|source| ProvisionError::MkdirFailed {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// Write `name` into the bucket subdirectory. Never overwrites.
    pub fn write_bucket_file(
        &self,
        data: &[u8],
        volume_id: &str,
        name: &str,
    ) -> Result<(), ProvisionError> {
        let path = self.bucket_path(volume_id)?.join(name);
        self.write_new(&path, data)
    }

    /// Write `name` into the volume root. Never overwrites.
    pub fn write_volume_file(
        &self,
        data: &[u8],
        volume_id: &str,
        name: &str,
    ) -> Result<(), ProvisionError> {
        let path = self.volume_path(volume_id)?.join(name);
        self.write_new(&path, data)
    }

    fn write_new(&self, path: &Path, data: &[u8]) -> Result<(), ProvisionError> {
        debug!(path = %path.display(), bytes = data.len(), "Writing file");
        self.fs
            .write_new(path, data, FILE_MODE)
            .map_err(|source| match source.kind() {
                io::ErrorKind::AlreadyExists => ProvisionError::FileExists {
                    path: path.to_path_buf(),
                },
                _ => ProvisionError::WriteFile {
                    path: path.to_path_buf(),
                    source,
                },
            })
    }

    /// Bind mount the bucket subdirectory of `volume_id` onto `target`.
    ///
    /// `target` is created if missing. A target that is already a mount
    /// point is rejected rather than stacked on.
    pub fn mount_bind(&self, volume_id: &str, target: &Path) -> Result<(), ProvisionError> {
        let source = self.bucket_path(volume_id)?;

        let mounted = match self.mounter.is_mount_point(target) {
            Ok(mounted) => mounted,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(target = %target.display(), "Creating mount target");
                self.fs.create_dir_all(target, DIR_MODE).map_err(|source| {
                    ProvisionError::MkdirForMount {
                        path: target.to_path_buf(),
                        source,
                    }
                })?;
                false
            }
            Err(source) => {
                return Err(ProvisionError::MountCheck {
                    path: target.to_path_buf(),
                    source,
                });
            }
        };

        if mounted {
            return Err(ProvisionError::AlreadyMounted {
                path: target.to_path_buf(),
            });
        }

        info!(
            source = %source.display(),
            target = %target.display(),
            "Creating bind mount"
        );
        self.mounter
            .bind_mount(&source, target)
            .map_err(|e| ProvisionError::MountFailed {
                from: source,
                to: target.to_path_buf(),
                source: e,
            })
    }

    /// Unmount `target` if mounted and remove the mount point directory.
    ///
    /// A target that does not exist is already clean.
    pub fn unmount(&self, target: &Path) -> Result<(), ProvisionError> {
        let mounted = match self.mounter.is_mount_point(target) {
            Ok(mounted) => mounted,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(target = %target.display(), "Mount target does not exist");
                return Ok(());
            }
            Err(source) => {
                return Err(ProvisionError::MountCheck {
                    path: target.to_path_buf(),
                    source,
                });
            }
        };

        if mounted {
            info!(target = %target.display(), "Unmounting");
            self.mounter
                .unmount(target)
                .map_err(|source| ProvisionError::UnmountFailed {
                    path: target.to_path_buf(),
                    source,
                })?;
        } else {
            warn!(target = %target.display(), "Target is not a mount point, removing directory only");
        }

        match self.fs.remove_dir(target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ProvisionError::RemoveFailed {
                path: target.to_path_buf(),
                source,
            }),
        }
    }

    /// Recursively remove the bucket subdirectory, keeping the volume root
    /// and its metadata record.
    pub fn remove_bucket_dir(&self, volume_id: &str) -> Result<(), ProvisionError> {
        let path = self.bucket_path(volume_id)?;
        debug!(path = %path.display(), "Removing bucket directory");
        match self.fs.remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ProvisionError::RemoveFailed { path, source }),
        }
    }

    /// Recursively remove the volume root.
    pub fn remove_volume(&self, volume_id: &str) -> Result<(), ProvisionError> {
        let path = self.volume_path(volume_id)?;
        debug!(path = %path.display(), "Removing volume directory");
        match self.fs.remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Volume directory already removed");
                Ok(())
            }
            Err(source) => Err(ProvisionError::RemoveFailed { path, source }),
        }
    }

    /// Read the persisted metadata record, `None` if it was never written.
    pub fn read_metadata(&self, volume_id: &str) -> Result<Option<Metadata>, ProvisionError> {
        let path = self.volume_path(volume_id)?.join(METADATA_FILE_NAME);
        let data = match self.fs.read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ProvisionError::ReadMetadata { path, source }),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| ProvisionError::DecodeMetadata { path, source })
    }

    pub fn write_metadata(&self, volume_id: &str, metadata: &Metadata) -> Result<(), ProvisionError> {
        let data = serde_json::to_vec(metadata).map_err(ProvisionError::EncodeMetadata)?;
        self.write_volume_file(&data, volume_id, METADATA_FILE_NAME)
    }
}
