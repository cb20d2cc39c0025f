//! Host implementations of the provisioner capabilities
//!
//! Provides the Linux filesystem and bind mount primitives used by
//! [`crate::provisioner::Provisioner::host`].

mod linux;

pub use linux::{BindMounter, HostFileSystem, MOUNT_TABLE};
