//! Error types for the resolver, credential assembler, provisioner and
//! lifecycle engine.
//!
//! Every error knows the gRPC code it surfaces as; conversion into a
//! [`tonic::Status`] happens only at the RPC boundary.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tonic::{Code, Status};

use crate::types::{ResourceKind, UnrecognizedProtocol, VolumeContextError};

// ============================================================================
// ClientError
// ============================================================================

/// Failure reported by a [`crate::client::ResourceClient`].
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("request for {kind} '{name}' failed: {message}")]
    Api {
        kind: ResourceKind,
        name: String,
        message: String,
    },

    #[error("request for {kind} '{name}' timed out after {timeout:?}")]
    Timeout {
        kind: ResourceKind,
        name: String,
        timeout: Duration,
    },

    #[error("update of {kind} '{name}' kept conflicting after {attempts} attempts")]
    Conflict {
        kind: ResourceKind,
        name: String,
        attempts: u32,
    },

    #[error("failed to decode {kind} '{name}': {source}")]
    Decode {
        kind: ResourceKind,
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }

    pub fn code(&self) -> Code {
        match self {
            ClientError::NotFound { .. } => Code::NotFound,
            ClientError::Api { .. } | ClientError::Timeout { .. } => Code::Unavailable,
            ClientError::Conflict { .. } => Code::Aborted,
            ClientError::Decode { .. } => Code::Internal,
        }
    }
}

// ============================================================================
// ResolveError
// ============================================================================

/// Failure while walking access request -> access grant -> bucket -> secret.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} '{name}' does not grant access")]
    NotGranted { kind: ResourceKind, name: String },

    #[error("{kind} '{name}' is malformed: {field} unset")]
    MalformedRequest {
        kind: ResourceKind,
        name: String,
        field: &'static str,
    },

    #[error("bucketAccess '{name}' has no minted secret")]
    NoMintedSecret { name: String },

    #[error("bucket '{name}' is not available yet")]
    NotAvailable { name: String },

    #[error("failed to get minted secret '{secret}' of bucketAccess '{grant}': {source}")]
    Secret {
        secret: String,
        grant: String,
        #[source]
        source: ClientError,
    },

    #[error("failed to get {kind} '{name}': {source}")]
    Lookup {
        kind: ResourceKind,
        name: String,
        #[source]
        source: ClientError,
    },
}

impl ResolveError {
    /// Classify a lookup failure for one hop of the chain.
    pub fn lookup(kind: ResourceKind, name: &str, source: ClientError) -> Self {
        if source.is_not_found() {
            ResolveError::NotFound {
                kind,
                name: name.to_string(),
            }
        } else {
            ResolveError::Lookup {
                kind,
                name: name.to_string(),
                source,
            }
        }
    }

    /// The hop of the chain that failed.
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResolveError::NotFound { kind, .. }
            | ResolveError::NotGranted { kind, .. }
            | ResolveError::MalformedRequest { kind, .. }
            | ResolveError::Lookup { kind, .. } => *kind,
            ResolveError::NoMintedSecret { .. } => ResourceKind::AccessGrant,
            ResolveError::NotAvailable { .. } => ResourceKind::Bucket,
            ResolveError::Secret { .. } => ResourceKind::Secret,
        }
    }

    pub fn code(&self) -> Code {
        match self {
            ResolveError::NotFound { .. } => Code::NotFound,
            ResolveError::NotGranted { .. }
            | ResolveError::MalformedRequest { .. }
            | ResolveError::NoMintedSecret { .. }
            | ResolveError::NotAvailable { .. } => Code::FailedPrecondition,
            ResolveError::Secret { source, .. } | ResolveError::Lookup { source, .. } => {
                source.code()
            }
        }
    }
}

// ============================================================================
// CredentialError
// ============================================================================

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error(transparent)]
    UnrecognizedProtocol(#[from] UnrecognizedProtocol),

    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// ProvisionError
// ============================================================================

/// Failure of a filesystem or mount action on a volume.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("invalid volume id '{0}'")]
    InvalidVolumeId(String),

    #[error("failed to mkdir for bucket path {}: {source}", .path.display())]
    MkdirFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to stat {}: {source}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("file {} already exists", .path.display())]
    FileExists { path: PathBuf },

    #[error("failed to create file {}: {source}", .path.display())]
    WriteFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to mkdir when mounting bucket at {}: {source}", .path.display())]
    MkdirForMount {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to check mount point {}: {source}", .path.display())]
    MountCheck {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is already mounted", .path.display())]
    AlreadyMounted { path: PathBuf },

    #[error("failed to mount {} at {}: {source}", .from.display(), .to.display())]
    MountFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to unmount {}: {source}", .path.display())]
    UnmountFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove directory {}: {source}", .path.display())]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read metadata file {}: {source}", .path.display())]
    ReadMetadata {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to unmarshal metadata {}: {source}", .path.display())]
    DecodeMetadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to marshal metadata: {0}")]
    EncodeMetadata(#[source] serde_json::Error),
}

// ============================================================================
// PublishError / UnpublishError
// ============================================================================

/// A step undone while rolling back a failed publish.
#[derive(Error, Debug)]
pub enum RollbackError {
    #[error("remove finalizer: {0}")]
    RemoveFinalizer(#[source] ClientError),

    #[error("unmount: {0}")]
    Unmount(#[source] ProvisionError),

    #[error("remove volume directory: {0}")]
    RemoveVolume(#[source] ProvisionError),
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error(transparent)]
    VolumeContext(#[from] VolumeContextError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("failed to extract bucket protocol: {0}")]
    Protocol(#[source] CredentialError),

    #[error("failed to create bucket directory: {0}")]
    CreateDir(#[source] ProvisionError),

    #[error("failed to parse secret: {0}")]
    ParseSecret(#[source] CredentialError),

    #[error("failed to write protocolConnection to mount volume: {0}")]
    WriteProtocol(#[source] ProvisionError),

    #[error("failed to write credentials to mount volume: {0}")]
    WriteCredentials(#[source] ProvisionError),

    #[error("failed to mount ephemeral volume to pod: {0}")]
    Mount(#[source] ProvisionError),

    #[error("failed to add finalizer to bucketAccess: {0}")]
    AddFinalizer(#[source] ClientError),

    #[error("failed to write metadata to disk: {0}")]
    WriteMetadata(#[source] ProvisionError),

    #[error("{original}; rollback failed: {}", join(.failures))]
    RollbackFailed {
        original: Box<PublishError>,
        failures: Vec<RollbackError>,
    },
}

impl PublishError {
    pub fn code(&self) -> Code {
        match self {
            PublishError::VolumeContext(_) => Code::InvalidArgument,
            PublishError::Resolve(e) => e.code(),
            PublishError::Protocol(CredentialError::UnrecognizedProtocol(_)) => {
                Code::FailedPrecondition
            }
            PublishError::RollbackFailed { original, .. } => original.code(),
            _ => Code::Internal,
        }
    }
}

#[derive(Error, Debug)]
pub enum UnpublishError {
    #[error("failed to read metadata file from volume: {0}")]
    ReadMetadata(#[source] ProvisionError),

    #[error("failed to get bucketAccess: {0}")]
    GetGrant(#[source] ClientError),

    #[error("failed to unmount and clean volume: {0}")]
    Unmount(#[source] ProvisionError),

    #[error("failed to remove directory: {0}")]
    RemoveDir(#[source] ProvisionError),

    #[error("failed to remove finalizer from bucketAccess: {0}")]
    RemoveFinalizer(#[source] ClientError),
}

impl UnpublishError {
    pub fn code(&self) -> Code {
        match self {
            UnpublishError::GetGrant(e) => e.code(),
            _ => Code::Internal,
        }
    }
}

impl From<PublishError> for Status {
    fn from(err: PublishError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

impl From<UnpublishError> for Status {
    fn from(err: UnpublishError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

fn join(failures: &[RollbackError]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
