//! Domain types for the COSI node adapter.
//!
//! These types model the cluster objects the adapter reads (bucket access
//! requests, bucket accesses, buckets and minted secrets) independently of
//! their wire representation, plus the values parsed at the RPC boundary
//! (volume context, listen endpoint) and the record persisted per volume.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// File in the bucket directory holding the serialized protocol variant.
pub const PROTOCOL_FILE_NAME: &str = "protocolConn.json";
/// File in the bucket directory holding the flattened credential map.
pub const CREDENTIALS_FILE_NAME: &str = "credentials";
/// File at the volume root holding the persisted [`Metadata`].
pub const METADATA_FILE_NAME: &str = "metadata.json";
/// Subdirectory of the volume root that is bind mounted into the workload.
pub const BUCKET_DIR_NAME: &str = "bucket";

/// Prefix of the per-workload finalizer placed on a bucket access.
pub const FINALIZER_PREFIX: &str = "cosi.objectstorage.k8s.io/bucketaccess-protection";

// ============================================================================
// ResourceKind
// ============================================================================

/// The kinds of cluster object visited while resolving a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    AccessRequest,
    AccessGrant,
    Bucket,
    Secret,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::AccessRequest => write!(f, "bucketAccessRequest"),
            ResourceKind::AccessGrant => write!(f, "bucketAccess"),
            ResourceKind::Bucket => write!(f, "bucket"),
            ResourceKind::Secret => write!(f, "secret"),
        }
    }
}

// ============================================================================
// Cluster entities
// ============================================================================

/// A namespaced request for access to a bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessRequest {
    pub name: String,
    pub namespace: String,
    /// Upstream bucket request this access request targets
    pub bucket_request_name: String,
    /// Set by the controller once the request has been approved
    pub access_granted: bool,
    /// Name of the resulting [`AccessGrant`], set once approved
    pub bucket_access_name: String,
}

/// Namespaced reference to a secret.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
    pub namespace: String,
}

impl SecretRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// A reference is usable only when it names a secret and its namespace.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() || self.namespace.is_empty()
    }
}

impl Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A cluster-scoped, approved grant of access to a bucket.
///
/// This is the object the per-workload finalizer is attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessGrant {
    pub name: String,
    pub bucket_name: String,
    pub access_granted: bool,
    /// Credentials minted for this grant, once the provisioner has created them
    pub minted_secret: Option<SecretRef>,
    pub finalizers: Vec<String>,
}

impl AccessGrant {
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

/// A provisioned object-storage bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketRecord {
    pub name: String,
    pub protocol: ProtocolSpec,
    pub bucket_available: bool,
}

/// Opaque credential material fetched from a minted secret.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretPayload {
    pub data: BTreeMap<String, Vec<u8>>,
}

impl SecretPayload {
    pub fn new(data: BTreeMap<String, Vec<u8>>) -> Self {
        Self { data }
    }
}

impl<K, V> FromIterator<(K, V)> for SecretPayload
where
    K: Into<String>,
    V: Into<Vec<u8>>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            data: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ============================================================================
// Protocol
// ============================================================================

/// S3 connection parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct S3 {
    pub endpoint: String,
    pub bucket_name: String,
    pub region: String,
    pub signature_version: String,
}

/// Azure Blob connection parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AzureBlob {
    pub container_name: String,
    pub storage_account: String,
}

/// Google Cloud Storage connection parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Gcs {
    pub bucket_name: String,
    pub private_key_name: String,
    pub project_id: String,
    pub service_account: String,
}

/// The protocol section of a bucket as stored in the cluster: at most one
/// field is expected to be set, but nothing enforces it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azure_blob: Option<AzureBlob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcs: Option<Gcs>,
}

impl ProtocolSpec {
    /// Number of protocol variants that carry a value.
    pub fn populated(&self) -> usize {
        [
            self.s3.is_some(),
            self.azure_blob.is_some(),
            self.gcs.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }

    /// Select the single populated variant.
    pub fn variant(&self) -> Result<Protocol, UnrecognizedProtocol> {
        match (&self.s3, &self.azure_blob, &self.gcs) {
            (Some(s3), None, None) => Ok(Protocol::S3(s3.clone())),
            (None, Some(azure), None) => Ok(Protocol::AzureBlob(azure.clone())),
            (None, None, Some(gcs)) => Ok(Protocol::Gcs(gcs.clone())),
            _ => Err(UnrecognizedProtocol {
                populated: self.populated(),
            }),
        }
    }
}

impl From<Protocol> for ProtocolSpec {
    fn from(value: Protocol) -> Self {
        match value {
            Protocol::S3(s3) => ProtocolSpec {
                s3: Some(s3),
                ..Default::default()
            },
            Protocol::AzureBlob(azure) => ProtocolSpec {
                azure_blob: Some(azure),
                ..Default::default()
            },
            Protocol::Gcs(gcs) => ProtocolSpec {
                gcs: Some(gcs),
                ..Default::default()
            },
        }
    }
}

/// Connection parameters for exactly one object-storage protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    S3(S3),
    AzureBlob(AzureBlob),
    Gcs(Gcs),
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::S3(_) => write!(f, "s3"),
            Protocol::AzureBlob(_) => write!(f, "azureBlob"),
            Protocol::Gcs(_) => write!(f, "gcs"),
        }
    }
}

/// Error returned when a bucket does not carry exactly one protocol variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrecognizedProtocol {
    /// How many variants were set (zero, or more than one)
    pub populated: usize,
}

impl Display for UnrecognizedProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unrecognized protocol, unable to extract connection data ({} protocol variants set, expected exactly 1)",
            self.populated
        )
    }
}

impl std::error::Error for UnrecognizedProtocol {}

// ============================================================================
// VolumeContext
// ============================================================================

/// Volume context key naming the bucket access request.
pub const BAR_NAME_KEY: &str = "bar-name";
/// Optional volume context key naming the bucket access request namespace.
pub const BAR_NAMESPACE_KEY: &str = "bar-namespace";
/// Volume context key set by kubelet with the owning pod name.
pub const POD_NAME_KEY: &str = "csi.storage.k8s.io/pod.name";
/// Volume context key set by kubelet with the owning pod namespace.
pub const POD_NAMESPACE_KEY: &str = "csi.storage.k8s.io/pod.namespace";

/// Values extracted from the volume context of a publish request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeContext {
    pub access_request_name: String,
    pub access_request_namespace: String,
    pub pod_name: String,
    pub pod_namespace: String,
}

impl VolumeContext {
    /// Parse the volume context map supplied with a publish request.
    ///
    /// The access request namespace defaults to the pod namespace.
    pub fn parse(volume_context: &HashMap<String, String>) -> Result<Self, VolumeContextError> {
        let access_request_name = required(volume_context, BAR_NAME_KEY)?;
        let pod_name = required(volume_context, POD_NAME_KEY)?;
        let pod_namespace = required(volume_context, POD_NAMESPACE_KEY)?;
        let access_request_namespace = volume_context
            .get(BAR_NAMESPACE_KEY)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| pod_namespace.clone());

        Ok(Self {
            access_request_name,
            access_request_namespace,
            pod_name,
            pod_namespace,
        })
    }
}

fn required(
    volume_context: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, VolumeContextError> {
    volume_context
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or(VolumeContextError::MissingKey(key))
}

/// Error returned when the volume context lacks a required key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeContextError {
    MissingKey(&'static str),
}

impl Display for VolumeContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeContextError::MissingKey(key) => {
                write!(f, "required volume context key unset: {}", key)
            }
        }
    }
}

impl std::error::Error for VolumeContextError {}

// ============================================================================
// Metadata
// ============================================================================

/// Record persisted at the volume root on publish and read back on unpublish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "baName")]
    pub ba_name: String,
    #[serde(rename = "podName")]
    pub pod_name: String,
    #[serde(rename = "podNamespace")]
    pub pod_namespace: String,
}

impl Metadata {
    pub fn new(
        ba_name: impl Into<String>,
        pod_name: impl Into<String>,
        pod_namespace: impl Into<String>,
    ) -> Self {
        Self {
            ba_name: ba_name.into(),
            pod_name: pod_name.into(),
            pod_namespace: pod_namespace.into(),
        }
    }

    /// Finalizer tying the bucket access to the workload recorded here.
    pub fn finalizer(&self) -> String {
        finalizer_for(&self.pod_namespace, &self.pod_name)
    }
}

/// Derive the finalizer for a workload identity.
pub fn finalizer_for(pod_namespace: &str, pod_name: &str) -> String {
    format!("{}-{}-{}", FINALIZER_PREFIX, pod_namespace, pod_name)
}

// ============================================================================
// ListenEndpoint
// ============================================================================

/// Address the plugin gRPC server binds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenEndpoint {
    /// Unix domain socket (the usual kubelet plugin transport)
    Unix(PathBuf),
    /// TCP socket
    Tcp(SocketAddr),
}

impl Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            ListenEndpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

impl FromStr for ListenEndpoint {
    type Err = EndpointParseError;

    /// Accepts `unix:///path`, `tcp://host:port`, a bare absolute path, or a
    /// bare socket address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Some(path) = s.strip_prefix("unix://") {
            return unix_path(path).ok_or_else(|| EndpointParseError(s.to_string()));
        }

        if let Some(addr) = s.strip_prefix("tcp://") {
            return addr
                .parse::<SocketAddr>()
                .map(ListenEndpoint::Tcp)
                .map_err(|_| EndpointParseError(s.to_string()));
        }

        if s.starts_with('/') {
            return unix_path(s).ok_or_else(|| EndpointParseError(s.to_string()));
        }

        s.parse::<SocketAddr>()
            .map(ListenEndpoint::Tcp)
            .map_err(|_| EndpointParseError(s.to_string()))
    }
}

fn unix_path(path: &str) -> Option<ListenEndpoint> {
    if path.starts_with('/') && path.len() > 1 {
        Some(ListenEndpoint::Unix(PathBuf::from(path)))
    } else {
        None
    }
}

/// Error returned when parsing an invalid listen endpoint.
#[derive(Debug, Clone)]
pub struct EndpointParseError(String);

impl Display for EndpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid endpoint '{}': expected 'unix:///path' or 'tcp://host:port'",
            self.0
        )
    }
}

impl std::error::Error for EndpointParseError {}
