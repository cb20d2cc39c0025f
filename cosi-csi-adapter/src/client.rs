//! Cluster resource access used by the resolver and lifecycle engine.
//!
//! The production implementation lives in [`crate::kube_client`]; tests use
//! `fake::FakeResourceClient`.

use crate::error::ClientError;
use crate::types::{AccessGrant, AccessRequest, BucketRecord, SecretPayload};

/// Lookup and finalizer update of the objects a volume depends on.
///
/// Finalizer updates must be idempotent: adding a finalizer that is already
/// present, or removing one that is absent, succeeds without writing.
#[tonic::async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get_access_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<AccessRequest, ClientError>;

    async fn get_access_grant(&self, name: &str) -> Result<AccessGrant, ClientError>;

    async fn get_bucket(&self, name: &str) -> Result<BucketRecord, ClientError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretPayload, ClientError>;

    /// Add `finalizer` to the named access grant.
    ///
    /// Returns `true` if the finalizer was added, `false` if it was already present.
    async fn add_grant_finalizer(&self, name: &str, finalizer: &str) -> Result<bool, ClientError>;

    /// Remove `finalizer` from the named access grant.
    ///
    /// Returns `true` if the finalizer was removed, `false` if it was absent.
    async fn remove_grant_finalizer(&self, name: &str, finalizer: &str)
    -> Result<bool, ClientError>;
}
