//! Resource resolution for a publish request.
//!
//! Walks bucket access request -> bucket access -> bucket -> minted secret.
//! Each hop is validated before the next lookup is issued, since the next
//! lookup key comes out of the previous object. Nothing is retried here:
//! readiness converges asynchronously and the caller's RPC retry is the
//! retry boundary.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::client::ResourceClient;
use crate::error::{ClientError, ResolveError};
use crate::types::{AccessGrant, AccessRequest, BucketRecord, ResourceKind, SecretPayload};

/// Everything needed to publish one volume.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub bucket: BucketRecord,
    pub grant: AccessGrant,
    pub secret: SecretPayload,
}

#[derive(Clone)]
pub struct Resolver {
    client: Arc<dyn ResourceClient>,
}

impl Resolver {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self { client }
    }

    /// Resolve the access request `namespace/name` into a credential bundle.
    pub async fn resolve(&self, namespace: &str, name: &str) -> Result<Resolution, ResolveError> {
        debug!(namespace = %namespace, name = %name, "Getting bucketAccessRequest");
        let request = self
            .client
            .get_access_request(namespace, name)
            .await
            .map_err(|e| ResolveError::lookup(ResourceKind::AccessRequest, name, e))?;
        check_access_request(&request)?;

        debug!(name = %request.bucket_access_name, "Getting bucketAccess");
        let grant = self
            .client
            .get_access_grant(&request.bucket_access_name)
            .await
            .map_err(|e| {
                ResolveError::lookup(ResourceKind::AccessGrant, &request.bucket_access_name, e)
            })?;
        let secret_ref = check_access_grant(&grant)?.clone();

        debug!(name = %grant.bucket_name, "Getting bucket");
        let bucket = self
            .client
            .get_bucket(&grant.bucket_name)
            .await
            .map_err(|e| ResolveError::lookup(ResourceKind::Bucket, &grant.bucket_name, e))?;
        check_bucket(&bucket)?;

        debug!(secret = %secret_ref, "Getting minted secret");
        let secret = match self
            .client
            .get_secret(&secret_ref.namespace, &secret_ref.name)
            .await
        {
            Ok(secret) => secret,
            Err(source) => {
                warn!(
                    secret = %secret_ref,
                    bucket_access = %grant.name,
                    bucket = %bucket.name,
                    error = %source,
                    "Minted secret lookup failed after bucket resolved"
                );
                return Err(ResolveError::Secret {
                    secret: secret_ref.to_string(),
                    grant: grant.name,
                    source,
                });
            }
        };

        Ok(Resolution {
            bucket,
            grant,
            secret,
        })
    }

    /// Fetch an access grant by name without readiness checks.
    pub async fn access_grant(&self, name: &str) -> Result<AccessGrant, ClientError> {
        debug!(name = %name, "Getting bucketAccess");
        self.client.get_access_grant(name).await
    }
}

fn check_access_request(request: &AccessRequest) -> Result<(), ResolveError> {
    if !request.access_granted {
        return Err(ResolveError::NotGranted {
            kind: ResourceKind::AccessRequest,
            name: request.name.clone(),
        });
    }
    if request.bucket_request_name.is_empty() {
        return Err(ResolveError::MalformedRequest {
            kind: ResourceKind::AccessRequest,
            name: request.name.clone(),
            field: "spec.bucketRequestName",
        });
    }
    if request.bucket_access_name.is_empty() {
        return Err(ResolveError::MalformedRequest {
            kind: ResourceKind::AccessRequest,
            name: request.name.clone(),
            field: "status.bucketAccessName",
        });
    }
    Ok(())
}

fn check_access_grant(grant: &AccessGrant) -> Result<&crate::types::SecretRef, ResolveError> {
    if !grant.access_granted {
        return Err(ResolveError::NotGranted {
            kind: ResourceKind::AccessGrant,
            name: grant.name.clone(),
        });
    }
    let secret = match &grant.minted_secret {
        Some(secret) if !secret.is_empty() => secret,
        _ => {
            return Err(ResolveError::NoMintedSecret {
                name: grant.name.clone(),
            });
        }
    };
    if grant.bucket_name.is_empty() {
        return Err(ResolveError::MalformedRequest {
            kind: ResourceKind::AccessGrant,
            name: grant.name.clone(),
            field: "spec.bucketName",
        });
    }
    Ok(secret)
}

fn check_bucket(bucket: &BucketRecord) -> Result<(), ResolveError> {
    if !bucket.bucket_available {
        return Err(ResolveError::NotAvailable {
            name: bucket.name.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{self, FakeResourceClient};
    use crate::types::SecretRef;
    use tonic::Code;

    fn resolver(client: &Arc<FakeResourceClient>) -> Resolver {
        Resolver::new(client.clone())
    }

    #[tokio::test]
    async fn test_resolve_ready_chain() {
        let client = Arc::new(fake::ready_chain());
        let resolution = resolver(&client)
            .resolve(fake::NAMESPACE, fake::BAR_NAME)
            .await
            .unwrap();

        assert_eq!(resolution.grant.name, fake::BA_NAME);
        assert_eq!(resolution.bucket.name, fake::BUCKET_NAME);
        assert_eq!(
            resolution.secret.data.get("accessKeyID").map(Vec::as_slice),
            Some(b"AKIA".as_slice())
        );
        assert_eq!(
            client.calls(),
            vec![
                format!("get_access_request {}/{}", fake::NAMESPACE, fake::BAR_NAME),
                format!("get_access_grant {}", fake::BA_NAME),
                format!("get_bucket {}", fake::BUCKET_NAME),
                format!("get_secret {}/{}", fake::SECRET_NAMESPACE, fake::SECRET_NAME),
            ]
        );
    }

    #[tokio::test]
    async fn test_ungranted_request_stops_before_later_lookups() {
        let client = Arc::new(fake::ready_chain());
        client.update_access_request(fake::NAMESPACE, fake::BAR_NAME, |bar| {
            bar.access_granted = false;
        });

        let err = resolver(&client)
            .resolve(fake::NAMESPACE, fake::BAR_NAME)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ResolveError::NotGranted {
                kind: ResourceKind::AccessRequest,
                ..
            }
        ));
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert_eq!(client.calls().len(), 1, "only the request may be fetched");
    }

    #[tokio::test]
    async fn test_request_missing_fields_is_malformed() {
        let client = Arc::new(fake::ready_chain());
        client.update_access_request(fake::NAMESPACE, fake::BAR_NAME, |bar| {
            bar.bucket_access_name.clear();
        });

        let err = resolver(&client)
            .resolve(fake::NAMESPACE, fake::BAR_NAME)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::MalformedRequest {
                field: "status.bucketAccessName",
                ..
            }
        ));

        client.update_access_request(fake::NAMESPACE, fake::BAR_NAME, |bar| {
            bar.bucket_access_name = fake::BA_NAME.to_string();
            bar.bucket_request_name.clear();
        });
        let err = resolver(&client)
            .resolve(fake::NAMESPACE, fake::BAR_NAME)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::MalformedRequest {
                field: "spec.bucketRequestName",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_request_is_not_found() {
        let client = Arc::new(FakeResourceClient::new());
        let err = resolver(&client)
            .resolve("nowhere", "nothing")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::NotFound {
                kind: ResourceKind::AccessRequest,
                ..
            }
        ));
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_grant_checks() {
        let client = Arc::new(fake::ready_chain());
        client.update_access_grant(fake::BA_NAME, |ba| ba.access_granted = false);
        let err = resolver(&client)
            .resolve(fake::NAMESPACE, fake::BAR_NAME)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::NotGranted {
                kind: ResourceKind::AccessGrant,
                ..
            }
        ));
        assert_eq!(client.calls().len(), 2);

        client.update_access_grant(fake::BA_NAME, |ba| {
            ba.access_granted = true;
            ba.minted_secret = None;
        });
        let err = resolver(&client)
            .resolve(fake::NAMESPACE, fake::BAR_NAME)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NoMintedSecret { .. }));
    }

    #[tokio::test]
    async fn test_minted_secret_without_namespace() {
        let client = Arc::new(fake::ready_chain());
        client.update_access_grant(fake::BA_NAME, |ba| {
            ba.minted_secret = Some(SecretRef::new("", fake::SECRET_NAME));
        });

        let err = resolver(&client)
            .resolve(fake::NAMESPACE, fake::BAR_NAME)
            .await
            .unwrap_err();

        assert!(matches!(err, ResolveError::NoMintedSecret { .. }));
        assert_eq!(err.code(), Code::FailedPrecondition);
        // Neither the bucket nor the secret is requested
        assert_eq!(client.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_bucket() {
        let client = Arc::new(fake::ready_chain());
        client.update_bucket(fake::BUCKET_NAME, |b| b.bucket_available = false);

        let err = resolver(&client)
            .resolve(fake::NAMESPACE, fake::BAR_NAME)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotAvailable { .. }));
        assert_eq!(err.code(), Code::FailedPrecondition);
        // The secret is never requested
        assert_eq!(client.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_secret_reports_grant() {
        let client = Arc::new(fake::ready_chain());
        client.remove_secret(fake::SECRET_NAMESPACE, fake::SECRET_NAME);

        let err = resolver(&client)
            .resolve(fake::NAMESPACE, fake::BAR_NAME)
            .await
            .unwrap_err();
        match &err {
            ResolveError::Secret { grant, source, .. } => {
                assert_eq!(grant, fake::BA_NAME);
                assert!(source.is_not_found());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.code(), Code::NotFound);
    }
}
