//! [`ResourceClient`] over the Kubernetes API.
//!
//! COSI resources (`objectstorage.k8s.io/v1alpha1`) are read as
//! [`DynamicObject`]s and decoded into the domain types; minted secrets are
//! read through the typed core `Secret` API. Every call is bounded by the
//! configured timeout.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::client::ResourceClient;
use crate::error::ClientError;
use crate::metrics;
use crate::types::{
    AccessGrant, AccessRequest, BucketRecord, ProtocolSpec, ResourceKind, SecretPayload, SecretRef,
};

pub const GROUP: &str = "objectstorage.k8s.io";
pub const VERSION: &str = "v1alpha1";

/// Attempts at a finalizer update before giving up on write conflicts.
const MAX_UPDATE_ATTEMPTS: u32 = 5;

fn api_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: GROUP.to_string(),
        version: VERSION.to_string(),
        api_version: format!("{}/{}", GROUP, VERSION),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

// ============================================================================
// Wire representation
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Object<S, T> {
    spec: S,
    status: T,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BucketAccessRequestSpec {
    bucket_request_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BucketAccessRequestStatus {
    access_granted: bool,
    bucket_access_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BucketAccessSpec {
    bucket_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BucketAccessStatus {
    access_granted: bool,
    minted_secret: Option<SecretReference>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SecretReference {
    name: String,
    namespace: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BucketSpec {
    protocol: ProtocolSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BucketStatus {
    bucket_available: bool,
}

fn decode<S, T>(
    kind: ResourceKind,
    name: &str,
    obj: &DynamicObject,
) -> Result<Object<S, T>, ClientError>
where
    S: for<'de> Deserialize<'de> + Default,
    T: for<'de> Deserialize<'de> + Default,
{
    Object::deserialize(&obj.data).map_err(|source| ClientError::Decode {
        kind,
        name: name.to_string(),
        source,
    })
}

// ============================================================================
// KubeResourceClient
// ============================================================================

/// Production [`ResourceClient`].
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
    timeout: Duration,
    requests: ApiResource,
    accesses: ApiResource,
    buckets: ApiResource,
}

impl KubeResourceClient {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            requests: api_resource("BucketAccessRequest", "bucketaccessrequests"),
            accesses: api_resource("BucketAccess", "bucketaccesses"),
            buckets: api_resource("Bucket", "buckets"),
        }
    }

    fn grants(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &self.accesses)
    }

    /// Run one API call under the timeout, mapping 404 to NotFound.
    async fn call<T, F>(&self, kind: ResourceKind, name: &str, fut: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(kube::Error::Api(ae))) if ae.code == 404 => Err(ClientError::NotFound {
                kind,
                name: name.to_string(),
            }),
            Ok(Err(e)) => Err(ClientError::Api {
                kind,
                name: name.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(ClientError::Timeout {
                kind,
                name: name.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    /// Read-modify-write the finalizer list of a bucket access.
    ///
    /// `edit` returns the new list, or `None` when no change is needed. The
    /// patch carries the observed resourceVersion, so a concurrent writer
    /// causes a 409 and another attempt against fresh state.
    async fn update_finalizers<F>(&self, name: &str, edit: F) -> Result<bool, ClientError>
    where
        F: Fn(&[String]) -> Option<Vec<String>>,
    {
        let kind = ResourceKind::AccessGrant;
        let api = self.grants();

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let obj = self.call(kind, name, api.get(name)).await?;
            let current = obj.metadata.finalizers.clone().unwrap_or_default();
            let Some(finalizers) = edit(&current) else {
                return Ok(false);
            };

            let patch = serde_json::json!({
                "metadata": {
                    "finalizers": finalizers,
                    "resourceVersion": obj.metadata.resource_version,
                }
            });
            let result = tokio::time::timeout(
                self.timeout,
                api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)),
            )
            .await;

            match result {
                Ok(Ok(_)) => return Ok(true),
                Ok(Err(kube::Error::Api(ae))) if ae.code == 409 => {
                    warn!(name = %name, attempt, "Conflict updating bucketAccess finalizers, retrying");
                    metrics::record_retry("update_finalizers");
                }
                Ok(Err(kube::Error::Api(ae))) if ae.code == 404 => {
                    return Err(ClientError::NotFound {
                        kind,
                        name: name.to_string(),
                    });
                }
                Ok(Err(e)) => {
                    return Err(ClientError::Api {
                        kind,
                        name: name.to_string(),
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    return Err(ClientError::Timeout {
                        kind,
                        name: name.to_string(),
                        timeout: self.timeout,
                    });
                }
            }
        }

        Err(ClientError::Conflict {
            kind,
            name: name.to_string(),
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }
}

#[tonic::async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get_access_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<AccessRequest, ClientError> {
        let kind = ResourceKind::AccessRequest;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &self.requests);
        let obj = self.call(kind, name, api.get(name)).await?;
        let wire: Object<BucketAccessRequestSpec, BucketAccessRequestStatus> =
            decode(kind, name, &obj)?;

        Ok(AccessRequest {
            name: name.to_string(),
            namespace: namespace.to_string(),
            bucket_request_name: wire.spec.bucket_request_name,
            access_granted: wire.status.access_granted,
            bucket_access_name: wire.status.bucket_access_name,
        })
    }

    async fn get_access_grant(&self, name: &str) -> Result<AccessGrant, ClientError> {
        let kind = ResourceKind::AccessGrant;
        let obj = self.call(kind, name, self.grants().get(name)).await?;
        let wire: Object<BucketAccessSpec, BucketAccessStatus> = decode(kind, name, &obj)?;

        Ok(AccessGrant {
            name: name.to_string(),
            bucket_name: wire.spec.bucket_name,
            access_granted: wire.status.access_granted,
            minted_secret: wire
                .status
                .minted_secret
                .map(|s| SecretRef::new(s.namespace, s.name)),
            finalizers: obj.metadata.finalizers.unwrap_or_default(),
        })
    }

    async fn get_bucket(&self, name: &str) -> Result<BucketRecord, ClientError> {
        let kind = ResourceKind::Bucket;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.buckets);
        let obj = self.call(kind, name, api.get(name)).await?;
        let wire: Object<BucketSpec, BucketStatus> = decode(kind, name, &obj)?;

        Ok(BucketRecord {
            name: name.to_string(),
            protocol: wire.spec.protocol,
            bucket_available: wire.status.bucket_available,
        })
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretPayload, ClientError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = self.call(ResourceKind::Secret, name, api.get(name)).await?;

        // stringData is write-only, the API server folds it into data
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }

    async fn add_grant_finalizer(&self, name: &str, finalizer: &str) -> Result<bool, ClientError> {
        let added = self
            .update_finalizers(name, |current| {
                if current.iter().any(|f| f == finalizer) {
                    return None;
                }
                let mut next = current.to_vec();
                next.push(finalizer.to_string());
                Some(next)
            })
            .await?;
        debug!(name = %name, finalizer = %finalizer, added, "Added bucketAccess finalizer");
        Ok(added)
    }

    async fn remove_grant_finalizer(
        &self,
        name: &str,
        finalizer: &str,
    ) -> Result<bool, ClientError> {
        let removed = self
            .update_finalizers(name, |current| {
                if !current.iter().any(|f| f == finalizer) {
                    return None;
                }
                Some(
                    current
                        .iter()
                        .filter(|f| *f != finalizer)
                        .cloned()
                        .collect(),
                )
            })
            .await?;
        debug!(name = %name, finalizer = %finalizer, removed, "Removed bucketAccess finalizer");
        Ok(removed)
    }
}
