//! Kubernetes Events on the workload a volume is published for.
//!
//! Events are fire-and-forget: a failed publish is logged at warn and never
//! fails the RPC that emitted it.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

use crate::error::ResolveError;
use crate::types::ResourceKind;

/// Publishes Kubernetes Events.
#[tonic::async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `resource_ref`.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// The reporter name appears as the "reportingComponent" on Events.
    pub fn new(client: Client, reporter: &str) -> Self {
        let reporter = Reporter {
            controller: reporter.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[tonic::async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Discards every event.
pub struct NoopEventPublisher;

#[tonic::async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reason strings, shown under REASON in `kubectl get events`.
pub mod reasons {
    pub const BAR_NOT_READY: &str = "BARNotReady";
    pub const BA_NOT_READY: &str = "BANotReady";
    pub const BUCKET_NOT_READY: &str = "BNotReady";
    /// Every resource in the chain resolved
    pub const RESOURCE_READY: &str = "ResourceReady";
    /// Protocol and credential files written
    pub const WRITING_CREDENTIALS: &str = "WritingCredentials";
    pub const SUCCESS: &str = "Success";
}

/// Event action strings.
pub mod actions {
    pub const PUBLISH: &str = "NodePublishVolume";
    pub const UNPUBLISH: &str = "NodeUnpublishVolume";
}

/// Reference to the pod a volume is published for.
pub fn pod_reference(namespace: &str, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Pod".to_string()),
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Warning reason and note describing a resolution failure.
pub fn resolve_failure(err: &ResolveError) -> (&'static str, String) {
    let reason = match err.kind() {
        ResourceKind::AccessRequest => reasons::BAR_NOT_READY,
        ResourceKind::AccessGrant | ResourceKind::Secret => reasons::BA_NOT_READY,
        ResourceKind::Bucket => reasons::BUCKET_NOT_READY,
    };
    let note = match err {
        ResolveError::Secret { .. } => "Minted credentials secret not found".to_string(),
        other => other.to_string(),
    };
    (reason, note)
}
