//! Integration tests for cosi-csi-adapter
//!
//! These tests drive the CSI Identity and Node services through their tonic
//! traits, backed by the in-memory cluster, filesystem and mount fakes.
//! Tests focus on:
//! - The publish/unpublish lifecycle end to end
//! - Rollback after late publish failures
//! - Idempotent teardown
//! - Resolution ordering
//! - Request validation and status codes

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tonic::{Code, Request};

use cosi_csi_adapter::csi;
use cosi_csi_adapter::csi::identity_server::Identity;
use cosi_csi_adapter::csi::node_server::Node;
use cosi_csi_adapter::fake::{
    self, FakeMounter, FakeResourceClient, FsOp, MemoryFileSystem, RecordingEventPublisher,
};
use cosi_csi_adapter::types::{
    AccessRequest, BAR_NAME_KEY, BAR_NAMESPACE_KEY, Metadata, POD_NAME_KEY, POD_NAMESPACE_KEY,
    finalizer_for,
};
use cosi_csi_adapter::{IdentityService, NodeService, Provisioner, VolumeLifecycle};

const DATA_ROOT: &str = "/var/lib/cosi";
const TARGET: &str = "/mnt/x";

struct TestNode {
    service: NodeService,
    client: Arc<FakeResourceClient>,
    fs: Arc<MemoryFileSystem>,
    mounter: Arc<FakeMounter>,
    events: Arc<RecordingEventPublisher>,
}

fn test_node(client: FakeResourceClient) -> TestNode {
    let client = Arc::new(client);
    let fs = Arc::new(MemoryFileSystem::new());
    let mounter = Arc::new(FakeMounter::new(fs.clone()));
    let events = Arc::new(RecordingEventPublisher::new());
    let provisioner = Provisioner::new(DATA_ROOT, fs.clone(), mounter.clone());
    let lifecycle = VolumeLifecycle::new(client.clone(), provisioner, events.clone());

    TestNode {
        service: NodeService::new("node-1", 16, lifecycle),
        client,
        fs,
        mounter,
        events,
    }
}

fn volume_context() -> HashMap<String, String> {
    [
        (BAR_NAME_KEY, fake::BAR_NAME),
        (POD_NAME_KEY, fake::POD_NAME),
        (POD_NAMESPACE_KEY, fake::NAMESPACE),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn publish_request(volume_id: &str, target: &str) -> csi::NodePublishVolumeRequest {
    csi::NodePublishVolumeRequest {
        volume_id: volume_id.to_string(),
        target_path: target.to_string(),
        volume_context: volume_context(),
        ..Default::default()
    }
}

fn unpublish_request(volume_id: &str, target: &str) -> csi::NodeUnpublishVolumeRequest {
    csi::NodeUnpublishVolumeRequest {
        volume_id: volume_id.to_string(),
        target_path: target.to_string(),
    }
}

fn finalizer() -> String {
    finalizer_for(fake::NAMESPACE, fake::POD_NAME)
}

// ============================================================================
// Identity Service Tests
// ============================================================================

#[tokio::test]
async fn test_identity_reports_configured_driver() {
    let service = IdentityService::new("cosi.example.com", "0.1.0");

    let info = service
        .get_plugin_info(Request::new(csi::GetPluginInfoRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.name, "cosi.example.com");
    assert_eq!(info.vendor_version, "0.1.0");

    let caps = service
        .get_plugin_capabilities(Request::new(csi::GetPluginCapabilitiesRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert!(caps.capabilities.is_empty());

    let probe = service
        .probe(Request::new(csi::ProbeRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(probe.ready, Some(true));
}

// ============================================================================
// Node Info Tests
// ============================================================================

#[tokio::test]
async fn test_node_get_info() {
    let node = test_node(fake::ready_chain());

    let info = node
        .service
        .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(info.node_id, "node-1");
    assert_eq!(info.max_volumes_per_node, 16);
    assert!(info.accessible_topology.is_none());
}

#[tokio::test]
async fn test_node_get_capabilities_is_empty() {
    let node = test_node(fake::ready_chain());

    let caps = node
        .service
        .node_get_capabilities(Request::new(csi::NodeGetCapabilitiesRequest {}))
        .await
        .unwrap()
        .into_inner();

    assert!(caps.capabilities.is_empty());
}

#[tokio::test]
async fn test_staging_is_unimplemented() {
    let node = test_node(fake::ready_chain());

    let err = node
        .service
        .node_stage_volume(Request::new(csi::NodeStageVolumeRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    let err = node
        .service
        .node_get_volume_stats(Request::new(csi::NodeGetVolumeStatsRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

/// Publish then unpublish `vol-1` at `/mnt/x` with a fully ready chain.
#[tokio::test]
async fn test_publish_unpublish_end_to_end() {
    let node = test_node(fake::ready_chain());

    node.service
        .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
        .await
        .unwrap();

    assert_eq!(
        node.mounter.source_of(TARGET),
        Some(Path::new("/var/lib/cosi/vol-1/bucket").to_path_buf())
    );
    assert!(node.fs.contains("/var/lib/cosi/vol-1/bucket/protocolConn.json"));
    assert!(node.fs.contains("/var/lib/cosi/vol-1/bucket/credentials"));
    assert!(
        node.client
            .access_grant(fake::BA_NAME)
            .unwrap()
            .has_finalizer(&finalizer())
    );

    let metadata = node.fs.file("/var/lib/cosi/vol-1/metadata.json").unwrap();
    let metadata: Metadata = serde_json::from_slice(&metadata).unwrap();
    assert_eq!(metadata.ba_name, fake::BA_NAME);
    assert_eq!(metadata.pod_name, fake::POD_NAME);
    assert_eq!(metadata.pod_namespace, fake::NAMESPACE);

    node.service
        .node_unpublish_volume(Request::new(unpublish_request("vol-1", TARGET)))
        .await
        .unwrap();

    assert!(node.mounter.source_of(TARGET).is_none());
    assert!(!node.fs.contains("/var/lib/cosi/vol-1"));
    assert!(
        !node
            .client
            .access_grant(fake::BA_NAME)
            .unwrap()
            .has_finalizer(&finalizer())
    );
    assert_eq!(
        node.events.reasons(),
        vec!["ResourceReady", "WritingCredentials", "Success", "Success"]
    );
}

#[tokio::test]
async fn test_files_are_not_world_readable() {
    let node = test_node(fake::ready_chain());

    node.service
        .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
        .await
        .unwrap();

    let mode = node
        .fs
        .file_mode("/var/lib/cosi/vol-1/bucket/credentials")
        .unwrap();
    assert_eq!(mode & 0o007, 0);
}

#[tokio::test]
async fn test_access_request_namespace_override() {
    let client = fake::ready_chain();
    client.insert_access_request(AccessRequest {
        name: fake::BAR_NAME.to_string(),
        namespace: "shared".to_string(),
        bucket_request_name: "br-1".to_string(),
        access_granted: true,
        bucket_access_name: fake::BA_NAME.to_string(),
    });
    let node = test_node(client);

    let mut req = publish_request("vol-1", TARGET);
    req.volume_context
        .insert(BAR_NAMESPACE_KEY.to_string(), "shared".to_string());
    node.service
        .node_publish_volume(Request::new(req))
        .await
        .unwrap();

    assert_eq!(
        node.client.calls().first().map(String::as_str),
        Some("get_access_request shared/bar-1")
    );
}

#[tokio::test]
async fn test_unpublish_twice_succeeds() {
    let node = test_node(fake::ready_chain());

    node.service
        .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
        .await
        .unwrap();

    for _ in 0..2 {
        node.service
            .node_unpublish_volume(Request::new(unpublish_request("vol-1", TARGET)))
            .await
            .unwrap();
    }

    assert_eq!(node.mounter.mount_count(), 0);
    assert!(!node.fs.contains("/var/lib/cosi/vol-1"));
    assert!(
        node.client
            .access_grant(fake::BA_NAME)
            .unwrap()
            .finalizers
            .is_empty()
    );
}

#[tokio::test]
async fn test_unpublish_never_published_succeeds() {
    let node = test_node(fake::ready_chain());

    node.service
        .node_unpublish_volume(Request::new(unpublish_request("vol-9", TARGET)))
        .await
        .unwrap();

    assert!(node.client.calls().is_empty());
}

#[tokio::test]
async fn test_republish_after_unpublish() {
    let node = test_node(fake::ready_chain());

    for _ in 0..2 {
        node.service
            .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
            .await
            .unwrap();
        node.service
            .node_unpublish_volume(Request::new(unpublish_request("vol-1", TARGET)))
            .await
            .unwrap();
    }

    assert_eq!(node.mounter.mount_count(), 0);
}

#[tokio::test]
async fn test_independent_volumes_publish_concurrently() {
    let node = test_node(fake::ready_chain());

    let a = node
        .service
        .node_publish_volume(Request::new(publish_request("vol-a", "/mnt/a")));
    let b = node
        .service
        .node_publish_volume(Request::new(publish_request("vol-b", "/mnt/b")));
    let (a, b) = tokio::join!(a, b);
    a.unwrap();
    b.unwrap();

    assert_eq!(node.mounter.mount_count(), 2);
    assert!(node.fs.contains("/var/lib/cosi/vol-a/metadata.json"));
    assert!(node.fs.contains("/var/lib/cosi/vol-b/metadata.json"));
}

// ============================================================================
// Failure and Rollback Tests
// ============================================================================

#[tokio::test]
async fn test_mount_failure_rolls_back_volume() {
    let node = test_node(fake::ready_chain());
    node.mounter.fail_mount(true);

    let err = node
        .service
        .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::Internal);
    assert!(err.message().contains("mount"), "{}", err.message());
    assert!(!node.fs.contains("/var/lib/cosi/vol-1"));
    assert!(
        node.client
            .access_grant(fake::BA_NAME)
            .unwrap()
            .finalizers
            .is_empty()
    );
}

#[tokio::test]
async fn test_mount_failure_with_failed_rollback_reports_both() {
    let node = test_node(fake::ready_chain());
    node.mounter.fail_mount(true);
    node.fs.fail(FsOp::Remove, "/vol-1");

    let err = node
        .service
        .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::Internal);
    assert!(err.message().contains("injected mount failure"));
    assert!(err.message().contains("rollback failed"));
    assert!(err.message().contains("injected Remove failure"));
}

#[tokio::test]
async fn test_publish_recovers_from_leftover_volume_dir() {
    let node = test_node(fake::ready_chain());
    node.mounter.fail_mount(true);
    node.fs.fail(FsOp::Remove, "/vol-1");

    node.service
        .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
        .await
        .unwrap_err();
    assert!(node.fs.contains("/var/lib/cosi/vol-1/bucket/credentials"));

    // The stale files fail the retry, which then clears them
    node.fs.clear_failures();
    let err = node
        .service
        .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
        .await
        .unwrap_err();
    assert!(err.message().contains("already exists"), "{}", err.message());
    assert!(!node.fs.contains("/var/lib/cosi/vol-1"));

    node.mounter.fail_mount(false);
    node.service
        .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
        .await
        .unwrap();
    assert_eq!(
        node.mounter.source_of(TARGET),
        Some(Path::new("/var/lib/cosi/vol-1/bucket").to_path_buf())
    );
    assert!(
        node.client
            .access_grant(fake::BA_NAME)
            .unwrap()
            .has_finalizer(&finalizer())
    );
}

#[tokio::test]
async fn test_unpublish_retry_releases_finalizer() {
    let node = test_node(fake::ready_chain());
    node.service
        .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
        .await
        .unwrap();
    node.client.fail_remove_finalizer(true);

    let err = node
        .service
        .node_unpublish_volume(Request::new(unpublish_request("vol-1", TARGET)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(node.mounter.mount_count(), 0);

    node.client.fail_remove_finalizer(false);
    node.service
        .node_unpublish_volume(Request::new(unpublish_request("vol-1", TARGET)))
        .await
        .unwrap();

    assert!(
        !node
            .client
            .access_grant(fake::BA_NAME)
            .unwrap()
            .has_finalizer(&finalizer())
    );
    assert!(!node.fs.contains("/var/lib/cosi/vol-1"));
}

#[tokio::test]
async fn test_protocol_file_is_never_overwritten() {
    let node = test_node(fake::ready_chain());
    node.service
        .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
        .await
        .unwrap();
    let before = node
        .fs
        .file("/var/lib/cosi/vol-1/bucket/protocolConn.json")
        .unwrap();

    node.client.update_bucket(fake::BUCKET_NAME, |b| {
        if let Some(s3) = b.protocol.s3.as_mut() {
            s3.bucket_name = "other".to_string();
        }
    });
    let err = node
        .service
        .node_publish_volume(Request::new(publish_request("vol-1", "/mnt/y")))
        .await
        .unwrap_err();

    assert!(err.message().contains("already exists"), "{}", err.message());
    assert_eq!(
        node.fs.file("/var/lib/cosi/vol-1/bucket/protocolConn.json"),
        Some(before)
    );
}

#[tokio::test]
async fn test_second_publish_onto_mounted_target_fails() {
    let node = test_node(fake::ready_chain());
    node.service
        .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
        .await
        .unwrap();

    let err = node
        .service
        .node_publish_volume(Request::new(publish_request("vol-2", TARGET)))
        .await
        .unwrap_err();

    assert!(err.message().contains("already mounted"), "{}", err.message());
    assert!(!node.fs.contains("/var/lib/cosi/vol-2"));
    assert_eq!(
        node.mounter.source_of(TARGET),
        Some(Path::new("/var/lib/cosi/vol-1/bucket").to_path_buf())
    );
}

// ============================================================================
// Resolution Tests
// ============================================================================

#[tokio::test]
async fn test_ungranted_request_stops_before_bucket_lookup() {
    let client = fake::ready_chain();
    client.update_access_request(fake::NAMESPACE, fake::BAR_NAME, |r| {
        r.access_granted = false
    });
    let node = test_node(client);

    let err = node
        .service
        .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::FailedPrecondition);
    assert_eq!(
        node.client.calls(),
        vec![format!(
            "get_access_request {}/{}",
            fake::NAMESPACE,
            fake::BAR_NAME
        )]
    );
    assert!(node.events.warnings().contains("BARNotReady"));
}

#[tokio::test]
async fn test_ungranted_access_stops_before_bucket_lookup() {
    let client = fake::ready_chain();
    client.update_access_grant(fake::BA_NAME, |g| g.access_granted = false);
    let node = test_node(client);

    let err = node
        .service
        .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(
        !node
            .client
            .calls()
            .iter()
            .any(|c| c.starts_with("get_bucket") || c.starts_with("get_secret"))
    );
}

#[tokio::test]
async fn test_missing_request_is_not_found() {
    let node = test_node(FakeResourceClient::new());

    let err = node
        .service
        .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::NotFound);
    assert!(!node.fs.contains("/var/lib/cosi/vol-1"));
}

#[tokio::test]
async fn test_missing_secret_is_not_found() {
    let client = fake::ready_chain();
    client.remove_secret(fake::SECRET_NAMESPACE, fake::SECRET_NAME);
    let node = test_node(client);

    let err = node
        .service
        .node_publish_volume(Request::new(publish_request("vol-1", TARGET)))
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::NotFound);
    let events = node.events.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].warning);
    assert_eq!(events[0].reason, "BANotReady");
}

// ============================================================================
// Validation Tests
// ============================================================================

#[tokio::test]
async fn test_publish_missing_context_key_is_invalid_argument() {
    for key in [BAR_NAME_KEY, POD_NAME_KEY, POD_NAMESPACE_KEY] {
        let node = test_node(fake::ready_chain());
        let mut req = publish_request("vol-1", TARGET);
        req.volume_context.remove(key);

        let err = node
            .service
            .node_publish_volume(Request::new(req))
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::InvalidArgument, "{key}");
        assert!(err.message().contains(key));
        assert!(node.client.calls().is_empty());
    }
}

#[tokio::test]
async fn test_publish_rejects_bad_paths() {
    let node = test_node(fake::ready_chain());

    let cases = [
        ("", TARGET),
        ("../etc", TARGET),
        ("vol-1", ""),
        ("vol-1", "relative/path"),
        ("vol-1", "/mnt/../etc"),
        ("vol-1", "/mnt/x;reboot"),
    ];
    for (volume_id, target) in cases {
        let err = node
            .service
            .node_publish_volume(Request::new(publish_request(volume_id, target)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument, "{volume_id} {target}");
    }
    assert!(node.client.calls().is_empty());
}

#[tokio::test]
async fn test_unpublish_rejects_bad_paths() {
    let node = test_node(fake::ready_chain());

    let err = node
        .service
        .node_unpublish_volume(Request::new(unpublish_request("vol-1", "mnt")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = node
        .service
        .node_unpublish_volume(Request::new(unpublish_request("a/b", TARGET)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}
