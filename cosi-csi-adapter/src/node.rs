//! CSI Node Service Implementation
//!
//! Publishes bucket credentials into workloads: resolves the bucket access
//! chain, writes the connection and credential files into a per-volume
//! directory, bind mounts that directory at the target path and ties the
//! bucket access to the workload with a finalizer. Unpublish reverses the
//! sequence from the metadata persisted by publish, so it works across
//! process restarts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use kube::runtime::events::EventType;
use tokio::task::JoinError;
use tonic::{Code, Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::client::ResourceClient;
use crate::credentials;
use crate::csi;
use crate::error::{PublishError, RollbackError, UnpublishError};
use crate::events::{self, EventPublisher, actions, reasons};
use crate::metrics::{self, OperationTimer};
use crate::provisioner::Provisioner;
use crate::resolver::{Resolution, Resolver};
use crate::types::{CREDENTIALS_FILE_NAME, Metadata, PROTOCOL_FILE_NAME, VolumeContext, finalizer_for};

/// Publish and unpublish of a single volume.
///
/// Calls for different volume IDs share nothing but the collaborators.
/// Calls for the same volume ID are expected to be serialized by the
/// caller; exclusive file creation and the mount point check turn a
/// violation into an error.
pub struct VolumeLifecycle {
    client: Arc<dyn ResourceClient>,
    resolver: Resolver,
    provisioner: Provisioner,
    events: Arc<dyn EventPublisher>,
}

/// Local side effects of a publish, undone in reverse on failure.
#[derive(Debug, Default)]
struct Progress {
    /// No completed publish of this volume existed before this call
    owns_volume: bool,
    mounted: bool,
    finalizer_added: bool,
}

impl VolumeLifecycle {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        provisioner: Provisioner,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            resolver: Resolver::new(client.clone()),
            client,
            provisioner,
            events,
        }
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// Expose the bucket referenced by `volume_context` at `target_path`.
    pub async fn publish(
        &self,
        volume_id: &str,
        target_path: &Path,
        volume_context: &HashMap<String, String>,
    ) -> Result<(), PublishError> {
        let ctx = VolumeContext::parse(volume_context)?;
        let pod = events::pod_reference(&ctx.pod_namespace, &ctx.pod_name);

        let resolution = match self
            .resolver
            .resolve(&ctx.access_request_namespace, &ctx.access_request_name)
            .await
        {
            Ok(resolution) => resolution,
            Err(e) => {
                let (reason, note) = events::resolve_failure(&e);
                self.events
                    .publish(&pod, EventType::Warning, reason, actions::PUBLISH, Some(note))
                    .await;
                return Err(e.into());
            }
        };
        info!(
            volume_id = %volume_id,
            bucket_access = %resolution.grant.name,
            bucket = %resolution.bucket.name,
            "Resources resolved"
        );
        self.events
            .publish(
                &pod,
                EventType::Normal,
                reasons::RESOURCE_READY,
                actions::PUBLISH,
                Some(format!(
                    "BucketAccess {} and Bucket {} are ready",
                    resolution.grant.name, resolution.bucket.name
                )),
            )
            .await;

        let protocol =
            credentials::extract_protocol(&resolution.bucket).map_err(PublishError::Protocol)?;

        // A directory without metadata is left over from a failed call and
        // belongs to whichever call completes next
        let published = self
            .provisioner
            .is_published(volume_id)
            .map_err(PublishError::CreateDir)?;
        self.provisioner
            .create_bucket_dir(volume_id)
            .map_err(PublishError::CreateDir)?;

        // Past this point every failure is rolled back
        let mut progress = Progress {
            owns_volume: !published,
            ..Default::default()
        };
        let finalizer = finalizer_for(&ctx.pod_namespace, &ctx.pod_name);

        let result = self
            .materialize(
                volume_id,
                target_path,
                &ctx,
                &resolution,
                &protocol,
                &finalizer,
                &mut progress,
            )
            .await;

        if let Err(e) = result {
            return Err(self
                .rollback(volume_id, target_path, &resolution.grant.name, &finalizer, progress, e)
                .await);
        }

        self.events
            .publish(
                &pod,
                EventType::Normal,
                reasons::SUCCESS,
                actions::PUBLISH,
                Some(format!("Successfully published volume {}", volume_id)),
            )
            .await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn materialize(
        &self,
        volume_id: &str,
        target_path: &Path,
        ctx: &VolumeContext,
        resolution: &Resolution,
        protocol: &[u8],
        finalizer: &str,
        progress: &mut Progress,
    ) -> Result<(), PublishError> {
        let credentials =
            credentials::extract_secret(&resolution.secret).map_err(PublishError::ParseSecret)?;

        self.provisioner
            .write_bucket_file(protocol, volume_id, PROTOCOL_FILE_NAME)
            .map_err(PublishError::WriteProtocol)?;
        self.provisioner
            .write_bucket_file(&credentials, volume_id, CREDENTIALS_FILE_NAME)
            .map_err(PublishError::WriteCredentials)?;

        let pod = events::pod_reference(&ctx.pod_namespace, &ctx.pod_name);
        self.events
            .publish(
                &pod,
                EventType::Normal,
                reasons::WRITING_CREDENTIALS,
                actions::PUBLISH,
                Some("Credentials written to bucket directory".to_string()),
            )
            .await;

        self.provisioner
            .mount_bind(volume_id, target_path)
            .map_err(PublishError::Mount)?;
        progress.mounted = true;

        let grant = &resolution.grant.name;
        progress.finalizer_added = self
            .client
            .add_grant_finalizer(grant, finalizer)
            .await
            .map_err(PublishError::AddFinalizer)?;
        if progress.finalizer_added {
            metrics::record_finalizer_update("add");
            debug!(bucket_access = %grant, finalizer = %finalizer, "Finalizer added");
        }

        let metadata = Metadata::new(grant.as_str(), &ctx.pod_name, &ctx.pod_namespace);
        self.provisioner
            .write_metadata(volume_id, &metadata)
            .map_err(PublishError::WriteMetadata)
    }

    async fn rollback(
        &self,
        volume_id: &str,
        target_path: &Path,
        grant: &str,
        finalizer: &str,
        progress: Progress,
        original: PublishError,
    ) -> PublishError {
        warn!(
            volume_id = %volume_id,
            error = %original,
            progress = ?progress,
            "Publish failed, rolling back"
        );
        let mut failures = Vec::new();

        if progress.finalizer_added {
            match self.client.remove_grant_finalizer(grant, finalizer).await {
                Ok(_) => metrics::record_finalizer_update("remove"),
                Err(e) => failures.push(RollbackError::RemoveFinalizer(e)),
            }
        }

        let mut still_mounted = false;
        if progress.mounted {
            if let Err(e) = self.provisioner.unmount(target_path) {
                still_mounted = true;
                failures.push(RollbackError::Unmount(e));
            }
        }

        // Removing the mount source under a live bind mount would strand it
        if progress.owns_volume && !still_mounted {
            if let Err(e) = self.provisioner.remove_volume(volume_id) {
                failures.push(RollbackError::RemoveVolume(e));
            }
        } else if !progress.owns_volume {
            warn!(volume_id = %volume_id, "Volume is already published, leaving it in place");
        }

        metrics::record_rollback(failures.is_empty());
        if failures.is_empty() {
            original
        } else {
            PublishError::RollbackFailed {
                original: Box::new(original),
                failures,
            }
        }
    }

    /// Reverse a publish of `volume_id` at `target_path`.
    pub async fn unpublish(&self, volume_id: &str, target_path: &Path) -> Result<(), UnpublishError> {
        let Some(metadata) = self
            .provisioner
            .read_metadata(volume_id)
            .map_err(UnpublishError::ReadMetadata)?
        else {
            // Publish never completed or this volume was already torn down
            warn!(volume_id = %volume_id, "No metadata for volume, cleaning up local state only");
            self.provisioner
                .unmount(target_path)
                .map_err(UnpublishError::Unmount)?;
            self.provisioner
                .remove_volume(volume_id)
                .map_err(UnpublishError::RemoveDir)?;
            return Ok(());
        };

        let grant = match self.resolver.access_grant(&metadata.ba_name).await {
            Ok(grant) => Some(grant),
            Err(e) if e.is_not_found() => {
                warn!(
                    volume_id = %volume_id,
                    bucket_access = %metadata.ba_name,
                    "BucketAccess no longer exists, skipping finalizer removal"
                );
                None
            }
            Err(e) => return Err(UnpublishError::GetGrant(e)),
        };

        // Metadata outlives the finalizer so a failed removal can be retried
        self.provisioner
            .unmount(target_path)
            .map_err(UnpublishError::Unmount)?;
        self.provisioner
            .remove_bucket_dir(volume_id)
            .map_err(UnpublishError::RemoveDir)?;

        if let Some(grant) = grant {
            let finalizer = metadata.finalizer();
            match self.client.remove_grant_finalizer(&grant.name, &finalizer).await {
                Ok(true) => metrics::record_finalizer_update("remove"),
                Ok(false) => debug!(bucket_access = %grant.name, "Finalizer already absent"),
                Err(e) if e.is_not_found() => {
                    warn!(bucket_access = %grant.name, "BucketAccess deleted before finalizer removal")
                }
                Err(e) => return Err(UnpublishError::RemoveFinalizer(e)),
            }
        }

        self.provisioner
            .remove_volume(volume_id)
            .map_err(UnpublishError::RemoveDir)?;

        let pod = events::pod_reference(&metadata.pod_namespace, &metadata.pod_name);
        self.events
            .publish(
                &pod,
                EventType::Normal,
                reasons::SUCCESS,
                actions::UNPUBLISH,
                Some(format!("Successfully unpublished volume {}", volume_id)),
            )
            .await;
        Ok(())
    }
}

/// CSI Node Service
///
/// Implements the CSI Node service which handles:
/// - Volume publishing (resolve credentials, write files, bind mount)
/// - Volume unpublishing (unmount, remove files, release the bucket access)
/// - Node identity and capability reporting
#[derive(Clone)]
pub struct NodeService {
    /// The node identifier for this CSI node
    node_id: String,
    /// Volume limit reported to the scheduler, 0 for no limit
    max_volumes_per_node: i64,
    lifecycle: Arc<VolumeLifecycle>,
}

impl NodeService {
    pub fn new(node_id: impl Into<String>, max_volumes_per_node: i64, lifecycle: VolumeLifecycle) -> Self {
        Self {
            node_id: node_id.into(),
            max_volumes_per_node,
            lifecycle: Arc::new(lifecycle),
        }
    }

    /// Validate that a path is safe to use in shell commands.
    /// Returns an error if the path contains dangerous characters.
    fn validate_path(path: &str) -> Result<(), Status> {
        if path.is_empty() {
            return Err(Status::invalid_argument("Path cannot be empty"));
        }

        // Check for absolute path
        if !path.starts_with('/') {
            return Err(Status::invalid_argument("Path must be absolute"));
        }

        // Disallow dangerous characters that could enable shell injection
        let dangerous_chars = [
            ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r', '\0',
        ];
        for c in dangerous_chars {
            if path.contains(c) {
                return Err(Status::invalid_argument(format!(
                    "Path contains dangerous character: '{}'",
                    c.escape_default()
                )));
            }
        }

        // Disallow path traversal
        if path.contains("..") {
            return Err(Status::invalid_argument(
                "Path cannot contain '..' (path traversal)",
            ));
        }

        Ok(())
    }

    /// The volume ID names a directory under the data root.
    fn validate_volume_id(&self, volume_id: &str) -> Result<(), Status> {
        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        self.lifecycle
            .provisioner()
            .volume_path(volume_id)
            .map(|_| ())
            .map_err(|e| Status::invalid_argument(e.to_string()))
    }
}

/// Resolve a spawned lifecycle task into the RPC result.
fn complete<E>(
    operation: &'static str,
    volume_id: &str,
    timer: OperationTimer,
    joined: Result<Result<(), E>, JoinError>,
) -> Result<(), Status>
where
    E: std::error::Error + Into<Status>,
{
    let status = match joined {
        Ok(Ok(())) => {
            timer.success();
            return Ok(());
        }
        Ok(Err(e)) => {
            error!(volume_id = %volume_id, error = %e, "{} failed", operation);
            e.into()
        }
        Err(e) => {
            error!(volume_id = %volume_id, error = %e, "{} task aborted", operation);
            Status::internal(format!("{} task aborted: {}", operation, e))
        }
    };
    timer.failure(code_label(status.code()));
    Err(status)
}

fn code_label(code: Code) -> &'static str {
    match code {
        Code::InvalidArgument => "invalid_argument",
        Code::NotFound => "not_found",
        Code::FailedPrecondition => "failed_precondition",
        Code::Unavailable => "unavailable",
        Code::Aborted => "aborted",
        _ => "internal",
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    /// Publish bucket credentials at the target path.
    ///
    /// Runs on its own task: once the volume directory exists, the sequence
    /// (including rollback) completes even if the caller goes away.
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_publish_volume");
        let req = request.into_inner();

        self.validate_volume_id(&req.volume_id)?;
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path is required"));
        }
        Self::validate_path(&req.target_path)?;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "NodePublishVolume request"
        );

        let lifecycle = self.lifecycle.clone();
        let volume_id = req.volume_id.clone();
        let joined = tokio::spawn(async move {
            lifecycle
                .publish(&req.volume_id, Path::new(&req.target_path), &req.volume_context)
                .await
        })
        .await;
        complete("NodePublishVolume", &volume_id, timer, joined)?;

        info!(volume_id = %volume_id, "Volume published successfully");
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    /// Unpublish a volume from the target path.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unpublish_volume");
        let req = request.into_inner();

        self.validate_volume_id(&req.volume_id)?;
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path is required"));
        }
        Self::validate_path(&req.target_path)?;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "NodeUnpublishVolume request"
        );

        let lifecycle = self.lifecycle.clone();
        let volume_id = req.volume_id.clone();
        let joined = tokio::spawn(async move {
            lifecycle
                .unpublish(&req.volume_id, Path::new(&req.target_path))
                .await
        })
        .await;
        complete("NodeUnpublishVolume", &volume_id, timer, joined)?;

        info!(volume_id = %volume_id, "Volume unpublished successfully");
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    /// Get information about this node.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        debug!(node_id = %self.node_id, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: self.max_volumes_per_node,
            accessible_topology: None,
        }))
    }

    /// Report node capabilities. Publish and unpublish need none.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities: Vec::new(),
        }))
    }

    async fn node_stage_volume(
        &self,
        _request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeStageVolume is not supported"))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeUnstageVolume is not supported"))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeExpandVolume is not supported"))
    }

    /// Get volume statistics (not implemented).
    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("NodeGetVolumeStats is not supported"))
    }
}
