//! CSI Identity Service Implementation
//!
//! Provides plugin identification and readiness probing to kubelet.

use std::collections::HashMap;

use tonic::{Request, Response, Status};
use tracing::error;

use crate::csi;

pub const DEFAULT_DRIVER_NAME: &str = "objectstorage.k8s.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// CSI Identity Service
///
/// This is a node-only plugin: no controller service, no volume expansion,
/// so no plugin capabilities are advertised.
pub struct IdentityService {
    name: String,
    version: String,
}

impl IdentityService {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new(DEFAULT_DRIVER_NAME, DRIVER_VERSION)
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    /// Returns the name and version of the CSI plugin.
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        if self.name.is_empty() {
            error!("Driver name not configured");
            return Err(Status::unavailable("driver name not configured"));
        }
        if self.version.is_empty() {
            error!("Driver version not configured");
            return Err(Status::unavailable("driver is missing version"));
        }

        Ok(Response::new(csi::GetPluginInfoResponse {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
            manifest: HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities: Vec::new(),
        }))
    }

    /// Probes the plugin to check if it is ready.
    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        // The plugin is ready when this service is running
        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}
