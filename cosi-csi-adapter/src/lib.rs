//! COSI CSI Node Adapter Library
//!
//! Kubernetes CSI node plugin that exposes object storage buckets provisioned
//! through the Container Object Storage Interface to workloads. On publish it
//! writes the bucket connection details and credentials into a per-volume
//! directory and bind mounts it into the pod.
//!
//! This library provides:
//! - CSI Identity and Node service implementations
//! - Resolution of the bucket access chain through the cluster API
//! - Volume directory layout and bind mount management
//! - In-memory capability fakes for tests (`test-util` feature)

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod client;
pub mod credentials;
pub mod error;
pub mod events;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod identity;
pub mod kube_client;
pub mod metrics;
pub mod node;
pub mod platform;
pub mod provisioner;
pub mod resolver;
pub mod types;

pub use identity::IdentityService;
pub use node::{NodeService, VolumeLifecycle};
pub use provisioner::Provisioner;
pub use resolver::Resolver;
