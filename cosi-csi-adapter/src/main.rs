//! COSI CSI Node Adapter
//!
//! Kubernetes CSI node plugin that publishes COSI bucket credentials into
//! pods as ephemeral volumes.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use cosi_csi_adapter::csi::identity_server::IdentityServer;
use cosi_csi_adapter::csi::node_server::NodeServer;
use cosi_csi_adapter::events::KubeEventPublisher;
use cosi_csi_adapter::identity::{DEFAULT_DRIVER_NAME, DRIVER_VERSION};
use cosi_csi_adapter::kube_client::KubeResourceClient;
use cosi_csi_adapter::metrics;
use cosi_csi_adapter::types::ListenEndpoint;
use cosi_csi_adapter::{IdentityService, NodeService, Provisioner, VolumeLifecycle};

/// CLI arguments for the node adapter
#[derive(Parser, Debug)]
#[command(name = "cosi-csi-adapter")]
#[command(about = "COSI CSI node adapter for Kubernetes")]
struct Args {
    /// Driver name reported to kubelet and used as the event reporter
    #[arg(long, env = "COSI_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    identity: String,

    /// Node ID for this CSI node (defaults to the hostname)
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// CSI endpoint (unix:///path or tcp://host:port)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///var/lib/cosi/csi.sock")]
    endpoint: ListenEndpoint,

    /// Directory holding one subdirectory per published volume
    #[arg(long, env = "COSI_DATA_ROOT", default_value = "/var/lib/cosi")]
    data_root: String,

    /// Maximum volumes per node reported in NodeGetInfo (0 for no limit)
    #[arg(long, env = "COSI_MAX_VOLUMES", default_value = "0")]
    max_volumes: i64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Deadline for each cluster API call, in seconds
    #[arg(long, env = "COSI_API_TIMEOUT_SECS", default_value = "30")]
    api_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Initialize Prometheus metrics endpoint if configured
    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    if args.identity.is_empty() {
        return Err("driver name must not be empty".into());
    }
    if args.max_volumes < 0 {
        return Err(format!("--max-volumes must be >= 0, got {}", args.max_volumes).into());
    }

    // Determine node_id
    let node_id = match args.node_id {
        Some(id) if !id.is_empty() => id,
        _ => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        driver_name = %args.identity,
        version = DRIVER_VERSION,
        endpoint = %args.endpoint,
        node_id = %node_id,
        data_root = %args.data_root,
        "Starting COSI CSI node adapter"
    );

    tokio::fs::create_dir_all(&args.data_root)
        .await
        .map_err(|e| format!("Failed to create data root '{}': {}", args.data_root, e))?;

    let kube = kube::Client::try_default().await?;
    let client = Arc::new(KubeResourceClient::new(
        kube.clone(),
        Duration::from_secs(args.api_timeout_secs),
    ));
    let events = Arc::new(KubeEventPublisher::new(kube, &args.identity));
    let lifecycle = VolumeLifecycle::new(client, Provisioner::host(&args.data_root), events);

    let identity = IdentityService::new(args.identity.clone(), DRIVER_VERSION);
    let node = NodeService::new(node_id, args.max_volumes, lifecycle);

    let router = Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_service(NodeServer::new(node));

    let shutdown = async {
        shutdown_signal().await;
        info!("Shutdown signal received, draining connections...");
    };

    match &args.endpoint {
        ListenEndpoint::Unix(path) => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // Remove a socket left behind by a previous run
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!(path = %path.display(), "Removed stale socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let listener = UnixListener::bind(path)?;
            info!("gRPC server listening on {}", args.endpoint);
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                .await?;
        }
        ListenEndpoint::Tcp(addr) => {
            info!("gRPC server listening on {}", args.endpoint);
            router.serve_with_shutdown(*addr, shutdown).await?;
        }
    }

    info!("COSI CSI node adapter shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    // Install signal handlers, logging errors but continuing with available handlers
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGHUP handler: {}", e);
            None
        }
    };

    tokio::select! {
        Some(_) = async { sigterm.as_mut()?.recv().await }, if sigterm.is_some() => {
            info!("Received SIGTERM");
        }
        Some(_) = async { sigint.as_mut()?.recv().await }, if sigint.is_some() => {
            info!("Received SIGINT");
        }
        Some(_) = async { sighup.as_mut()?.recv().await }, if sighup.is_some() => {
            info!("Received SIGHUP, shutting down");
        }
        else => {
            tracing::error!("No signal handlers installed, graceful shutdown disabled");
            std::future::pending::<()>().await;
        }
    }
}
