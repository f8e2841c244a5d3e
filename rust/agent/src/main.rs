//! Hyperlane agent - main entry point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};

use hyperlane_agent::logging::init_tracing;
use hyperlane_agent::{
    Hypervisor, LibvirtConfig, LibvirtHypervisor, Reporter, ReporterConfig, SystemRunner,
    VmServiceImpl,
};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "hyperlane-agent")]
#[command(about = "Hyperlane agent - executes VM lifecycle commands on this node")]
#[command(version)]
struct Args {
    /// Address to serve `VmService` on.
    #[arg(long, env = "HYPERLANE_AGENT_LISTEN", default_value = "0.0.0.0:50051")]
    listen: SocketAddr,

    #[arg(long, env = "HYPERLANE_AGENT_CERT", default_value = "certs/server.crt")]
    cert: PathBuf,

    #[arg(long, env = "HYPERLANE_AGENT_KEY", default_value = "certs/server.key")]
    key: PathBuf,

    /// CA that signs control plane client certificates.
    #[arg(long, env = "HYPERLANE_AGENT_CLIENT_CA", default_value = "certs/ca.crt")]
    client_ca: PathBuf,

    /// Identifier sent with state reports (defaults to the host name).
    #[arg(long, env = "HYPERLANE_AGENT_NODE_ID")]
    node_id: Option<String>,

    #[arg(long, env = "HYPERLANE_AGENT_IMAGES_DATASET", default_value = "images")]
    images_dataset: String,

    #[arg(long, env = "HYPERLANE_AGENT_VMS_DATASET", default_value = "vms")]
    vms_dataset: String,

    #[arg(long, env = "HYPERLANE_AGENT_NETWORK", default_value = "default")]
    network: String,

    /// Control plane report endpoint; state push is disabled when unset.
    #[arg(long, env = "HYPERLANE_AGENT_REPORT_ENDPOINT")]
    report_endpoint: Option<String>,

    #[arg(long, env = "HYPERLANE_AGENT_REPORT_INTERVAL_SECS", default_value_t = 15)]
    report_interval_secs: u64,

    /// TLS server name of the control plane, if it differs from the host.
    #[arg(long, env = "HYPERLANE_AGENT_REPORT_DOMAIN", default_value = "")]
    report_domain: String,

    /// Client certificate presented to the control plane.
    #[arg(long, env = "HYPERLANE_AGENT_REPORT_CERT", default_value = "certs/agent.crt")]
    report_cert: PathBuf,

    #[arg(long, env = "HYPERLANE_AGENT_REPORT_KEY", default_value = "certs/agent.key")]
    report_key: PathBuf,

    #[arg(long, env = "HYPERLANE_AGENT_LOG", default_value = "hyperlane_agent=info")]
    log_level: String,

    #[arg(long, env = "HYPERLANE_AGENT_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json)?;

    let node_id = args.node_id.clone().unwrap_or_else(default_node_id);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %node_id,
        "Starting Hyperlane agent"
    );

    let hypervisor: Arc<dyn Hypervisor> = Arc::new(LibvirtHypervisor::new(
        SystemRunner,
        LibvirtConfig {
            images_dataset: args.images_dataset.clone(),
            vms_dataset: args.vms_dataset.clone(),
            network: args.network.clone(),
        },
    ));

    let cancel = CancellationToken::new();

    let reporter_task = match &args.report_endpoint {
        Some(endpoint) => {
            let reporter = Reporter::new(
                Arc::clone(&hypervisor),
                node_id.clone(),
                &ReporterConfig {
                    endpoint: endpoint.clone(),
                    ca_cert: args.client_ca.clone(),
                    client_cert: args.report_cert.clone(),
                    client_key: args.report_key.clone(),
                    domain_name: args.report_domain.clone(),
                    interval: Duration::from_secs(args.report_interval_secs),
                    timeout: Duration::from_secs(5),
                },
            )?;
            let cancel = cancel.clone();
            Some(tokio::spawn(async move { reporter.run(cancel).await }))
        }
        None => None,
    };

    let tls = server_tls(&args)?;
    let service = VmServiceImpl::new(hypervisor, node_id);

    tracing::info!(addr = %args.listen, "Agent listening");

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    };

    Server::builder()
        .tls_config(tls)
        .context("invalid TLS configuration")?
        .add_service(service.into_service())
        .serve_with_shutdown(args.listen, shutdown)
        .await
        .context("agent server failed")?;

    cancel.cancel();
    if let Some(task) = reporter_task {
        task.await.context("reporter task panicked")?;
    }

    tracing::info!("Agent shut down gracefully");
    Ok(())
}

fn server_tls(args: &Args) -> anyhow::Result<ServerTlsConfig> {
    let cert = std::fs::read(&args.cert)
        .with_context(|| format!("reading server certificate {}", args.cert.display()))?;
    let key = std::fs::read(&args.key)
        .with_context(|| format!("reading server key {}", args.key.display()))?;
    let client_ca = std::fs::read(&args.client_ca)
        .with_context(|| format!("reading client CA {}", args.client_ca.display()))?;

    Ok(ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(client_ca)))
}

fn default_node_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        () = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
