//! clusterd -- cluster node server.
//!
//! Starts a node from a YAML configuration file: bootstraps a new cluster
//! when no peer address is configured, otherwise joins the cluster through
//! that peer. SIGTERM/SIGINT stop every subsystem in reverse start order.

use clap::Parser;
use tracing::{error, info, warn};

use clusterd::config::{Config, GRPC_ADDR_KEY, HTTP_ADDR_KEY};
use clusterd::http::AccessLogger;
use clusterd::{JoinOutcome, Manager, ManagerOptions};

/// Command-line arguments for the clusterd server.
#[derive(Parser, Debug)]
#[command(name = "clusterd", version, about = "Cluster node server")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "clusterd.example.yaml")]
    config: String,

    /// Override the node id.
    #[arg(long)]
    id: Option<String>,

    /// Join the cluster through this member's RPC address.
    #[arg(long)]
    peer_addr: Option<String>,

    /// Override the RPC listen address (`grpc_addr` metadata).
    #[arg(long)]
    grpc_addr: Option<String>,

    /// Override the HTTP listen address (`http_addr` metadata).
    #[arg(long)]
    http_addr: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(id) = self.id {
            config.node.id = id;
        }
        if let Some(peer_addr) = self.peer_addr {
            config.node.peer_addr = peer_addr;
        }
        if let Some(addr) = self.grpc_addr {
            config.node.metadata.insert(GRPC_ADDR_KEY.to_string(), addr.into());
        }
        if let Some(addr) = self.http_addr {
            config.node.metadata.insert(HTTP_ADDR_KEY.to_string(), addr.into());
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = clusterd::config::load_config(&cli.config)?;
    let config_path = cli.config.clone();
    cli.apply(&mut config);

    init_tracing(&config);
    info!("Loaded configuration from {}", config_path);

    if config.observability.metrics {
        clusterd::metrics::init_metrics()?;
        clusterd::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let mut manager = Manager::new(
        config.node.id.clone(),
        config.node.metadata.clone(),
        config.node.peer_addr.clone(),
        config.index.clone(),
        AccessLogger::new(config.access_log.enabled),
    )
    .with_options(ManagerOptions::from(&config.lifecycle));

    if let Some(mut failures) = manager.take_background_failures() {
        tokio::spawn(async move {
            while let Some(failure) = failures.recv().await {
                warn!(
                    subsystem = %failure.subsystem,
                    "node running degraded after background start failure"
                );
            }
        });
    }

    match manager.start().await {
        Ok(JoinOutcome::Bootstrapped) => info!(node_id = %config.node.id, "founded a new cluster"),
        Ok(JoinOutcome::Joined { peer_addr }) => {
            info!(node_id = %config.node.id, %peer_addr, "joined cluster")
        }
        Ok(JoinOutcome::JoinFailed { peer_addr, error }) => warn!(
            node_id = %config.node.id,
            %peer_addr,
            error = %format!("{error:#}"),
            "running outside the cluster; retry with `clusterctl node set`"
        ),
        Err(err) => {
            error!(error = %err, "failed to start node");
            if let Err(stop_err) = manager.stop().await {
                warn!(error = %stop_err, "cleanup after failed start was incomplete");
            }
            return Err(err.into());
        }
    }

    if let (Some(rpc), Some(http)) = (manager.rpc_addr(), manager.http_addr()) {
        info!(rpc_addr = %rpc, http_addr = %http, "clusterd running");
    }

    shutdown_signal().await;

    manager.stop().await?;
    info!("clusterd shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
