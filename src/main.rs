// hermes-store node binary: wires config, storage, the replication node,
// its TCP server and the failure detector together.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use hermes_store::{
    ClusterConfig, ClusterNode, FailureDetector, NetworkServer, ProtocolConfig, StorageHelper,
};

#[derive(Parser, Debug)]
#[command(name = "hermes-store")]
struct Args {
    /// Listen port; doubles as this node's id.
    #[arg(long)]
    port: u16,

    /// Cluster file listing one member port per line.
    #[arg(long)]
    config_file: PathBuf,

    /// Snapshot store directory (a per-port subdirectory is created).
    #[arg(long, default_value = "hermes_db")]
    db_dir: PathBuf,

    /// Write-ahead log directory (a per-port subdirectory is created).
    #[arg(long, default_value = "hermes_log")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let cluster =
        ClusterConfig::load(&args.config_file, args.port).context("load cluster config")?;
    let protocol = ProtocolConfig::default();

    let storage = StorageHelper::open(
        args.log_dir.join(args.port.to_string()),
        args.db_dir.join(args.port.to_string()),
        protocol.wal_partitions,
        protocol.snapshot_interval,
    )
    .context("open storage")?;

    tracing::info!(port = args.port, peers = cluster.peers.len(), "starting node");

    let node = Arc::new(ClusterNode::new(
        cluster.listen_addr,
        cluster.peers,
        protocol,
        Some(storage),
    ));

    let server = NetworkServer::new(Arc::clone(&node), node.address);
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    let detector_node = Arc::clone(&node);
    let detector_task = tokio::spawn(async move {
        FailureDetector::new(detector_node).run().await;
    });

    tokio::select! {
        _ = node.wait_shutdown() => {
            tracing::info!("terminate accepted, shutting down");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("install ctrl-c handler")?;
            tracing::info!("interrupted, shutting down");
        }
    }

    server_task.abort();
    detector_task.abort();
    Ok(())
}
