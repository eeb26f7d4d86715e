//! chronod — the ChronoGrid metadata daemon.
//!
//! Runs one replica of the cluster-metadata control plane: leader
//! election over the KV backend, the topology manager, and the
//! metadata service. Standalone mode (the default and currently the
//! only mode) uses the in-memory backend and elects itself.
//!
//! ```text
//! chronod --config /etc/chronogrid/meta.toml
//! chronod --node-name meta-1 --storage-root-path /chronogrid
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use chronogrid_kv::{KvBackend, MemKv};
use chronod::{Config, MetaServer};

#[derive(Parser)]
#[command(name = "chronod", about = "ChronoGrid metadata daemon")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the node name.
    #[arg(long)]
    node_name: Option<String>,

    /// Override the metadata key-namespace root.
    #[arg(long)]
    storage_root_path: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chronod=debug,chronogrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    // Priority low to high: file, environment, CLI flags.
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env_overrides()?;
    if let Some(node_name) = cli.node_name {
        config.node_name = node_name;
    }
    if let Some(root) = cli.storage_root_path {
        config.storage_root_path = root;
    }
    config.validate()?;

    info!(node = %config.node_name, root = %config.storage_root_path, "chronod starting");

    // Standalone mode: the in-memory backend stands in for the embedded
    // consensus KV store.
    let kv: Arc<dyn KvBackend> = Arc::new(MemKv::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = Arc::new(MetaServer::new(&config, kv, &mut shutdown_rx.clone()).await?);

    let run_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run(shutdown_rx).await })
    };

    wait_for_signal().await;
    info!("shutdown signal received");

    server.close();
    let _ = shutdown_tx.send(true);
    run_handle.await??;

    info!("chronod stopped");
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
