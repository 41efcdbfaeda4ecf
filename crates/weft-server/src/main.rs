//! Weft collaboration hub server.
//!
//! Serves the binary sync protocol over WebSocket at `/sync` and a JSON
//! stats snapshot at `/stats`. This binary wires the hub to the in-memory
//! store and fabric; multi-node deployments embed `weft-hub` and inject
//! their own `DocumentStore` and `PubSub` implementations.

mod config;
mod ws;

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use weft_hub::{MemoryPubSub, MemoryStore, Registry, SharedStorageFactory};

use config::Config;
use ws::AppState;

/// Weft - real-time collaboration hub
#[derive(Parser)]
#[command(name = "weft-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8787")]
    bind: String,

    /// Node id on the pub/sub fabric (random when omitted)
    #[arg(long)]
    node_id: Option<String>,

    /// Seconds an empty session lingers before disposal
    #[arg(long, default_value_t = 60)]
    cleanup_delay: u64,

    /// Seconds a replicated message id stays in the dedup
    #[arg(long, default_value_t = 300)]
    dedup_ttl: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .init();

    let config = Config::from_args(&cli.bind, cli.node_id, cli.cleanup_delay, cli.dedup_ttl)?;

    let factory = Arc::new(SharedStorageFactory::new(MemoryStore::shared()));
    let pubsub = MemoryPubSub::shared();
    let registry = match config.node_id.clone() {
        Some(node_id) => Registry::with_node_id(factory, pubsub, config.hub.clone(), node_id),
        None => Registry::new(factory, pubsub, config.hub.clone()),
    };

    let app = ws::router(AppState {
        registry: Arc::clone(&registry),
    });

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(bind = %config.bind, node_id = %registry.node_id(), "weft server listening");

    let shutdown_registry = Arc::clone(&registry);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_registry.destroy().await;
        })
        .await?;

    Ok(())
}
