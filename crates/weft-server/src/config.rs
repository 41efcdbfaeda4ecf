//! Server configuration assembled from CLI arguments.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;

use weft_hub::{DedupConfig, HubConfig, SessionConfig};

/// Validated server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address
    pub bind: SocketAddr,
    /// Node id used on the pub/sub fabric; random when not set
    pub node_id: Option<String>,
    /// Hub tuning
    pub hub: HubConfig,
}

impl Config {
    /// Build a configuration from raw CLI values
    ///
    /// # Errors
    ///
    /// Fails when the bind address does not parse or a duration is zero.
    pub fn from_args(
        bind: &str,
        node_id: Option<String>,
        cleanup_delay_secs: u64,
        dedup_ttl_secs: u64,
    ) -> anyhow::Result<Self> {
        let bind: SocketAddr = bind
            .parse()
            .with_context(|| format!("invalid bind address: {bind}"))?;
        anyhow::ensure!(cleanup_delay_secs > 0, "cleanup delay must be positive");
        anyhow::ensure!(dedup_ttl_secs > 0, "dedup ttl must be positive");

        let hub = HubConfig {
            session: SessionConfig {
                cleanup_delay: Duration::from_secs(cleanup_delay_secs),
                dedup: DedupConfig {
                    ttl: Duration::from_secs(dedup_ttl_secs),
                    ..DedupConfig::default()
                },
                ..SessionConfig::default()
            },
            ..HubConfig::default()
        };

        Ok(Self { bind, node_id, hub })
    }
}
