//! Hub configuration.

use std::time::Duration;

/// Dedup tuning
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long an accepted `(document, message_id)` pair suppresses repeats
    pub ttl: Duration,
    /// Capacity bound; oldest entries are evicted when full
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            max_entries: 100_000,
        }
    }
}

/// Per-session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet period before an empty session is disposed
    pub cleanup_delay: Duration,
    /// Replication dedup tuning
    pub dedup: DedupConfig,
    /// Capacity of the session event bus
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cleanup_delay: Duration::from_secs(60),
            dedup: DedupConfig::default(),
            event_capacity: 256,
        }
    }
}

/// Top-level hub configuration
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// Session defaults
    pub session: SessionConfig,
    /// Transfer deadlines and queue sizing
    pub transfer: TransferConfig,
}

/// File transfer configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Deadline for a download to complete once registered
    pub download_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_timeout: Duration::from_secs(60),
        }
    }
}
