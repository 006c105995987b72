//! Protocol constants and server configuration.
//!
//! The constants are the data-path contract shared with agents; changing
//! them changes wire behavior, so they live here rather than on the CLI.
//! Operational knobs (port, paths, intervals) come from `Args` in `main`.

use std::time::Duration;

/// Server-side chunk window for uploads.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Blobs a relay FIFO buffers before producers start blocking.
pub const RELAY_CAPACITY: usize = 10;

/// How long a producer may block enqueueing before the blob is dropped.
pub const RELAY_SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// How long `/relay/recv` waits for a blob before timing out.
pub const RELAY_RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// A FIFO created by a producer with no consumer is swept after this long.
pub const RELAY_SWEEP_AFTER: Duration = Duration::from_secs(60);

/// How long an upload waits for an agent's STORE ack.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a download or move waits for an agent to return a chunk.
pub const RETRIEVE_TIMEOUT: Duration = Duration::from_secs(15);

/// Agents are expected to heartbeat at this cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A device whose last heartbeat is older than this is offline.
pub const OFFLINE_THRESHOLD: Duration = Duration::from_secs(30);

/// Rebalance moves off devices above `high × avg` onto devices below
/// `low × avg`.
pub const REBALANCE_HIGH: f64 = 1.2;
pub const REBALANCE_LOW: f64 = 0.8;

/// Upper bound on chunks examined per move_chunks call.
pub const REBALANCE_BATCH: usize = 50;

/// Runtime configuration assembled from CLI/env in `main`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: String,
    /// OAuth client credentials for refreshing cloud tokens. Optional; when
    /// absent, expired cloud tokens fail the cloud backend until replaced.
    pub cloud_client_id: Option<String>,
    pub cloud_client_secret: Option<String>,
    /// Cadence of the task that clears stale `online` flags.
    pub offline_sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            db_path: "./data/scatter.db".to_string(),
            cloud_client_id: None,
            cloud_client_secret: None,
            offline_sweep_interval: Duration::from_secs(30),
        }
    }
}

/// `chrono` mirror of [`OFFLINE_THRESHOLD`] for timestamp math.
pub fn offline_window() -> chrono::Duration {
    chrono::Duration::from_std(OFFLINE_THRESHOLD).unwrap_or_else(|_| chrono::Duration::seconds(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8085);
        assert_eq!(CHUNK_SIZE, 1024 * 1024);
        assert_eq!(RELAY_CAPACITY, 10);
        assert!(REBALANCE_LOW < 1.0 && REBALANCE_HIGH > 1.0);
    }
}
