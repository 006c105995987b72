//! Shared server state.
//!
//! Constructed once in `main` and cloned into every handler. The metadata
//! store is the only durable piece; the relay, auth sessions, and rebalance
//! latches are in-memory and rebuilt on restart.

use std::sync::Arc;

use dashmap::DashMap;

use crate::backend::cloud::CloudDrive;
use crate::config::ServerConfig;
use crate::db::Database;
use crate::relay::Relay;

/// Auth session token → user id.
pub type SessionMap = Arc<DashMap<String, String>>;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub relay: Relay,
    /// Login sessions (cookie token → user id).
    pub sessions: SessionMap,
    pub cloud: CloudDrive,
    pub config: ServerConfig,
    /// Per-user rebalance latch: a key present means a run is in flight.
    pub rebalance_running: Arc<DashMap<String, ()>>,
}

impl AppState {
    pub fn new(db: Database, relay: Relay, cloud: CloudDrive, config: ServerConfig) -> Self {
        Self {
            db,
            relay,
            sessions: Arc::new(DashMap::new()),
            cloud,
            config,
            rebalance_running: Arc::new(DashMap::new()),
        }
    }
}
