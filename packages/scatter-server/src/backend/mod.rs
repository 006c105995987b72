//! Storage backend adapters.
//!
//! The pipelines treat every device as the same capability set (store,
//! retrieve, remove a chunk) and all heterogeneity lives here:
//!
//! - [`agent::AgentBackend`] reaches a device through the relay fabric and
//!   the STORE/RETRIEVE/DELETE envelope protocol.
//! - [`cloud::CloudBackend`] calls the provider API with the user's token.
//!
//! Adapter failures are candidate failures: the caller walks on to the next
//! replica and only surfaces an error once every candidate is exhausted.

pub mod agent;
pub mod cloud;

use async_trait::async_trait;

use scatter_core::types::Device;
use scatter_core::Result;

use crate::state::AppState;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Store chunk bytes; returns once the device has acknowledged.
    async fn put(&self, chunk_id: &str, data: Vec<u8>) -> Result<()>;

    /// Fetch chunk bytes back.
    async fn get(&self, chunk_id: &str) -> Result<Vec<u8>>;

    /// Best-effort delete; idempotent.
    async fn remove(&self, chunk_id: &str) -> Result<()>;
}

/// The adapter matching a device's type.
pub fn backend_for(state: &AppState, user_id: &str, device: &Device) -> Box<dyn Backend> {
    if device.device_type.is_cloud() {
        Box::new(cloud::CloudBackend::new(state.cloud.clone(), user_id))
    } else {
        Box::new(agent::AgentBackend::new(state.relay.clone(), &device.id))
    }
}
