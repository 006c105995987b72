//! Domain types and HTTP request/response payloads.
//!
//! These are the rows the metadata store tracks and the JSON bodies the
//! control plane exchanges with browsers and agents. Timestamps are UTC and
//! serialize as RFC3339.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a device stores chunks.
///
/// An `agent` is reached through the relay; a `cloud` device is reached
/// through the provider API and is treated as permanently online.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Agent,
    Cloud,
}

impl DeviceType {
    pub fn is_cloud(&self) -> bool {
        matches!(self, DeviceType::Cloud)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Agent => "agent",
            DeviceType::Cloud => "cloud",
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "agent" => Ok(DeviceType::Agent),
            "cloud" => Ok(DeviceType::Cloud),
            other => Err(crate::Error::invalid(format!("unknown device type: {other}"))),
        }
    }
}

/// A registered device in the user's mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub public_key: String,
    pub name: String,
    pub last_seen: DateTime<Utc>,
    /// Last observed IP, kept for a potential direct-connect optimization.
    pub ip: String,
    pub online: bool,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
}

impl Device {
    /// Whether the device counts as online right now.
    ///
    /// The stored `online` flag is only authoritative within the offline
    /// threshold; cloud devices always qualify.
    pub fn is_online(&self, now: DateTime<Utc>, offline_after: chrono::Duration) -> bool {
        self.device_type.is_cloud() || (self.online && now - self.last_seen <= offline_after)
    }
}

/// A file tracked by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: String,
    /// Basename only; the control plane does not track directory structure.
    pub path: String,
    pub size: u64,
    /// SHA-256 hex of the concatenated plaintext chunks.
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<Chunk>,
}

/// One fixed-size slice of a file.
///
/// The id is content-addressed: `id == hash == sha256_hex(bytes)`, so
/// identical content shares placements and physical storage wherever it
/// appears.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub file_id: String,
    /// 0-based, strictly increasing, gap-free within a file.
    pub sequence: u32,
    pub hash: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<String>,
}

/// Durable record of a file deletion, consumed by offline agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionEvent {
    pub file_id: String,
    pub chunk_ids: Vec<String>,
    pub deleted_at: DateTime<Utc>,
}

// ── Request payloads ─────────────────────────────────────────────────────────

/// `POST /register`: agent self-registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Optional: an agent re-registering presents its previous id.
    #[serde(default)]
    pub device_id: String,
    pub public_key: String,
    pub name: String,
    /// Short hex secret the agent prints on startup; the user's proof of
    /// possession when claiming the device.
    #[serde(default)]
    pub claim_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub device_id: String,
}

/// `POST /heartbeat`: keep-alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub device_id: String,
}

/// `POST /api/devices/claim`: bind a device to the calling user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub device_id: String,
    pub claim_token: String,
}

/// `POST /chunk/location`: an agent reporting that it holds a chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkLocationRequest {
    pub chunk_id: String,
    pub device_id: String,
}
