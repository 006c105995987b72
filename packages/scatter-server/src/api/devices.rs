//! Device registry endpoints: registration, heartbeat, claiming, listing,
//! deletion, and cloud backend attachment.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use scatter_core::types::{
    ClaimRequest, Device, HeartbeatRequest, RegisterRequest, RegisterResponse,
};
use scatter_core::Error;

use crate::api::auth::AuthUser;
use crate::config;
use crate::db::CloudToken;
use crate::error::ApiResult;
use crate::rebalance;
use crate::state::AppState;

/// `POST /register`: agent self-registration (unauthenticated).
///
/// Upserts the device row and stamps it online. A device already claimed by
/// a user gets a rebalance enqueued, since fresh capacity just appeared.
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Json<RegisterResponse>> {
    if req.public_key.is_empty() {
        return Err(Error::invalid("public_key is required").into());
    }

    let device_id = state.db.upsert_device(&req, &addr.ip().to_string())?;
    tracing::info!(device_id = device_id.as_str(), name = req.name.as_str(), "Device registered");

    if let Some(owner) = state.db.device_owner(&device_id)? {
        rebalance::trigger(state.clone(), owner);
    }

    Ok(Json(RegisterResponse { device_id }))
}

/// `POST /heartbeat`: keep-alive (unauthenticated).
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<StatusCode> {
    if !state.db.heartbeat(&req.device_id)? {
        return Err(Error::NotFound(format!("device {}", req.device_id)).into());
    }
    Ok(StatusCode::OK)
}

/// `GET /peers`: every device with a fresh heartbeat.
pub async fn peers(State(state): State<AppState>) -> ApiResult<Json<Vec<Device>>> {
    let peers = state.db.list_online_peers(config::offline_window())?;
    Ok(Json(peers))
}

/// `POST /api/devices/claim`: bind a device to the calling user.
pub async fn claim(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<StatusCode> {
    if !state
        .db
        .claim_device(&user_id, &req.device_id, &req.claim_token)?
    {
        return Err(Error::Forbidden("invalid device id or claim token".into()).into());
    }
    tracing::info!(
        user_id = user_id.as_str(),
        device_id = req.device_id.as_str(),
        "Device claimed"
    );
    rebalance::trigger(state.clone(), user_id);
    Ok(StatusCode::OK)
}

/// `GET /api/devices`: the calling user's devices.
pub async fn my_devices(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<Device>>> {
    Ok(Json(state.db.list_devices(&user_id)?))
}

#[derive(Debug, Deserialize)]
pub struct DeviceIdQuery {
    pub id: String,
}

/// `DELETE /api/devices/delete?id=`: remove a device and its placements.
pub async fn delete_device(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<DeviceIdQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.db.delete_device(&user_id, &query.id)? {
        return Err(Error::NotFound(format!("device {}", query.id)).into());
    }
    tracing::info!(
        user_id = user_id.as_str(),
        device_id = query.id.as_str(),
        "Device deleted"
    );
    Ok(Json(json!({ "status": "deleted" })))
}

#[derive(Debug, Deserialize)]
pub struct CloudConnectRequest {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

/// `POST /api/cloud/connect`: install a cloud token obtained by an external
/// OAuth flow and register the user's virtual cloud device.
pub async fn cloud_connect(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<CloudConnectRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.access_token.is_empty() {
        return Err(Error::invalid("access_token is required").into());
    }

    state.db.save_cloud_token(
        &user_id,
        &CloudToken {
            access_token: req.access_token,
            refresh_token: req.refresh_token,
            token_type: req.token_type.unwrap_or_else(|| "Bearer".into()),
            expiry: req.expiry,
        },
    )?;

    let device_id = format!("Cloud-{user_id}");
    state
        .db
        .upsert_cloud_device(&user_id, &device_id, "Cloud Storage")?;
    tracing::info!(user_id = user_id.as_str(), device_id = device_id.as_str(), "Cloud device attached");

    rebalance::trigger(state.clone(), user_id);
    Ok(Json(json!({ "device_id": device_id })))
}

/// `POST /api/admin/rebalance`: kick off a rebalance for the calling user.
pub async fn admin_rebalance(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
) -> &'static str {
    rebalance::trigger(state, user_id);
    "Rebalancing started in background"
}
