//! Upload pipeline.
//!
//! The multipart stream is windowed into 1 MiB chunks; each chunk is hashed,
//! recorded, and offered to the user's online devices in round-robin
//! preference order. A chunk only counts as placed once a backend acks it.
//! Chunks are dispatched strictly in sequence, so the sequence column is
//! gap-free by construction.

use axum::extract::{Multipart, State};
use axum::Json;
use serde_json::json;

use scatter_core::chunking::{self, Chunker, FileHasher};
use scatter_core::types::Device;
use scatter_core::Error;

use crate::api::auth::AuthUser;
use crate::backend::backend_for;
use crate::config;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Candidate devices for a chunk, preference order.
///
/// Primary is `devices[sequence mod N]`; the rest follow in stable rotation
/// after it. Walking files chunk-by-chunk this spreads load uniformly with
/// no coordination, and every device eventually fronts for every position.
fn placement_order(devices: &[Device], sequence: usize) -> Vec<&Device> {
    let n = devices.len();
    (0..n).map(|i| &devices[(sequence + i) % n]).collect()
}

/// Strip any directory part a client might smuggle into the filename.
fn basename(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    if name.is_empty() {
        "upload.bin".to_string()
    } else {
        name.to_string()
    }
}

/// `POST /api/upload`: multipart `file` field.
pub async fn upload(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    // Find the file field; skip anything else the form carries.
    let mut field = loop {
        match multipart.next_field().await {
            Ok(Some(f)) if f.name() == Some("file") => break f,
            Ok(Some(_)) => continue,
            Ok(None) => return Err(Error::invalid("missing 'file' field").into()),
            Err(e) => return Err(Error::invalid(format!("bad multipart body: {e}")).into()),
        }
    };
    let filename = basename(field.file_name().unwrap_or("upload.bin"));

    let file_id = state.db.insert_file(&user_id, &filename)?;

    let devices = state
        .db
        .list_online_devices(&user_id, config::offline_window())?;
    if devices.is_empty() {
        return Err(Error::NoPlacement("no online devices to store chunks".into()).into());
    }

    tracing::info!(
        user_id = user_id.as_str(),
        file_id = file_id.as_str(),
        name = filename.as_str(),
        devices = devices.len(),
        "Upload started"
    );

    let mut chunker = Chunker::new(config::CHUNK_SIZE);
    let mut hasher = FileHasher::new();
    let mut total_size: u64 = 0;
    let mut sequence: u32 = 0;

    loop {
        let piece = field
            .chunk()
            .await
            .map_err(|e| Error::invalid(format!("upload stream failed: {e}")))?;
        let Some(piece) = piece else { break };

        hasher.update(&piece);
        total_size += piece.len() as u64;

        for window in chunker.push(&piece) {
            place_chunk(&state, &user_id, &file_id, &devices, sequence, window).await?;
            sequence += 1;
        }
    }
    if let Some(rest) = chunker.finish() {
        place_chunk(&state, &user_id, &file_id, &devices, sequence, rest).await?;
        sequence += 1;
    }

    let file_hash = hasher.finish();
    state.db.finalize_file(&file_id, total_size, &file_hash)?;

    tracing::info!(
        file_id = file_id.as_str(),
        size = total_size,
        chunks = sequence,
        "Upload complete"
    );

    Ok(Json(json!({
        "file_id": file_id,
        "size": total_size,
        "hash": file_hash,
        "chunks": sequence,
    })))
}

/// Hash, record, and place one chunk; first accepting candidate wins.
async fn place_chunk(
    state: &AppState,
    user_id: &str,
    file_id: &str,
    devices: &[Device],
    sequence: u32,
    data: Vec<u8>,
) -> Result<(), ApiError> {
    let chunk_id = chunking::chunk_id(&data);
    state
        .db
        .insert_chunk(&chunk_id, file_id, sequence, data.len() as u64)?;

    for device in placement_order(devices, sequence as usize) {
        let backend = backend_for(state, user_id, device);
        match backend.put(&chunk_id, data.clone()).await {
            Ok(()) => {
                state.db.add_location(&chunk_id, &device.id)?;
                tracing::debug!(
                    chunk_id = chunk_id.as_str(),
                    sequence,
                    device_id = device.id.as_str(),
                    "Chunk placed"
                );
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(
                    chunk_id = chunk_id.as_str(),
                    device_id = device.id.as_str(),
                    error = %err,
                    "Chunk placement candidate failed"
                );
            }
        }
    }

    // Partial upload state stays behind; a later GC pass reclaims it.
    Err(Error::NoPlacement(format!("chunk {sequence} was not accepted by any device")).into())
}
