//! Download pipeline and file listing/deletion.
//!
//! Downloads resolve chunks in sequence order and stream them out as they
//! are retrieved; the server never buffers a whole file. Replica failover
//! happens per chunk: every online holder is tried before giving up. A
//! failure after bytes have been sent truncates the body; the client's
//! whole-file hash check catches that.

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH};
use axum::http::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use scatter_core::types::{Chunk, Device, FileMetadata};
use scatter_core::Error;

use crate::api::auth::AuthUser;
use crate::backend::backend_for;
use crate::config;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct FileIdQuery {
    pub id: String,
}

/// `GET /api/files`
pub async fn list_files(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<FileMetadata>>> {
    Ok(Json(state.db.list_files(&user_id)?))
}

/// Try every online holder of a chunk; first success wins.
async fn fetch_chunk(
    state: &AppState,
    user_id: &str,
    chunk: &Chunk,
    holders: &[Device],
) -> scatter_core::Result<Vec<u8>> {
    for device in holders {
        let backend = backend_for(state, user_id, device);
        match backend.get(&chunk.id).await {
            Ok(data) => return Ok(data),
            Err(err) => {
                tracing::warn!(
                    chunk_id = chunk.id.as_str(),
                    device_id = device.id.as_str(),
                    error = %err,
                    "Chunk retrieve candidate failed"
                );
            }
        }
    }
    Err(Error::Timeout(format!(
        "chunk {} unavailable from every replica",
        chunk.sequence
    )))
}

/// `GET /api/download?id=`
pub async fn download(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<FileIdQuery>,
) -> ApiResult<Response<Body>> {
    let file = state
        .db
        .get_owned_file(&user_id, &query.id)?
        .ok_or_else(|| Error::NotFound(format!("file {}", query.id)))?;

    let chunks = state.db.file_chunks(&file.id)?;

    // Resolve holders for every chunk before committing to a 200; a chunk
    // with no online replica fails the whole request up front.
    let window = config::offline_window();
    let mut plan: Vec<(Chunk, Vec<Device>)> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let holders = state.db.online_holders(&chunk.id, window)?;
        if holders.is_empty() {
            return Err(Error::NoPlacement(format!(
                "chunk {} missing (no online replicas)",
                chunk.sequence
            ))
            .into());
        }
        plan.push((chunk, holders));
    }

    // Fetch the first chunk before the response starts so a dead replica set
    // still surfaces as a proper 504 instead of an empty 200.
    let first = match plan.first() {
        Some((chunk, holders)) => Some(fetch_chunk(&state, &user_id, chunk, holders).await?),
        None => None,
    };

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(2);
    let stream_state = state.clone();
    let stream_user = user_id.clone();
    let file_id = file.id.clone();
    tokio::spawn(async move {
        if let Some(bytes) = first {
            if tx.send(Ok(Bytes::from(bytes))).await.is_err() {
                return;
            }
        }
        for (chunk, holders) in plan.into_iter().skip(1) {
            match fetch_chunk(&stream_state, &stream_user, &chunk, &holders).await {
                Ok(data) => {
                    if tx.send(Ok(Bytes::from(data))).await.is_err() {
                        return; // client went away
                    }
                }
                Err(err) => {
                    tracing::error!(
                        file_id = file_id.as_str(),
                        sequence = chunk.sequence,
                        error = %err,
                        "Download truncated mid-stream"
                    );
                    let _ = tx.send(Err(std::io::Error::other(err.to_string()))).await;
                    return;
                }
            }
        }
    });

    Response::builder()
        .header(
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file.path),
        )
        .header(CONTENT_LENGTH, file.size)
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| Error::database(format!("response build: {e}")).into())
}

/// `DELETE /api/delete?id=`
///
/// Writes the deletion event before any row disappears, then notifies every
/// holding device best-effort and drops the file-scoped rows.
pub async fn delete_file(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<FileIdQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let file = state
        .db
        .get_owned_file(&user_id, &query.id)?
        .ok_or_else(|| Error::NotFound(format!("file {}", query.id)))?;

    // Only chunks no other file references may be physically deleted.
    let orphaned = state.db.orphaned_chunk_ids(&file.id)?;
    state.db.record_deletion(&file.id, &orphaned)?;

    // Fire-and-forget deletes toward every device holding a doomed chunk.
    // Offline agents catch up later through the deletion ledger.
    let orphan_set: std::collections::HashSet<&str> =
        orphaned.iter().map(String::as_str).collect();
    for (device_id, chunk_id) in state.db.file_chunk_placements(&file.id)? {
        if !orphan_set.contains(chunk_id.as_str()) {
            continue;
        }
        if let Some(device) = state.db.get_device(&device_id)? {
            let backend = backend_for(&state, &user_id, &device);
            tokio::spawn(async move {
                let _ = backend.remove(&chunk_id).await;
            });
        }
    }

    state.db.delete_file_rows(&file.id)?;
    tracing::info!(
        user_id = user_id.as_str(),
        file_id = file.id.as_str(),
        chunks = orphaned.len(),
        "File deleted"
    );

    Ok(Json(json!({ "status": "deleted" })))
}
