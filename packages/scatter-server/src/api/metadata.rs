//! Agent-facing metadata endpoints.
//!
//! `/metadata` lets an agent commit a file + chunk layout it produced
//! locally (transactional) or read layouts back, placements included.
//! `/chunk/location` is how agents report that a chunk landed on them.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use scatter_core::types::{ChunkLocationRequest, FileMetadata};
use scatter_core::Error;

use crate::error::ApiResult;
use crate::state::AppState;

/// `POST /metadata`: transactionally create a file row plus its chunk rows.
pub async fn create(
    State(state): State<AppState>,
    Json(mut meta): Json<FileMetadata>,
) -> ApiResult<Json<FileMetadata>> {
    if meta.id.is_empty() {
        meta.id = Uuid::new_v4().to_string();
    }
    meta.created_at = Utc::now();
    meta.updated_at = Utc::now();
    for chunk in &mut meta.chunks {
        chunk.file_id = meta.id.clone();
    }

    state.db.create_file_with_chunks(None, &meta)?;
    tracing::info!(
        file_id = meta.id.as_str(),
        chunks = meta.chunks.len(),
        "File metadata committed"
    );
    Ok(Json(meta))
}

#[derive(Debug, Deserialize)]
pub struct MetadataQuery {
    #[serde(default)]
    pub id: Option<String>,
}

/// `GET /metadata`: one file with chunks and placements, or all files.
pub async fn get(
    State(state): State<AppState>,
    Query(query): Query<MetadataQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    match query.id {
        Some(id) if !id.is_empty() => {
            let file = state
                .db
                .get_file_with_chunks(&id)?
                .ok_or_else(|| Error::NotFound(format!("file {id}")))?;
            Ok(Json(serde_json::to_value(file).unwrap_or_default()))
        }
        _ => {
            let files = state.db.list_all_files()?;
            Ok(Json(serde_json::to_value(files).unwrap_or_default()))
        }
    }
}

/// `POST /chunk/location`: record that a device holds a chunk.
pub async fn chunk_location(
    State(state): State<AppState>,
    Json(req): Json<ChunkLocationRequest>,
) -> ApiResult<StatusCode> {
    if req.chunk_id.is_empty() || req.device_id.is_empty() {
        return Err(Error::invalid("chunk_id and device_id are required").into());
    }
    state.db.add_location(&req.chunk_id, &req.device_id)?;
    Ok(StatusCode::OK)
}
