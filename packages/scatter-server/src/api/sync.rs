//! Offline-sync ledger endpoint.
//!
//! Agents that were offline poll `/api/sync/deletions?since=<RFC3339>` to
//! learn which chunks to garbage-collect. Events are returned strictly
//! after the cursor; consumers should advance their cursor to the maximum
//! `deleted_at` of each batch.

use axum::extract::{Query, State};
use axum::Json;
use chrono::DateTime;
use serde::Deserialize;

use scatter_core::types::DeletionEvent;
use scatter_core::Error;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SinceQuery {
    #[serde(default)]
    pub since: Option<String>,
}

/// `GET /api/sync/deletions?since=`
pub async fn deletions(
    State(state): State<AppState>,
    Query(query): Query<SinceQuery>,
) -> ApiResult<Json<Vec<DeletionEvent>>> {
    let since_raw = query
        .since
        .ok_or_else(|| Error::invalid("missing 'since' parameter"))?;
    let since = DateTime::parse_from_rfc3339(&since_raw)
        .map_err(|_| Error::invalid("invalid time format, use RFC3339"))?
        .to_utc();

    Ok(Json(state.db.deletions_since(since)?))
}
