//! Relay HTTP endpoints.
//!
//! `POST /relay/send?to=&session=` delivers the raw body to the session's
//! FIFO; `GET /relay/recv?me=&session=` long-polls one blob out of it. The
//! body is opaque; the relay never parses envelopes.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;

use scatter_core::Error;

use crate::error::ApiResult;
use crate::relay::SendOutcome;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SendParams {
    pub to: String,
    pub session: String,
}

#[derive(Debug, Deserialize)]
pub struct RecvParams {
    pub me: String,
    pub session: String,
}

/// `POST /relay/send`
pub async fn send(
    State(state): State<AppState>,
    Query(params): Query<SendParams>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    if params.to.is_empty() || params.session.is_empty() {
        return Err(Error::invalid("'to' and 'session' are required").into());
    }

    match state
        .relay
        .send(&params.to, &params.session, body.to_vec())
        .await
    {
        SendOutcome::Accepted => Ok(StatusCode::OK),
        SendOutcome::Dropped => {
            Err(Error::Timeout("receiver did not drain in time".into()).into())
        }
    }
}

/// `GET /relay/recv`
pub async fn recv(
    State(state): State<AppState>,
    Query(params): Query<RecvParams>,
) -> ApiResult<Bytes> {
    if params.me.is_empty() || params.session.is_empty() {
        return Err(Error::invalid("'me' and 'session' are required").into());
    }

    match state.relay.recv(&params.me, &params.session).await {
        Some(blob) => Ok(Bytes::from(blob)),
        None => Err(Error::Timeout("no blob arrived for session".into()).into()),
    }
}
