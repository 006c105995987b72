//! Error taxonomy shared across the control plane.
//!
//! The server maps these variants onto HTTP status codes:
//! `InvalidRequest` → 400, `Unauthorized` → 401, `Forbidden` → 403,
//! `NotFound` → 404, `Database` → 500, `NoPlacement` → 503, `Timeout` → 504.
//! `Relay` and `Cloud` are per-candidate failures that the pipelines fold
//! into the next-replica walk; they only surface once every candidate has
//! been exhausted.

use thiserror::Error;

/// Result type alias for Scatterdrive operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing request fields.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No session, or the session is unknown.
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated, but the resource belongs to someone else.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// No online device accepted a chunk.
    #[error("no device available: {0}")]
    NoPlacement(String),

    /// A relay wait, store ack, or retrieve ran out of time.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("database error: {0}")]
    Database(String),

    /// Cloud backend call failed (token, API, or transport).
    #[error("cloud backend error: {0}")]
    Cloud(String),

    /// Relay enqueue was dropped or the channel vanished.
    #[error("relay error: {0}")]
    Relay(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidRequest(msg.into())
    }

    pub fn database(err: impl std::fmt::Display) -> Self {
        Error::Database(err.to_string())
    }

    pub fn cloud(err: impl std::fmt::Display) -> Self {
        Error::Cloud(err.to_string())
    }

    /// True when this error should be treated as a per-candidate failure
    /// during an upload/download walk rather than aborting the request.
    pub fn is_candidate_failure(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Relay(_) | Error::Cloud(_))
    }
}
