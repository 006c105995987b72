//! Signup, login, and the session-cookie extractor.
//!
//! Sessions are in-memory: token → user id. A restart logs everyone out,
//! which is acceptable for a personal control plane. Handlers downstream
//! take [`AuthUser`] and get the authenticated user id or a 401.

use async_trait::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{AppendHeaders, IntoResponse};
use axum::Json;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use scatter_core::Error;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "session_token";

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// SHA-256 credential digest; what the users table stores.
pub fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The authenticated user id, extracted from the session cookie.
pub struct AuthUser(pub String);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> ApiResult<Self> {
        let token = parts
            .headers
            .get(COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(session_token)
            .ok_or(ApiError(Error::Unauthorized))?;

        let user_id = state
            .sessions
            .get(&token)
            .map(|entry| entry.value().clone())
            .ok_or(ApiError(Error::Unauthorized))?;

        Ok(AuthUser(user_id))
    }
}

fn session_token(cookie_header: &str) -> Option<String> {
    cookie_header
        .split(';')
        .map(str::trim)
        .find_map(|c| c.strip_prefix(SESSION_COOKIE).and_then(|r| r.strip_prefix('=')))
        .map(str::to_string)
}

/// `POST /api/signup`
pub async fn signup(
    State(state): State<AppState>,
    Json(creds): Json<Credentials>,
) -> ApiResult<StatusCode> {
    if creds.email.is_empty() || creds.password.is_empty() {
        return Err(Error::invalid("email and password are required").into());
    }
    let user_id = state
        .db
        .create_user(&creds.email, &password_digest(&creds.password))?;
    tracing::info!(user_id = user_id.as_str(), "User signed up");
    Ok(StatusCode::CREATED)
}

/// `POST /api/login`
pub async fn login(
    State(state): State<AppState>,
    Json(creds): Json<Credentials>,
) -> ApiResult<impl IntoResponse> {
    let user_id = state
        .db
        .find_user(&creds.email, &password_digest(&creds.password))?
        .ok_or(ApiError(Error::Unauthorized))?;

    let token = generate_token();
    state.sessions.insert(token.clone(), user_id.clone());
    tracing::info!(user_id = user_id.as_str(), "User logged in");

    Ok((
        AppendHeaders([(
            SET_COOKIE,
            format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly"),
        )]),
        Json(json!({ "user_id": user_id })),
    ))
}

/// `GET /api/me`
pub async fn me(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let email = state
        .db
        .user_email(&user_id)?
        .ok_or_else(|| Error::NotFound("user".into()))?;
    Ok(Json(json!({ "id": user_id, "email": email })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_digest_is_sha256_hex() {
        assert_eq!(
            password_digest("hunter2"),
            "f52fbd32b2b3b86ff88ef6c490628285f482af15ddcb29541f94bcf526a3f6c7"
        );
    }

    #[test]
    fn test_session_token_parsing() {
        assert_eq!(
            session_token("session_token=abc123"),
            Some("abc123".to_string())
        );
        assert_eq!(
            session_token("theme=dark; session_token=abc123; lang=en"),
            Some("abc123".to_string())
        );
        assert_eq!(session_token("theme=dark"), None);
        // A cookie whose name merely starts with ours must not match.
        assert_eq!(session_token("session_token_old=zzz"), None);
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
        assert_eq!(generate_token().len(), 32);
    }
}
