//! HTTP surface of the control plane.
//!
//! Unauthenticated agent-facing routes (`/register`, `/heartbeat`, `/peers`,
//! `/relay/*`, `/metadata`, `/chunk/location`, `/api/sync/deletions`) and the
//! session-cookie browser API under `/api/*`. Handlers stay thin: parse,
//! authorize, call into the store/relay/pipelines, map errors.

pub mod auth;
pub mod devices;
pub mod download;
pub mod metadata;
pub mod relay;
pub mod sync;
pub mod upload;
