//! # Scatter Core
//!
//! Shared building blocks for the Scatterdrive control plane and its agents:
//!
//! - **Types**: devices, files, chunks, deletion events, and the request
//!   payloads exchanged over the HTTP surface.
//! - **Envelope**: the relay message envelope (`STORE` / `RETRIEVE` /
//!   `DELETE`) that travels through the in-memory relay as an opaque blob.
//! - **Chunking**: fixed-window splitting with content-addressed ids
//!   (hex SHA-256 of the chunk bytes).
//! - **Errors**: the crate-wide error taxonomy the server maps onto HTTP
//!   status codes.
//!
//! This crate does no I/O; everything here is pure data and hashing.

pub mod chunking;
pub mod envelope;
pub mod error;
pub mod types;

pub use error::{Error, Result};
