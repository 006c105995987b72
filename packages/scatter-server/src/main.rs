//! Scatterdrive Control Plane
//!
//! The coordination server for a personal distributed drive:
//!
//! 1. **Relay**: an in-memory rendezvous that moves chunk blobs between
//!    browsers, agents, and the server's own pipelines without ever
//!    persisting file bytes.
//! 2. **Placement**: uploads are windowed into 1 MiB content-addressed
//!    chunks and spread round-robin across the user's online devices, with
//!    per-chunk failover; downloads reassemble in order with replica
//!    failover.
//! 3. **Rebalancing**: a background loop that equalizes stored bytes across
//!    devices as they come and go.
//!
//! File bytes only ever transit memory; the SQLite metadata store is the
//! single source of durable truth.

mod api;
mod backend;
mod config;
mod db;
mod error;
mod rebalance;
mod relay;
mod state;

#[cfg(test)]
mod pipeline_tests;

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use backend::cloud::CloudDrive;
use config::ServerConfig;
use db::Database;
use relay::{Relay, RelayConfig};
use state::AppState;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "scatter-server", version, about = "Scatterdrive control plane")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8085, env = "SCATTER_PORT")]
    port: u16,

    /// Path to the SQLite metadata store
    #[arg(long, default_value = "./data/scatter.db", env = "SCATTER_DB")]
    db_path: String,

    /// OAuth client id for refreshing cloud backend tokens
    #[arg(long, env = "CLOUD_CLIENT_ID")]
    cloud_client_id: Option<String>,

    /// OAuth client secret for refreshing cloud backend tokens
    #[arg(long, env = "CLOUD_CLIENT_SECRET")]
    cloud_client_secret: Option<String>,

    /// Seconds between sweeps that clear stale device online flags
    #[arg(long, default_value_t = 30, env = "OFFLINE_SWEEP_SECS")]
    offline_sweep_secs: u64,

    /// Maximum accepted upload size in MiB
    #[arg(long, default_value_t = 4096, env = "MAX_UPLOAD_MIB")]
    max_upload_mib: usize,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scatter_server=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let server_config = ServerConfig {
        port: args.port,
        db_path: args.db_path.clone(),
        cloud_client_id: args.cloud_client_id.clone(),
        cloud_client_secret: args.cloud_client_secret.clone(),
        offline_sweep_interval: Duration::from_secs(args.offline_sweep_secs),
    };

    // Ensure the data directory exists before SQLite opens the file.
    if let Some(parent) = std::path::Path::new(&server_config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                tracing::error!(path = %parent.display(), error = %err, "Could not create data directory");
                std::process::exit(1);
            }
        }
    }

    let database = match Database::open(Some(&server_config.db_path)) {
        Ok(db) => db,
        Err(err) => {
            tracing::error!(path = server_config.db_path.as_str(), error = %err, "Could not open metadata store");
            std::process::exit(1);
        }
    };

    let relay = Relay::new(RelayConfig::default());
    let cloud = CloudDrive::new(
        database.clone(),
        server_config.cloud_client_id.clone(),
        server_config.cloud_client_secret.clone(),
    );
    let app_state = AppState::new(database, relay, cloud, server_config.clone());

    // Periodically clear stale online flags so the devices table reflects
    // reality even when nobody queries.
    let sweep_state = app_state.clone();
    let sweep_interval = server_config.offline_sweep_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            match sweep_state.db.mark_stale_offline(config::offline_window()) {
                Ok(0) => {}
                Ok(flipped) => tracing::debug!(devices = flipped, "Marked stale devices offline"),
                Err(err) => tracing::warn!(error = %err, "Offline sweep failed"),
            }
        }
    });

    let app = build_router(app_state, args.max_upload_mib * 1024 * 1024);

    let addr = format!("0.0.0.0:{}", server_config.port);
    tracing::info!("Scatterdrive control plane starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server error");
}

// ── Router ────────────────────────────────────────────────────────────────────

/// The full HTTP surface over a ready [`AppState`].
fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        // Agent API (unauthenticated)
        .route("/register", post(api::devices::register))
        .route("/heartbeat", post(api::devices::heartbeat))
        .route("/peers", get(api::devices::peers))
        .route("/relay/send", post(api::relay::send))
        .route("/relay/recv", get(api::relay::recv))
        .route("/chunk/location", post(api::metadata::chunk_location))
        .route("/metadata", post(api::metadata::create).get(api::metadata::get))
        .route("/api/sync/deletions", get(api::sync::deletions))
        // Browser API (session cookie)
        .route("/api/signup", post(api::auth::signup))
        .route("/api/login", post(api::auth::login))
        .route("/api/me", get(api::auth::me))
        .route("/api/devices/claim", post(api::devices::claim))
        .route("/api/devices", get(api::devices::my_devices))
        .route("/api/devices/delete", delete(api::devices::delete_device))
        .route("/api/cloud/connect", post(api::devices::cloud_connect))
        .route("/api/upload", post(api::upload::upload))
        .route("/api/files", get(api::download::list_files))
        .route("/api/download", get(api::download::download))
        .route("/api/delete", delete(api::download::delete_file))
        .route("/api/admin/rebalance", post(api::devices::admin_rebalance))
        // Operational
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

// ── Operational Handlers ──────────────────────────────────────────────────────

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "scatter-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Live counters.
async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "relay_sessions": state.relay.active_sessions(),
        "devices": state.db.count_devices().unwrap_or(0),
        "files": state.db.count_files().unwrap_or(0),
        "login_sessions": state.sessions.len(),
        "rebalances_in_flight": state.rebalance_running.len(),
    }))
}
