//! # Frame Relay
//!
//! The public server that multiplexes terminal and control-plane traffic
//! between browser clients and home agents (§2). Structure mirrors the
//! teacher's `tunnel-server`: a thin `main.rs` wiring modules together,
//! one `AppState` passed to every handler, `tracing` for logs, permissive
//! CORS for the browser app's cross-origin bootstrap.
//!
//! ## Modules
//!
//! - [`frame_protocol`] (external crate) — the shared wire codec.
//! - [`identity`]  — the pluggable bearer-token/signature verifier capability.
//! - [`state`]     — the connection registry (§4.9).
//! - [`router`]    — per-message forwarding rules (§4.10).
//! - [`ws`]        — WebSocket upgrade handlers and connection lifecycles.
//! - [`http`]      — the plain REST surface (§4.11).
//! - [`error`]     — relay-side error kinds and their HTTP mapping.

mod config;
mod error;
mod http;
mod identity;
mod router;
mod state;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::RelayConfig;
use crate::identity::InMemoryIdentityVerifier;
use crate::state::Registry;
use crate::ws::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "frame_relay=info".into()),
        )
        .init();

    let config = RelayConfig::from_env();
    info!(?config, "starting frame relay");

    let identity = if config.identity_enabled {
        Some(Arc::new(InMemoryIdentityVerifier::new()) as Arc<dyn identity::IdentityVerifier>)
    } else {
        None
    };
    let registry = Arc::new(Registry::new(identity));
    let state = AppState { registry: registry.clone() };

    spawn_diagnostics_sweep(registry);

    let app = Router::new()
        .route("/health", get(http::health))
        .route("/stats", get(http::stats))
        .route("/api/config", get(http::config))
        .route("/api/servers/register", post(http::register_server))
        .route("/api/servers", get(http::list_servers))
        .route("/tunnel", get(ws::tunnel_handler))
        .route("/ws", get(ws::browser_handler))
        .fallback(http::not_found)
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from((config.bind_host, config.bind_port));
    info!("frame relay listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("bind relay listen address");
    axum::serve(listener, app).await.expect("relay server loop exited");
}

/// Periodic registry diagnostics (§5: "a small number of periodic tasks ...
/// share the same discipline" as the reader loops). Per-connection
/// heartbeat timeout is handled locally by each tunnel task in [`ws`]; this
/// sweep only logs aggregate counts for operators.
fn spawn_diagnostics_sweep(registry: Arc<Registry>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            info!(
                home_agents = registry.homes.len(),
                browser_sessions = registry.browsers.len(),
                open_channels = registry.channels.len(),
                pending_requests = registry.pending_requests.len(),
                "registry diagnostics"
            );
        }
    });
}
