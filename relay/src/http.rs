//! # HTTP Surface (§4.11)
//!
//! Plain REST endpoints alongside the two WebSocket upgrades in [`crate::ws`].
//! A thin `State<AppState>` extractor per handler, generalized to the
//! relay's auth-gated registration/listing pair.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::RelayError;
use crate::ws::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    timestamp: String,
    auth: &'static str,
}

/// `GET /health` — liveness probe, never auth-gated.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
        auth: if state.registry.identity.is_some() { "configured" } else { "unconfigured" },
    })
}

#[derive(Serialize)]
pub struct ServerStat {
    server_id: String,
    server_name: String,
    frame_count: usize,
}

#[derive(Serialize)]
pub struct StatsResponse {
    home_agents: usize,
    browser_sessions: usize,
    open_channels: usize,
    pending_requests: usize,
    servers: Vec<ServerStat>,
}

/// `GET /stats` — connection counts and a shallow per-server summary.
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let registry = &state.registry;
    let servers = registry
        .homes
        .iter()
        .map(|e| ServerStat {
            server_id: e.server_id.clone(),
            server_name: e.server_name.clone(),
            frame_count: e.frames.len(),
        })
        .collect();

    Json(StatsResponse {
        home_agents: registry.homes.len(),
        browser_sessions: registry.browsers.len(),
        open_channels: registry.channels.len(),
        pending_requests: registry.pending_requests.len(),
        servers,
    })
}

#[derive(Serialize)]
pub struct ConfigResponse {
    protocol_version: &'static str,
    identity_configured: bool,
}

/// `GET /api/config` — non-secret bootstrap config for the browser app.
pub async fn config(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        protocol_version: frame_protocol::PROTOCOL_VERSION,
        identity_configured: state.registry.identity.is_some(),
    })
}

#[derive(Deserialize)]
pub struct RegisterServerRequest {
    server_name: String,
    public_key: String,
}

#[derive(Serialize)]
pub struct RegisterServerResponse {
    server_id: String,
    server_name: String,
}

/// `POST /api/servers/register` — bearer auth required. Idempotent per
/// `(user, serverName)` (§4.11, §4.12).
pub async fn register_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterServerRequest>,
) -> Result<Json<RegisterServerResponse>, RelayError> {
    let identity = state.registry.identity.as_ref().ok_or(RelayError::IdentityUnavailable)?;
    let user_id = authenticate(identity.as_ref(), &headers).await?;

    let server = identity.register_server(&user_id, &body.server_name, &body.public_key).await;
    Ok(Json(RegisterServerResponse { server_id: server.id, server_name: server.name }))
}

#[derive(Serialize)]
pub struct ServerListEntry {
    server_id: String,
    server_name: String,
    registered_at: String,
    last_seen: Option<String>,
    connected: bool,
    frame_count: u32,
}

/// `GET /api/servers` — bearer auth required. The caller's registrations
/// merged with live-connection status and current frame summaries.
pub async fn list_servers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ServerListEntry>>, RelayError> {
    let identity = state.registry.identity.as_ref().ok_or(RelayError::IdentityUnavailable)?;
    let token = bearer_token(&headers).ok_or(RelayError::Unauthorized)?;
    let verified = identity.verify_token(&token).await.ok_or(RelayError::Unauthorized)?;

    let live = state.registry.homes_visible_to(Some(&verified.user_id));

    let entries = verified
        .servers
        .into_iter()
        .map(|s| {
            let online = live.iter().find(|l| l.server_id == s.id);
            ServerListEntry {
                server_id: s.id,
                server_name: s.name,
                registered_at: s.registered_at,
                last_seen: s.last_seen,
                connected: online.is_some(),
                frame_count: online.map(|l| l.frame_count).unwrap_or(0),
            }
        })
        .collect();

    Ok(Json(entries))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    raw.strip_prefix("Bearer ").map(str::to_string)
}

async fn authenticate(
    identity: &dyn crate::identity::IdentityVerifier,
    headers: &HeaderMap,
) -> Result<String, RelayError> {
    let token = bearer_token(headers).ok_or(RelayError::Unauthorized)?;
    identity.verify_token(&token).await.map(|v| v.user_id).ok_or(RelayError::Unauthorized)
}

/// Fallback 404 body for unmatched routes, kept consistent with the JSON
/// error shape the rest of the surface uses.
pub async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}
