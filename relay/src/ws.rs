//! # Connection Lifecycle (§4.9, §5)
//!
//! One reader/writer pair per upgraded connection: an outbound task drains
//! a queue and writes text frames, while the current task reads and
//! dispatches. The home-agent side
//! additionally runs the handshake (§4.8) before it starts forwarding
//! ordinary traffic to [`crate::router`], and a heartbeat task that pings
//! on an interval and force-closes on a missed-heartbeat budget (§5).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use frame_protocol::{
    decode, encode, AuthErrorCode, BrowserToRelay, HomeToRelay, RelayToBrowser, RelayToHome,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Close reason sent to a home agent's prior connection when it is displaced
/// by a newer registration for the same `serverId` (§5, scenario 4).
const DISPLACED_CLOSE_REASON: &str = "Replaced by new connection";

use crate::router;
use crate::state::Registry;

/// Home agents that miss this many consecutive 15s heartbeat ticks without
/// a `pong` are treated as a soft close (§5: default >= 3x interval).
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const MAX_MISSED_HEARTBEATS: u32 = 3;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

pub async fn tunnel_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_tunnel_connection(socket, state))
}

pub async fn browser_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_browser_connection(socket, state))
}

async fn handle_tunnel_connection(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayToHome>();
    let cancel = CancellationToken::new();

    let outbound_cancel = cancel.clone();
    let outbound = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = outbound_cancel.cancelled() => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: 1000,
                            reason: DISPLACED_CLOSE_REASON.into(),
                        })))
                        .await;
                    break;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => {
                            if sink.send(Message::Text(encode(&msg).into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    // Handshake: the first message must be `simple_auth` or `auth`.
    let Some(Ok(Message::Text(text))) = stream.next().await else {
        outbound.abort();
        return;
    };
    let Ok(handshake) = decode::<HomeToRelay>(&text) else {
        warn!("tunnel handshake was not valid JSON, closing");
        outbound.abort();
        return;
    };

    let (server_id, server_name, owner_user_id, signed) = match handshake {
        HomeToRelay::SimpleAuth { server_id, server_name } => (server_id, server_name, None, false),
        HomeToRelay::Auth { server_id, timestamp, signature } => {
            let Some(identity) = &state.registry.identity else {
                let _ = tx.send(RelayToHome::AuthError {
                    code: AuthErrorCode::ServerNotFound,
                    message: "identity verification is not configured".into(),
                });
                outbound.abort();
                return;
            };

            let Some((owner, registered)) = identity.find_server(&server_id).await else {
                let _ = tx.send(RelayToHome::AuthError {
                    code: AuthErrorCode::ServerNotFound,
                    message: format!("no registration found for {server_id}"),
                });
                outbound.abort();
                return;
            };

            if !identity
                .verify_signature(&server_id, timestamp, &signature, &registered.public_key)
                .await
            {
                let _ = tx.send(RelayToHome::AuthError {
                    code: AuthErrorCode::InvalidSignature,
                    message: "signature did not verify".into(),
                });
                outbound.abort();
                return;
            }

            identity.update_last_seen(&owner, &server_id).await;
            (server_id, registered.name, Some(owner), true)
        }
        other => {
            warn!(?other, "expected auth as first tunnel message");
            outbound.abort();
            return;
        }
    };

    let (session_id, displaced) = state.registry.add_home(
        server_id.clone(),
        server_name,
        owner_user_id.clone(),
        tx.clone(),
        cancel.clone(),
    );
    if displaced {
        info!(server_id = %server_id, "home agent reconnected, displaced prior connection");
    }

    let _ = tx.send(if signed {
        RelayToHome::AuthSuccess { server_id: server_id.clone(), session_id }
    } else {
        RelayToHome::SimpleAuthSuccess { server_id: server_id.clone(), session_id }
    });
    state.registry.auto_pair_new_home(&server_id, owner_user_id.as_deref());

    let mut missed = 0u32;
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(server_id = %server_id, "tunnel connection cancelled by displacement");
                break;
            }
            _ = ticker.tick() => {
                missed += 1;
                if missed > MAX_MISSED_HEARTBEATS {
                    warn!(server_id = %server_id, "missed heartbeat budget exceeded, closing");
                    break;
                }
                let ts = chrono::Utc::now().timestamp();
                if tx.send(RelayToHome::Ping { ts }).is_err() {
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match decode::<HomeToRelay>(&text) {
                            Ok(msg) => {
                                if matches!(msg, HomeToRelay::Pong { .. }) {
                                    missed = 0;
                                }
                                router::handle_home_message(&state.registry, &server_id, msg);
                            }
                            Err(e) => warn!(error = %e, "malformed home->relay frame, dropped"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "tunnel read error, closing");
                        break;
                    }
                }
            }
        }
    }

    outbound.abort();
    if !displaced_by_someone_else(&cancel) {
        state.registry.remove_home(&server_id);
    }
}

/// Distinguishes "we broke out because displacement cancelled us" (the new
/// connection already owns the registry slot, so we must not remove it)
/// from every other exit path (we still own the slot and must clean it up).
fn displaced_by_someone_else(cancel: &tokio_util::sync::CancellationToken) -> bool {
    cancel.is_cancelled()
}

async fn handle_browser_connection(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayToBrowser>();

    let outbound = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(Message::Text(encode(&msg).into())).await.is_err() {
                break;
            }
        }
    });

    let Some(Ok(Message::Text(text))) = stream.next().await else {
        outbound.abort();
        return;
    };
    let auth_ok = match decode::<BrowserToRelay>(&text) {
        Ok(BrowserToRelay::PwaAuth { token }) => Some(token),
        _ => None,
    };
    let Some(token) = auth_ok else {
        warn!("browser handshake was not pwa_auth, closing");
        outbound.abort();
        return;
    };

    let user_id = match &state.registry.identity {
        Some(identity) => match identity.verify_token(&token).await {
            Some(verified) => verified.user_id,
            None => {
                let _ = tx.send(RelayToBrowser::PwaAuthError { message: "invalid token".into() });
                outbound.abort();
                return;
            }
        },
        // Development fallback: no identity service configured, the bearer
        // token itself names the user (matches InMemoryIdentityVerifier).
        None => token,
    };

    let session_id = state.registry.add_browser(user_id.clone(), tx.clone());
    let _ = tx.send(RelayToBrowser::PwaAuthSuccess { user_id: user_id.clone() });
    let _ = tx.send(RelayToBrowser::ServersSync {
        servers: state.registry.homes_visible_to(Some(&user_id)),
    });
    state.registry.auto_pair(&session_id);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match decode::<BrowserToRelay>(&text) {
                Ok(msg) => router::handle_browser_message(&state.registry, &session_id, msg),
                Err(e) => warn!(error = %e, "malformed browser->relay frame, dropped"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "browser read error, closing");
                break;
            }
        }
    }

    outbound.abort();
    state.registry.remove_browser(&session_id);
}
