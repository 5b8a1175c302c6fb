//! # Home Tunnel Client (§4.8)
//!
//! The agent's single outbound connection to the relay: handshake, heartbeat,
//! periodic frame-summary sync, and terminal/control-plane bridging. The
//! reconnect-with-backoff shape is grounded in `client/src-tauri/src/
//! agent.rs::run_agent_loop` (outbound sender task + heartbeat task +
//! inbound dispatch loop, reconnect after a delay), generalized from a
//! fixed 3s retry to bounded exponential backoff, and from a single `Ping`
//! heartbeat to the fuller ping/pong plus frame-sync contract of §4.8.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use frame_protocol::{
    decode, encode, decode_bytes, encode_bytes, ApiMethod, FrameSummary, FrameWireStatus,
    HomeToRelay, RelayToHome, TerminalErrorCode,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::api::ApiRouter;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::ports::PortAllocator;
use crate::store::FrameStatus;
use crate::supervisor::FrameSupervisor;
use crate::terminal::{TerminalAttachAdapter, TerminalEvent};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Reconnect attempt budget before the client gives up entirely (§4.8
/// "up to a bounded attempt budget ... enter `error` state and stop trying").
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const FRAME_SYNC_INTERVAL: Duration = Duration::from_secs(5);
/// Initial PTY geometry; the browser corrects it with its first resize.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

pub struct HomeTunnelClient {
    relay_url: String,
    server_id: String,
    server_name: String,
    supervisor: Arc<FrameSupervisor>,
    api: Arc<ApiRouter>,
    attempts: AtomicU32,
}

impl HomeTunnelClient {
    pub fn new(config: &AgentConfig, supervisor: Arc<FrameSupervisor>, api: Arc<ApiRouter>) -> Result<Self, AgentError> {
        let server_id = load_or_create_server_id(&config.server_id_path())?;
        Ok(Self {
            relay_url: config.relay_url.clone(),
            server_id,
            server_name: config.server_name.clone(),
            supervisor,
            api,
            attempts: AtomicU32::new(0),
        })
    }

    /// Runs the reconnect loop forever (until the attempt budget is
    /// exhausted, at which point the client gives up and returns).
    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(e) = self.run_once().await {
                warn!(error = %e, "tunnel connection ended");
            }

            let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempts > MAX_RECONNECT_ATTEMPTS {
                error!("reconnect attempt budget exhausted, giving up");
                return;
            }
            let delay = compute_backoff(attempts);
            info!(attempt = attempts, delay_secs = delay.as_secs(), "reconnecting to relay");
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_once(&self) -> Result<(), AgentError> {
        let (ws_stream, _) = connect_async(&self.relay_url)
            .await
            .map_err(|e| AgentError::Transport(format!("connect to relay: {e}")))?;
        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<HomeToRelay>();

        let outbound = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(Message::Text(encode(&msg).into())).await.is_err() {
                    break;
                }
            }
        });

        let _ = tx.send(HomeToRelay::SimpleAuth { server_id: self.server_id.clone(), server_name: self.server_name.clone() });

        let Some(Ok(Message::Text(text))) = stream.next().await else {
            outbound.abort();
            return Err(AgentError::Transport("relay closed connection before handshake response".into()));
        };
        match decode::<RelayToHome>(&text) {
            Ok(RelayToHome::SimpleAuthSuccess { session_id, .. }) | Ok(RelayToHome::AuthSuccess { session_id, .. }) => {
                debug!(session_id, "tunnel handshake succeeded");
                self.attempts.store(0, Ordering::SeqCst);
            }
            Ok(RelayToHome::AuthError { code, message }) => {
                outbound.abort();
                return Err(AgentError::Protocol(format!("relay rejected handshake: {code:?} {message}")));
            }
            _ => {
                outbound.abort();
                return Err(AgentError::Protocol("expected an auth response as the first relay message".into()));
            }
        }

        let (term_events_tx, mut term_events_rx) = mpsc::unbounded_channel();
        let terminal = Arc::new(TerminalAttachAdapter::new(term_events_tx));

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // first tick fires immediately; skip it
        let mut frame_sync = tokio::time::interval(FRAME_SYNC_INTERVAL);
        // frame_sync's first (immediate) tick covers "on connect" sync (§4.8).

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if tx.send(HomeToRelay::Pong { ts: Utc::now().timestamp() }).is_err() {
                        break;
                    }
                }
                _ = frame_sync.tick() => {
                    self.send_frame_sync(&tx).await;
                }
                Some(event) = term_events_rx.recv() => {
                    forward_terminal_event(&tx, event);
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match decode::<RelayToHome>(&text) {
                                Ok(msg) => self.handle_message(msg, &tx, &terminal).await,
                                Err(e) => warn!(error = %e, "malformed relay->home frame, dropped"),
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

        // Deterministic teardown order (§4.8 `disconnect()`): timers, then
        // attached terminals, then the connection, then local state.
        drop(heartbeat);
        drop(frame_sync);
        terminal.close_all().await;
        outbound.abort();
        Ok(())
    }

    async fn handle_message(&self, msg: RelayToHome, tx: &mpsc::UnboundedSender<HomeToRelay>, terminal: &Arc<TerminalAttachAdapter>) {
        match msg {
            RelayToHome::SimpleAuthSuccess { .. } | RelayToHome::AuthSuccess { .. } | RelayToHome::AuthError { .. } => {
                // Only valid as the first message; a repeat here is ignored.
            }

            RelayToHome::Ping { ts } => {
                let _ = tx.send(HomeToRelay::Pong { ts });
            }

            RelayToHome::TerminalOpen { channel_id, frame_id } => {
                self.open_terminal(channel_id, frame_id, tx, terminal).await;
            }

            RelayToHome::TerminalData { channel_id, data } => match decode_bytes(&data) {
                Ok(bytes) => {
                    if let Err(e) = terminal.write(&channel_id, bytes).await {
                        warn!(channel_id, error = %e, "terminal_data write failed");
                    }
                }
                Err(e) => warn!(channel_id, error = %e, "terminal_data payload was not valid base64"),
            },

            RelayToHome::TerminalResize { channel_id, cols, rows } => {
                if let Err(e) = terminal.resize(&channel_id, cols, rows).await {
                    warn!(channel_id, error = %e, "terminal_resize failed");
                }
            }

            RelayToHome::TerminalClose { channel_id } => {
                terminal.close(&channel_id).await;
            }

            RelayToHome::ApiRequest { req_id, method, path, .. } => {
                let response = self.api.dispatch(method, &path).await;
                let _ = tx.send(HomeToRelay::ApiResponse { req_id, status: response.status, headers: None, body: response.body });
            }
        }
    }

    async fn open_terminal(
        &self,
        channel_id: String,
        frame_id: String,
        tx: &mpsc::UnboundedSender<HomeToRelay>,
        terminal: &Arc<TerminalAttachAdapter>,
    ) {
        let frame = match self.supervisor.get_frame(&frame_id).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                let _ = tx.send(HomeToRelay::TerminalError { channel_id, code: TerminalErrorCode::FrameNotFound, message: "no such frame".into() });
                return;
            }
            Err(e) => {
                let _ = tx.send(HomeToRelay::TerminalError { channel_id, code: TerminalErrorCode::AttachFailed, message: e.to_string() });
                return;
            }
        };
        if frame.status != FrameStatus::Running {
            let _ = tx.send(HomeToRelay::TerminalError { channel_id, code: TerminalErrorCode::FrameNotRunning, message: "frame is not running".into() });
            return;
        }

        let target = self.supervisor.attach_target(&frame.name);
        match terminal.open(&channel_id, target, DEFAULT_COLS, DEFAULT_ROWS).await {
            Ok(()) => {
                let _ = tx.send(HomeToRelay::TerminalOpened { channel_id, cols: DEFAULT_COLS, rows: DEFAULT_ROWS });
            }
            Err(e) => {
                let _ = tx.send(HomeToRelay::TerminalError { channel_id, code: e.terminal_code(), message: e.to_string() });
            }
        }
    }

    async fn send_frame_sync(&self, tx: &mpsc::UnboundedSender<HomeToRelay>) {
        let frames = match self.supervisor.list_frames(None).await {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "failed to list frames for sync, skipping this tick");
                return;
            }
        };

        let summaries = frames
            .into_iter()
            .map(|f| FrameSummary {
                id: f.id,
                name: f.name,
                status: coerce_status(f.status),
                workspace: f.workspace_path,
                ports: f.host_port.map(|p| vec![p, PortAllocator::derived_port(p)]).unwrap_or_default(),
                created_at: f.created_at.to_rfc3339(),
                last_activity: f.last_active.map(|t| t.to_rfc3339()),
            })
            .collect();

        // Best-effort: a failed send never tears down the connection (§4.8).
        let _ = tx.send(HomeToRelay::FramesSync { frames: summaries });
    }
}

fn forward_terminal_event(tx: &mpsc::UnboundedSender<HomeToRelay>, event: TerminalEvent) {
    let msg = match event {
        TerminalEvent::Data { channel_id, bytes } => HomeToRelay::TerminalData { channel_id, data: encode_bytes(&bytes) },
        TerminalEvent::Exit { channel_id, .. } => HomeToRelay::TerminalClose { channel_id },
        TerminalEvent::Error { channel_id, message } => {
            HomeToRelay::TerminalError { channel_id, code: TerminalErrorCode::AttachFailed, message }
        }
    };
    let _ = tx.send(msg);
}

/// §3 "Frame" status collapsed to the browser's three-value domain (§4.8
/// "status coerced to {running, stopped, error}"). `created`/`starting`/
/// `stopping` all read as not-yet-serving, so they collapse to `stopped`
/// rather than a misleading `running`.
fn coerce_status(status: FrameStatus) -> FrameWireStatus {
    match status {
        FrameStatus::Running => FrameWireStatus::Running,
        FrameStatus::Error => FrameWireStatus::Error,
        FrameStatus::Created | FrameStatus::Starting | FrameStatus::Stopping | FrameStatus::Stopped => FrameWireStatus::Stopped,
    }
}

/// Bounded exponential backoff starting at 1s, doubling, capped at 30s
/// (§4.8 "Reconnection").
fn compute_backoff(attempt: u32) -> Duration {
    let secs = INITIAL_BACKOFF.as_secs().saturating_mul(1u64 << attempt.saturating_sub(1).min(5));
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// Loads the persisted `serverId`, generating and persisting one on first
/// run (§4.8 "stable, persisted locally; generated on first run").
fn load_or_create_server_id(path: &Path) -> Result<String, AgentError> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    let id = format!("srv_{}", uuid::Uuid::new_v4());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &id)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_30s() {
        assert_eq!(compute_backoff(1), Duration::from_secs(1));
        assert_eq!(compute_backoff(2), Duration::from_secs(2));
        assert_eq!(compute_backoff(3), Duration::from_secs(4));
        assert_eq!(compute_backoff(10), Duration::from_secs(30));
    }

    #[test]
    fn coerce_status_collapses_transients_to_stopped() {
        assert_eq!(coerce_status(FrameStatus::Created), FrameWireStatus::Stopped);
        assert_eq!(coerce_status(FrameStatus::Starting), FrameWireStatus::Stopped);
        assert_eq!(coerce_status(FrameStatus::Running), FrameWireStatus::Running);
        assert_eq!(coerce_status(FrameStatus::Error), FrameWireStatus::Error);
    }

    #[test]
    fn server_id_persists_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_id");
        let first = load_or_create_server_id(&path).unwrap();
        let second = load_or_create_server_id(&path).unwrap();
        assert_eq!(first, second);
    }
}
