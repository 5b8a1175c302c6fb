//! # Relay Message Router
//!
//! §4.10: per-connection reader loops hand each decoded message to the
//! functions here, which do O(1) registry lookups and forward the message
//! across the browser <-> home boundary. `terminalChannels` and
//! `pendingApiRequests` live on [`Registry`] so both reader loops (and
//! displacement cleanup) share one source of truth.

use frame_protocol::{BrowserToRelay, HomeToRelay, RelayToBrowser, RelayToHome, TerminalErrorCode};
use tracing::{debug, warn};

use crate::state::{ChannelRoute, PendingRequest, Registry};

/// Handle one message received from a browser session, forwarding it to
/// the paired home agent (or synthesizing an error/503 if unpaired).
pub fn handle_browser_message(registry: &Registry, session_id: &str, msg: BrowserToRelay) {
    let paired_server_id =
        registry.browsers.get(session_id).and_then(|b| b.paired_server_id.clone());

    match msg {
        BrowserToRelay::PwaAuth { .. } => {
            // Handled at the upgrade/auth layer before the reader loop starts.
        }

        BrowserToRelay::TerminalOpen { channel_id, frame_id } => {
            let Some(server_id) = paired_server_id else {
                registry.send_to_browser(
                    session_id,
                    RelayToBrowser::TerminalError {
                        channel_id,
                        code: TerminalErrorCode::FrameNotFound,
                        message: "no home agent paired".into(),
                    },
                );
                return;
            };

            registry.channels.insert(
                channel_id.clone(),
                ChannelRoute { browser_session_id: session_id.to_string(), server_id: server_id.clone() },
            );
            registry.send_to_home(&server_id, RelayToHome::TerminalOpen { channel_id, frame_id });
        }

        BrowserToRelay::TerminalData { channel_id, data } => {
            if let Some(route) = registry.channels.get(&channel_id) {
                registry.send_to_home(&route.server_id, RelayToHome::TerminalData { channel_id: channel_id.clone(), data });
            }
        }

        BrowserToRelay::TerminalResize { channel_id, cols, rows } => {
            if let Some(route) = registry.channels.get(&channel_id) {
                registry.send_to_home(&route.server_id, RelayToHome::TerminalResize { channel_id: channel_id.clone(), cols, rows });
            }
        }

        BrowserToRelay::TerminalClose { channel_id } => {
            if let Some((_, route)) = registry.channels.remove(&channel_id) {
                registry.send_to_home(&route.server_id, RelayToHome::TerminalClose { channel_id });
            }
        }

        BrowserToRelay::ApiRequest { req_id, method, path, headers, body } => {
            let Some(server_id) = paired_server_id else {
                registry.send_to_browser(
                    session_id,
                    RelayToBrowser::ApiResponse {
                        req_id,
                        status: 503,
                        headers: None,
                        body: Some(serde_json::json!({ "error": "no home agent paired" })),
                    },
                );
                return;
            };

            registry.pending_requests.insert(
                req_id.clone(),
                PendingRequest { browser_session_id: session_id.to_string(), server_id: server_id.clone() },
            );
            registry.send_to_home(&server_id, RelayToHome::ApiRequest { req_id, method, path, headers, body });
        }
    }
}

/// Handle one message received from a connected home agent.
pub fn handle_home_message(registry: &Registry, server_id: &str, msg: HomeToRelay) {
    match msg {
        HomeToRelay::SimpleAuth { .. } | HomeToRelay::Auth { .. } => {
            // Handled at the upgrade/auth layer before the reader loop starts.
        }

        HomeToRelay::Pong { .. } => {
            registry.record_ping(server_id);
        }

        HomeToRelay::FramesSync { frames } => {
            registry.update_frames(server_id, frames.clone());
            registry.broadcast_to_paired(server_id, RelayToBrowser::FramesSync { frames });
        }

        HomeToRelay::TerminalOpened { channel_id, cols, rows } => {
            if let Some(route) = registry.channels.get(&channel_id) {
                registry.send_to_browser(
                    &route.browser_session_id,
                    RelayToBrowser::TerminalOpened { channel_id: channel_id.clone(), cols, rows },
                );
            } else {
                debug!(channel_id, "terminal_opened for unknown channel (race on close)");
            }
        }

        HomeToRelay::TerminalData { channel_id, data } => {
            if let Some(route) = registry.channels.get(&channel_id) {
                registry.send_to_browser(
                    &route.browser_session_id,
                    RelayToBrowser::TerminalData { channel_id: channel_id.clone(), data },
                );
            }
        }

        HomeToRelay::TerminalClose { channel_id } => {
            if let Some((_, route)) = registry.channels.remove(&channel_id) {
                registry.send_to_browser(
                    &route.browser_session_id,
                    RelayToBrowser::TerminalClose { channel_id },
                );
            }
        }

        HomeToRelay::TerminalError { channel_id, code, message } => {
            if let Some((_, route)) = registry.channels.remove(&channel_id) {
                registry.send_to_browser(
                    &route.browser_session_id,
                    RelayToBrowser::TerminalError { channel_id, code, message },
                );
            }
        }

        HomeToRelay::ApiResponse { req_id, status, headers, body } => {
            if let Some((_, pending)) = registry.pending_requests.remove(&req_id) {
                registry.send_to_browser(
                    &pending.browser_session_id,
                    RelayToBrowser::ApiResponse { req_id, status, headers, body },
                );
            } else {
                warn!(req_id, "api_response for unknown or already-resolved request");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn registry_with_paired_pair() -> (Registry, String, String, mpsc::UnboundedReceiver<RelayToHome>, mpsc::UnboundedReceiver<RelayToBrowser>) {
        let registry = Registry::new(None);
        let (htx, hrx) = mpsc::unbounded_channel();
        registry.add_home("srv_1".into(), "box".into(), None, htx, CancellationToken::new());
        let (btx, brx) = mpsc::unbounded_channel();
        let session_id = registry.add_browser("alice".into(), btx);
        registry.set_paired(&session_id, "srv_1");
        // drain the server_status/frames_sync pushed by set_paired
        let _ = brx.try_recv();
        let _ = brx.try_recv();
        (registry, session_id, "srv_1".into(), hrx, brx)
    }

    #[tokio::test]
    async fn terminal_open_on_unpaired_browser_synthesizes_error() {
        let registry = Registry::new(None);
        let (btx, mut brx) = mpsc::unbounded_channel();
        let session_id = registry.add_browser("alice".into(), btx);

        handle_browser_message(
            &registry,
            &session_id,
            BrowserToRelay::TerminalOpen { channel_id: "c1".into(), frame_id: "f1".into() },
        );

        let msg = brx.try_recv().unwrap();
        assert!(matches!(
            msg,
            RelayToBrowser::TerminalError { code: TerminalErrorCode::FrameNotFound, .. }
        ));
        assert!(!registry.channels.contains_key("c1"));
    }

    #[tokio::test]
    async fn terminal_open_records_channel_and_forwards() {
        let (registry, session_id, server_id, mut hrx, _brx) = registry_with_paired_pair();

        handle_browser_message(
            &registry,
            &session_id,
            BrowserToRelay::TerminalOpen { channel_id: "c1".into(), frame_id: "f1".into() },
        );

        assert!(registry.channels.contains_key("c1"));
        let forwarded = hrx.try_recv().unwrap();
        assert!(matches!(forwarded, RelayToHome::TerminalOpen { .. }));
        let _ = server_id;
    }

    #[tokio::test]
    async fn terminal_close_clears_channel_both_directions() {
        let (registry, session_id, _server_id, mut hrx, mut brx) = registry_with_paired_pair();
        handle_browser_message(
            &registry,
            &session_id,
            BrowserToRelay::TerminalOpen { channel_id: "c1".into(), frame_id: "f1".into() },
        );
        let _ = hrx.try_recv();

        handle_home_message(
            &registry,
            "srv_1",
            HomeToRelay::TerminalClose { channel_id: "c1".into() },
        );
        assert!(!registry.channels.contains_key("c1"));
        let to_browser = brx.try_recv().unwrap();
        assert!(matches!(to_browser, RelayToBrowser::TerminalClose { .. }));
    }

    #[tokio::test]
    async fn api_response_resolves_pending_request() {
        let (registry, session_id, _server_id, mut hrx, mut brx) = registry_with_paired_pair();
        handle_browser_message(
            &registry,
            &session_id,
            BrowserToRelay::ApiRequest {
                req_id: "r1".into(),
                method: frame_protocol::ApiMethod::Get,
                path: "/frames".into(),
                headers: None,
                body: None,
            },
        );
        let _ = hrx.try_recv();
        assert!(registry.pending_requests.contains_key("r1"));

        handle_home_message(
            &registry,
            "srv_1",
            HomeToRelay::ApiResponse { req_id: "r1".into(), status: 200, headers: None, body: None },
        );
        assert!(!registry.pending_requests.contains_key("r1"));
        let to_browser = brx.try_recv().unwrap();
        assert!(matches!(to_browser, RelayToBrowser::ApiResponse { status: 200, .. }));
    }

    #[tokio::test]
    async fn frames_sync_broadcasts_to_paired_browsers_only() {
        let registry = Registry::new(None);
        let (htx, _hrx) = mpsc::unbounded_channel();
        registry.add_home("srv_1".into(), "box".into(), None, htx, CancellationToken::new());
        let (htx2, _hrx2) = mpsc::unbounded_channel();
        registry.add_home("srv_2".into(), "other".into(), None, htx2, CancellationToken::new());

        let (btx_paired, mut brx_paired) = mpsc::unbounded_channel();
        let paired = registry.add_browser("alice".into(), btx_paired);
        registry.set_paired(&paired, "srv_1");
        let _ = brx_paired.try_recv();
        let _ = brx_paired.try_recv();

        let (btx_other, mut brx_other) = mpsc::unbounded_channel();
        let other = registry.add_browser("alice".into(), btx_other);
        registry.set_paired(&other, "srv_2");
        let _ = brx_other.try_recv();
        let _ = brx_other.try_recv();

        handle_home_message(&registry, "srv_1", HomeToRelay::FramesSync { frames: vec![] });

        assert!(brx_paired.try_recv().is_ok());
        assert!(brx_other.try_recv().is_err());
    }
}
