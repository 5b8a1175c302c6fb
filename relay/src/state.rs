//! # Relay Connection Registry
//!
//! §4.9: an in-memory index of live home-agent sessions (keyed by
//! `serverId`) and live browser sessions (keyed by session id), guarded as
//! one coarse-grained region via [`DashMap`] — an `agents` / `connections`
//! / `sessions` map split generalized to the relay's richer pairing and
//! ownership rules.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use frame_protocol::{DevServerSummary, FrameSummary, RelayToBrowser, RelayToHome};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::identity::IdentityVerifier;

pub type HomeTx = mpsc::UnboundedSender<RelayToHome>;
pub type BrowserTx = mpsc::UnboundedSender<RelayToBrowser>;

/// A connected home agent.
pub struct HomeEntry {
    pub server_id: String,
    pub server_name: String,
    pub owner_user_id: Option<String>,
    pub session_id: String,
    pub connected_at: String,
    pub last_ping: Instant,
    pub frames: Vec<FrameSummary>,
    pub tx: HomeTx,
    /// Cancelled to force-close this connection's reader loop, used when a
    /// reconnecting `serverId` displaces this entry (§4.9, §5).
    pub cancel: CancellationToken,
}

/// A connected browser session.
pub struct BrowserEntry {
    pub session_id: String,
    pub user_id: String,
    pub connected_at: String,
    pub paired_server_id: Option<String>,
    pub tx: BrowserTx,
}

/// A routed terminal channel (§3 "Channel", §4.10).
#[derive(Clone)]
pub struct ChannelRoute {
    pub browser_session_id: String,
    pub server_id: String,
}

/// A pending `api_request` awaiting its `api_response` (§3, §4.10).
#[derive(Clone)]
pub struct PendingRequest {
    pub browser_session_id: String,
    pub server_id: String,
}

/// The relay's single shared state region: connection indices plus the
/// per-channel and per-request routing maps the message router consults.
pub struct Registry {
    pub homes: DashMap<String, HomeEntry>,
    pub browsers: DashMap<String, BrowserEntry>,
    pub channels: DashMap<String, ChannelRoute>,
    pub pending_requests: DashMap<String, PendingRequest>,
    pub identity: Option<Arc<dyn IdentityVerifier>>,
}

impl Registry {
    pub fn new(identity: Option<Arc<dyn IdentityVerifier>>) -> Self {
        Self {
            homes: DashMap::new(),
            browsers: DashMap::new(),
            channels: DashMap::new(),
            pending_requests: DashMap::new(),
            identity,
        }
    }

    // ── Home agents ──────────────────────────────────────────────

    /// Register a home agent connection. If `serverId` is already
    /// registered, the prior entry is displaced: its connection is closed
    /// and — per the adopted Open Question (b) policy — all channel and
    /// pending-request routing state targeting it is eagerly cleared
    /// before the new entry is inserted, so no state is ever ambiguous
    /// between the old and new connection for the same `serverId`.
    ///
    /// `cancel` is created by the caller (not here) so its own outbound
    /// writer task can watch the same token and send the displaced peer a
    /// normal close frame with reason "Replaced by new connection" before
    /// the connection is torn down (§5, scenario 4).
    pub fn add_home(
        &self,
        server_id: String,
        server_name: String,
        owner_user_id: Option<String>,
        tx: HomeTx,
        cancel: CancellationToken,
    ) -> (String, bool) {
        let session_id = Uuid::new_v4().to_string();
        let mut displaced = false;

        if let Some((_, old)) = self.homes.remove(&server_id) {
            displaced = true;
            old.cancel.cancel();
            info!(server_id = %server_id, "displacing existing home-agent connection");
            self.clear_routes_for_server(&server_id);
        }

        self.homes.insert(
            server_id.clone(),
            HomeEntry {
                server_id,
                server_name,
                owner_user_id,
                session_id: session_id.clone(),
                connected_at: Utc::now().to_rfc3339(),
                last_ping: Instant::now(),
                frames: Vec::new(),
                tx,
                cancel,
            },
        );

        (session_id, displaced)
    }

    /// Remove a home agent on ordinary disconnect (not displacement).
    /// Pending requests addressed to it are resolved with a 503
    /// (§4.10 GC); channel routes are cleared the same way.
    pub fn remove_home(&self, server_id: &str) {
        self.homes.remove(server_id);
        self.clear_routes_for_server(server_id);
    }

    /// Clear channel and pending-request routing state that targeted
    /// `server_id`. Pending requests are resolved with a synthesized 503
    /// back to the originating browser before being dropped, per §7
    /// "External-system error" / §4.10 GC.
    fn clear_routes_for_server(&self, server_id: &str) {
        self.channels.retain(|_, route| route.server_id != server_id);

        let stale: Vec<(String, String)> = self
            .pending_requests
            .iter()
            .filter(|entry| entry.server_id == server_id)
            .map(|entry| (entry.key().clone(), entry.browser_session_id.clone()))
            .collect();

        for (req_id, browser_session_id) in stale {
            self.pending_requests.remove(&req_id);
            self.send_to_browser(
                &browser_session_id,
                frame_protocol::RelayToBrowser::ApiResponse {
                    req_id,
                    status: 503,
                    headers: None,
                    body: Some(serde_json::json!({ "error": "home agent disconnected" })),
                },
            );
        }
    }

    pub fn record_ping(&self, server_id: &str) {
        if let Some(mut entry) = self.homes.get_mut(server_id) {
            // Relay's own clock, never the agent-reported timestamp
            // (Open Question (a)).
            entry.last_ping = Instant::now();
        }
    }

    pub fn update_frames(&self, server_id: &str, frames: Vec<FrameSummary>) {
        if let Some(mut entry) = self.homes.get_mut(server_id) {
            entry.frames = frames;
        }
    }

    pub fn send_to_home(&self, server_id: &str, msg: RelayToHome) -> bool {
        self.homes.get(server_id).map(|e| e.tx.send(msg).is_ok()).unwrap_or(false)
    }

    pub fn homes_visible_to(&self, user_id: Option<&str>) -> Vec<DevServerSummary> {
        self.homes
            .iter()
            .filter(|e| match (&e.owner_user_id, user_id) {
                (None, _) => true,
                (Some(owner), Some(u)) => owner == u,
                (Some(_), None) => false,
            })
            .map(|e| DevServerSummary {
                server_id: e.server_id.clone(),
                server_name: e.server_name.clone(),
                connected: true,
                frame_count: e.frames.len() as u32,
                connected_at: Some(e.connected_at.clone()),
            })
            .collect()
    }

    /// First online home agent visible to `user_id` that isn't already
    /// paired to `exclude` (used for manual reassignment; pass `None`).
    fn first_eligible_home(&self, user_id: Option<&str>) -> Option<String> {
        self.homes
            .iter()
            .find(|e| match (&e.owner_user_id, user_id) {
                (None, _) => true,
                (Some(owner), Some(u)) => owner == u,
                (Some(_), None) => false,
            })
            .map(|e| e.server_id.clone())
    }

    // ── Browser sessions ─────────────────────────────────────────

    pub fn add_browser(&self, user_id: String, tx: BrowserTx) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.browsers.insert(
            session_id.clone(),
            BrowserEntry {
                session_id: session_id.clone(),
                user_id,
                connected_at: Utc::now().to_rfc3339(),
                paired_server_id: None,
                tx,
            },
        );
        session_id
    }

    /// Remove a browser session and garbage-collect everything it owns:
    /// pending `reqId` entries and channel routes (§4.10 GC).
    pub fn remove_browser(&self, session_id: &str) {
        self.browsers.remove(session_id);
        self.pending_requests.retain(|_, pending| pending.browser_session_id != session_id);
        self.channels.retain(|_, route| route.browser_session_id != session_id);
    }

    pub fn send_to_browser(&self, session_id: &str, msg: RelayToBrowser) -> bool {
        self.browsers.get(session_id).map(|e| e.tx.send(msg).is_ok()).unwrap_or(false)
    }

    pub fn broadcast_to_paired(&self, server_id: &str, msg: RelayToBrowser) {
        for entry in self.browsers.iter() {
            if entry.paired_server_id.as_deref() == Some(server_id) {
                let _ = entry.tx.send(msg.clone());
            }
        }
    }

    /// Pair a browser session that has no current target to the first
    /// eligible online home agent of its user (§4.9 "Auto-pairing").
    /// Pushes `server_status` and the cached `frames_sync` on success.
    pub fn auto_pair(&self, session_id: &str) -> Option<String> {
        let user_id = self.browsers.get(session_id).map(|e| e.user_id.clone())?;
        if self.browsers.get(session_id).map(|e| e.paired_server_id.is_some()).unwrap_or(false) {
            return None;
        }

        let server_id = self.first_eligible_home(Some(&user_id))?;
        self.set_paired(session_id, &server_id);
        Some(server_id)
    }

    pub fn set_paired(&self, session_id: &str, server_id: &str) {
        if let Some(mut browser) = self.browsers.get_mut(session_id) {
            browser.paired_server_id = Some(server_id.to_string());
        }
        self.push_pairing_state(session_id, server_id);
    }

    fn push_pairing_state(&self, session_id: &str, server_id: &str) {
        let connected = self.homes.contains_key(server_id);
        self.send_to_browser(
            session_id,
            RelayToBrowser::ServerStatus { connected, server_id: Some(server_id.to_string()) },
        );
        if let Some(home) = self.homes.get(server_id) {
            self.send_to_browser(
                session_id,
                RelayToBrowser::FramesSync { frames: home.frames.clone() },
            );
        }
    }

    /// When a new home agent connects, auto-pair any browser sessions that
    /// still have no target and whose user matches (§4.9).
    pub fn auto_pair_new_home(&self, server_id: &str, owner_user_id: Option<&str>) {
        let candidates: Vec<String> = self
            .browsers
            .iter()
            .filter(|b| {
                b.paired_server_id.is_none()
                    && match owner_user_id {
                        None => true,
                        Some(owner) => b.user_id == owner,
                    }
            })
            .map(|b| b.session_id.clone())
            .collect();

        for session_id in candidates {
            self.set_paired(&session_id, server_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home_tx() -> (HomeTx, mpsc::UnboundedReceiver<RelayToHome>) {
        mpsc::unbounded_channel()
    }
    fn browser_tx() -> (BrowserTx, mpsc::UnboundedReceiver<RelayToBrowser>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn reconnect_displaces_prior_entry_exactly_once() {
        let registry = Registry::new(None);
        let (tx1, _rx1) = home_tx();
        let cancel1 = CancellationToken::new();
        let (_sid1, displaced1) =
            registry.add_home("srv_1".into(), "box-a".into(), None, tx1, cancel1.clone());
        assert!(!displaced1);
        assert!(!cancel1.is_cancelled());

        let (tx2, _rx2) = home_tx();
        let (_sid2, displaced2) =
            registry.add_home("srv_1".into(), "box-a".into(), None, tx2, CancellationToken::new());
        assert!(displaced2);
        assert!(cancel1.is_cancelled());
        assert_eq!(registry.homes.len(), 1);
    }

    #[test]
    fn ownership_rules_gate_visibility() {
        let registry = Registry::new(None);
        let (tx_owned, _r1) = home_tx();
        registry.add_home("srv_owned".into(), "owned".into(), Some("alice".into()), tx_owned, CancellationToken::new());
        let (tx_open, _r2) = home_tx();
        registry.add_home("srv_open".into(), "open".into(), None, tx_open, CancellationToken::new());

        let visible_to_alice = registry.homes_visible_to(Some("alice"));
        assert_eq!(visible_to_alice.len(), 2);

        let visible_to_bob = registry.homes_visible_to(Some("bob"));
        assert_eq!(visible_to_bob.len(), 1);
        assert_eq!(visible_to_bob[0].server_id, "srv_open");
    }

    #[test]
    fn browser_auto_pairs_to_matching_user_home() {
        let registry = Registry::new(None);
        let (htx, _hr) = home_tx();
        registry.add_home("srv_1".into(), "box".into(), Some("alice".into()), htx, CancellationToken::new());

        let (btx, _br) = browser_tx();
        let session_id = registry.add_browser("alice".into(), btx);

        let paired = registry.auto_pair(&session_id);
        assert_eq!(paired.as_deref(), Some("srv_1"));
    }

    #[test]
    fn browser_close_clears_pending_and_channels() {
        let registry = Registry::new(None);
        let (btx, _br) = browser_tx();
        let session_id = registry.add_browser("alice".into(), btx);

        registry.pending_requests.insert(
            "req1".into(),
            PendingRequest { browser_session_id: session_id.clone(), server_id: "srv_1".into() },
        );
        registry.channels.insert(
            "chan1".into(),
            ChannelRoute { browser_session_id: session_id.clone(), server_id: "srv_1".into() },
        );

        registry.remove_browser(&session_id);
        assert!(registry.pending_requests.is_empty());
        assert!(registry.channels.is_empty());
    }

    #[test]
    fn displacement_resolves_pending_requests_with_503() {
        let registry = Registry::new(None);
        let (htx, _hr) = home_tx();
        registry.add_home("srv_1".into(), "box".into(), None, htx, CancellationToken::new());

        let (btx, mut brx) = browser_tx();
        let session_id = registry.add_browser("alice".into(), btx);
        registry.pending_requests.insert(
            "req1".into(),
            PendingRequest { browser_session_id: session_id.clone(), server_id: "srv_1".into() },
        );

        let (htx2, _hr2) = home_tx();
        registry.add_home("srv_1".into(), "box".into(), None, htx2, CancellationToken::new());

        assert!(registry.pending_requests.is_empty());
        let msg = brx.try_recv().expect("expected a synthesized 503");
        assert!(matches!(msg, RelayToBrowser::ApiResponse { status: 503, .. }));
    }
}
