//! # Wire Protocol
//!
//! Defines the four disjoint JSON message universes exchanged between the
//! home agent, the relay, and the browser client:
//!
//! - [`HomeToRelay`] / [`RelayToHome`] — the home agent's tunnel connection.
//! - [`BrowserToRelay`] / [`RelayToBrowser`] — a browser session's connection.
//!
//! Every message is a tagged JSON object (`#[serde(tag = "type")]`), so the
//! wire format is self-describing and forward-compatible: new variants can
//! be added without breaking old decoders, and unknown variants decode as
//! an error that callers are expected to log and drop rather than treat as
//! fatal (see [`decode`]).
//!
//! Binary terminal payloads are carried as base64 text (see [`encode_bytes`]
//! / [`decode_bytes`]) so the whole envelope stays valid JSON/UTF-8 text.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Protocol version advertised by both ends during the handshake. Bumped
/// only for breaking changes; new message variants are additive and do not
/// require a bump.
pub const PROTOCOL_VERSION: &str = "1.0";

// ─── Shared Value Types ─────────────────────────────────────────

/// Coarse frame status as seen by the browser. The supervisor's full status
/// domain (§3) is collapsed to these three for the wire summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameWireStatus {
    Running,
    Stopped,
    Error,
}

/// `FrameSummary` — the projection of a frame sent home-agent -> relay ->
/// browser on connect, on a timer, and on state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSummary {
    pub id: String,
    pub name: String,
    pub status: FrameWireStatus,
    pub workspace: String,
    pub ports: Vec<u16>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
}

/// `DevServerSummary` — a home agent as listed to a browser/dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevServerSummary {
    pub server_id: String,
    pub server_name: String,
    pub connected: bool,
    pub frame_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<String>,
}

/// Terminal-channel error codes (§6 "Terminal `code` domain").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalErrorCode {
    FrameNotFound,
    FrameNotRunning,
    AttachFailed,
}

/// Auth failure codes sent back to a home agent (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorCode {
    InvalidToken,
    Expired,
    ServerNotFound,
    InvalidSignature,
}

/// HTTP methods carried by `api_request` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApiMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

/// A flat header map, used sparingly on `api_request`/`api_response`.
pub type Headers = std::collections::BTreeMap<String, String>;

// ─── Home -> Relay ───────────────────────────────────────────────

/// Messages sent by the home agent over its single outbound tunnel
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HomeToRelay {
    /// Development/unowned registration: no identity verifier checks are
    /// performed beyond `serverId` bookkeeping.
    SimpleAuth { server_id: String, server_name: String },

    /// Owned registration: `signature` is Ed25519 over `serverId:timestamp`
    /// and verified per §4.12's ±5-minute freshness window.
    Auth { server_id: String, timestamp: i64, signature: String },

    /// Heartbeat response, and also sent unprompted every 30s (§4.8).
    Pong { ts: i64 },

    /// Periodic/on-change frame projection (§4.8 "Frame sync").
    FramesSync { frames: Vec<FrameSummary> },

    TerminalOpened { channel_id: String, cols: u16, rows: u16 },
    TerminalData { channel_id: String, data: String },
    TerminalClose { channel_id: String },
    TerminalError { channel_id: String, code: TerminalErrorCode, message: String },

    ApiResponse {
        req_id: String,
        status: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<Headers>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
}

// ─── Relay -> Home ───────────────────────────────────────────────

/// Messages sent by the relay to a connected home agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayToHome {
    SimpleAuthSuccess { server_id: String, session_id: String },
    AuthSuccess { server_id: String, session_id: String },
    AuthError { code: AuthErrorCode, message: String },

    /// Heartbeat request; the agent must answer with [`HomeToRelay::Pong`].
    Ping { ts: i64 },

    TerminalOpen { channel_id: String, frame_id: String },
    TerminalData { channel_id: String, data: String },
    TerminalResize { channel_id: String, cols: u16, rows: u16 },
    TerminalClose { channel_id: String },

    ApiRequest {
        req_id: String,
        method: ApiMethod,
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<Headers>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
}

// ─── Browser -> Relay ────────────────────────────────────────────

/// Messages sent by a browser session over its relay connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserToRelay {
    PwaAuth { token: String },

    TerminalOpen { channel_id: String, frame_id: String },
    TerminalData { channel_id: String, data: String },
    TerminalResize { channel_id: String, cols: u16, rows: u16 },
    TerminalClose { channel_id: String },

    ApiRequest {
        req_id: String,
        method: ApiMethod,
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<Headers>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
}

// ─── Relay -> Browser ────────────────────────────────────────────

/// Messages sent by the relay to a browser session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayToBrowser {
    PwaAuthSuccess { user_id: String },
    PwaAuthError { message: String },

    ServerStatus {
        connected: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
    },
    ServersSync { servers: Vec<DevServerSummary> },
    FramesSync { frames: Vec<FrameSummary> },

    TerminalOpened { channel_id: String, cols: u16, rows: u16 },
    TerminalData { channel_id: String, data: String },
    TerminalClose { channel_id: String },
    TerminalError { channel_id: String, code: TerminalErrorCode, message: String },

    ApiResponse {
        req_id: String,
        status: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<Headers>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
}

// ─── Codec Helpers ───────────────────────────────────────────────

/// Error returned by [`decode`] on malformed or unrecognized input.
/// Per §4.1/§7, callers treat this as a protocol error: log and drop,
/// never fatal (except for the one auth-failure connection-close case
/// handled explicitly at the call sites in `relay`/`agent`).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),
}

/// Serialize any wire message to its JSON text-frame representation.
pub fn encode<T: Serialize>(message: &T) -> String {
    // Every message type here is built from owned, serializable fields;
    // serialization cannot fail.
    serde_json::to_string(message).expect("wire message must serialize")
}

/// Parse a text frame into one of the four message universes.
///
/// Unknown `type` discriminators and malformed JSON both surface as
/// [`CodecError`]; per §4.1, the caller logs and drops rather than
/// tearing down the connection.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Base64-encode raw terminal bytes for transport inside a `data` field.
pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a `data` field back into raw terminal bytes.
pub fn decode_bytes(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_each_universe() {
        let h2r = HomeToRelay::FramesSync {
            frames: vec![FrameSummary {
                id: "f1".into(),
                name: "alpha".into(),
                status: FrameWireStatus::Running,
                workspace: "/tmp/ws".into(),
                ports: vec![33000, 35000],
                created_at: "2026-01-01T00:00:00Z".into(),
                last_activity: None,
            }],
        };
        let text = encode(&h2r);
        let back: HomeToRelay = decode(&text).unwrap();
        match back {
            HomeToRelay::FramesSync { frames } => assert_eq!(frames.len(), 1),
            _ => panic!("wrong variant"),
        }

        let r2h = RelayToHome::Ping { ts: 42 };
        let back: RelayToHome = decode(&encode(&r2h)).unwrap();
        assert!(matches!(back, RelayToHome::Ping { ts: 42 }));

        let b2r = BrowserToRelay::TerminalOpen { channel_id: "c1".into(), frame_id: "f1".into() };
        let back: BrowserToRelay = decode(&encode(&b2r)).unwrap();
        assert!(matches!(back, BrowserToRelay::TerminalOpen { .. }));

        let r2b = RelayToBrowser::TerminalError {
            channel_id: "c1".into(),
            code: TerminalErrorCode::FrameNotRunning,
            message: "not running".into(),
        };
        let back: RelayToBrowser = decode(&encode(&r2b)).unwrap();
        assert!(matches!(
            back,
            RelayToBrowser::TerminalError { code: TerminalErrorCode::FrameNotRunning, .. }
        ));
    }

    #[test]
    fn unknown_type_is_dropped_not_fatal() {
        let err = decode::<BrowserToRelay>(r#"{"type":"not_a_real_type"}"#).unwrap_err();
        assert!(matches!(err, CodecError::MalformedJson(_)));
    }

    #[test]
    fn byte_payloads_round_trip_all_values() {
        let bytes: Vec<u8> = (0u8..=255).collect();
        let encoded = encode_bytes(&bytes);
        let decoded = decode_bytes(&encoded).unwrap();
        assert_eq!(decoded, bytes);
    }
}
