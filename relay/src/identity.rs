//! # Identity Verifier Capability
//!
//! §4.12: the registry depends on a capability that validates browser
//! bearer tokens and maintains each user's list of registered home-agent
//! public keys. The real deployment plugs in a third-party identity
//! service; [`InMemoryIdentityVerifier`] is a self-contained stand-in used
//! for development and tests — it treats the bearer token itself as the
//! user id, which is obviously not production auth, but it implements the
//! full trait contract (including Ed25519 signature verification) so the
//! rest of the relay never has to know which backing it's talking to.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use dashmap::DashMap;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// A home-agent public key registered to a user.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegisteredServer {
    pub id: String,
    pub name: String,
    pub public_key: String,
    pub registered_at: String,
    pub last_seen: Option<String>,
}

/// Result of a successful bearer-token verification.
pub struct VerifiedUser {
    pub user_id: String,
    pub servers: Vec<RegisteredServer>,
}

/// Freshness window for signed `auth` handshakes (§4.12).
const SIGNATURE_FRESHNESS_SECS: i64 = 300;

#[async_trait::async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Validate a browser bearer token, returning the owning user and their
    /// registered servers, or `None` if the token does not verify.
    async fn verify_token(&self, token: &str) -> Option<VerifiedUser>;

    /// Register (or return the existing registration for) a server under a
    /// user. §4.11 `POST /api/servers/register` is idempotent per caller.
    async fn register_server(
        &self,
        user_id: &str,
        name: &str,
        public_key: &str,
    ) -> RegisteredServer;

    /// Update the last-seen timestamp for a user's registered server.
    async fn update_last_seen(&self, user_id: &str, server_id: &str);

    /// Remove a registered server. Returns whether one was removed.
    async fn remove_server(&self, user_id: &str, server_id: &str) -> bool;

    /// Find a registered server by its id, regardless of owner. The `auth`
    /// tunnel handshake (§6) carries only `serverId`, not a public key, so
    /// the relay must already have one on file to verify against.
    async fn find_server(&self, server_id: &str) -> Option<(String, RegisteredServer)>;

    /// Verify an Ed25519 signature over `"{server_id}:{timestamp}"`, with a
    /// ±5-minute freshness window on `timestamp` (unix seconds).
    async fn verify_signature(
        &self,
        server_id: &str,
        timestamp: i64,
        signature: &str,
        public_key: &str,
    ) -> bool;
}

/// In-memory stand-in identity verifier. Bearer tokens are treated as user
/// ids directly (no external call), which is sufficient to exercise the
/// full registration/listing/signature-verification contract in tests and
/// single-operator deployments.
#[derive(Default)]
pub struct InMemoryIdentityVerifier {
    servers_by_user: DashMap<String, Vec<RegisteredServer>>,
}

impl InMemoryIdentityVerifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl IdentityVerifier for InMemoryIdentityVerifier {
    async fn verify_token(&self, token: &str) -> Option<VerifiedUser> {
        if token.is_empty() {
            return None;
        }
        let user_id = token.to_string();
        let servers = self.servers_by_user.get(&user_id).map(|v| v.clone()).unwrap_or_default();
        Some(VerifiedUser { user_id, servers })
    }

    async fn register_server(
        &self,
        user_id: &str,
        name: &str,
        public_key: &str,
    ) -> RegisteredServer {
        let mut entry = self.servers_by_user.entry(user_id.to_string()).or_default();
        if let Some(existing) = entry.iter().find(|s| s.name == name) {
            return existing.clone();
        }
        let server = RegisteredServer {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            public_key: public_key.to_string(),
            registered_at: Utc::now().to_rfc3339(),
            last_seen: None,
        };
        entry.push(server.clone());
        server
    }

    async fn update_last_seen(&self, user_id: &str, server_id: &str) {
        if let Some(mut servers) = self.servers_by_user.get_mut(user_id) {
            if let Some(s) = servers.iter_mut().find(|s| s.id == server_id) {
                s.last_seen = Some(Utc::now().to_rfc3339());
            }
        }
    }

    async fn remove_server(&self, user_id: &str, server_id: &str) -> bool {
        if let Some(mut servers) = self.servers_by_user.get_mut(user_id) {
            let before = servers.len();
            servers.retain(|s| s.id != server_id);
            return servers.len() != before;
        }
        false
    }

    async fn find_server(&self, server_id: &str) -> Option<(String, RegisteredServer)> {
        for entry in self.servers_by_user.iter() {
            if let Some(server) = entry.value().iter().find(|s| s.id == server_id) {
                return Some((entry.key().clone(), server.clone()));
            }
        }
        None
    }

    async fn verify_signature(
        &self,
        server_id: &str,
        timestamp: i64,
        signature: &str,
        public_key: &str,
    ) -> bool {
        let now = Utc::now().timestamp();
        if (now - timestamp).abs() > SIGNATURE_FRESHNESS_SECS {
            return false;
        }

        let Ok(key_bytes) = BASE64.decode(public_key) else { return false };
        let Ok(key_bytes): Result<[u8; 32], _> = key_bytes.try_into() else { return false };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else { return false };

        let Ok(sig_bytes) = BASE64.decode(signature) else { return false };
        let Ok(sig_bytes): Result<[u8; 64], _> = sig_bytes.try_into() else { return false };
        let signature = Signature::from_bytes(&sig_bytes);

        let message = format!("{server_id}:{timestamp}");
        verifying_key.verify(message.as_bytes(), &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    #[tokio::test]
    async fn register_is_idempotent_per_name() {
        let v = InMemoryIdentityVerifier::new();
        let a = v.register_server("u1", "laptop", "pk").await;
        let b = v.register_server("u1", "laptop", "pk").await;
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn verify_signature_round_trips() {
        let v = InMemoryIdentityVerifier::new();
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let verifying_key = signing_key.verifying_key();
        let pk_b64 = BASE64.encode(verifying_key.to_bytes());

        let ts = Utc::now().timestamp();
        let message = format!("srv_1:{ts}");
        let signature = signing_key.sign(message.as_bytes());
        let sig_b64 = BASE64.encode(signature.to_bytes());

        assert!(v.verify_signature("srv_1", ts, &sig_b64, &pk_b64).await);
        assert!(!v.verify_signature("srv_2", ts, &sig_b64, &pk_b64).await);
    }

    #[tokio::test]
    async fn verify_signature_rejects_stale_timestamp() {
        let v = InMemoryIdentityVerifier::new();
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let verifying_key = signing_key.verifying_key();
        let pk_b64 = BASE64.encode(verifying_key.to_bytes());

        let ts = Utc::now().timestamp() - 3600;
        let message = format!("srv_1:{ts}");
        let signature = signing_key.sign(message.as_bytes());
        let sig_b64 = BASE64.encode(signature.to_bytes());

        assert!(!v.verify_signature("srv_1", ts, &sig_b64, &pk_b64).await);
    }

    #[tokio::test]
    async fn find_server_locates_across_owners() {
        let v = InMemoryIdentityVerifier::new();
        let server = v.register_server("u1", "laptop", "pk").await;
        let (owner, found) = v.find_server(&server.id).await.expect("should be found");
        assert_eq!(owner, "u1");
        assert_eq!(found.id, server.id);
        assert!(v.find_server("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn remove_server_reports_presence() {
        let v = InMemoryIdentityVerifier::new();
        let server = v.register_server("u1", "laptop", "pk").await;
        assert!(v.remove_server("u1", &server.id).await);
        assert!(!v.remove_server("u1", &server.id).await);
    }
}
