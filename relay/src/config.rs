//! Env-driven relay configuration. No CLI surface or config file layer on
//! this side — `main.rs` hardcodes the bind port in most relay deployments
//! this one is descended from; generalized here to three env-overridable
//! settings.

use std::net::Ipv4Addr;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_host: Ipv4Addr,
    pub bind_port: u16,
    /// Whether an [`crate::identity::IdentityVerifier`] is constructed at
    /// all. With it unset, owned `auth`/bearer-gated endpoints fail closed
    /// per §4.11, and unowned `simple_auth`/dev-mode browser sessions work
    /// without it.
    pub identity_enabled: bool,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self {
            bind_host: std::env::var("RELAY_HOST")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Ipv4Addr::UNSPECIFIED),
            bind_port: std::env::var("RELAY_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(7070),
            identity_enabled: std::env::var("RELAY_IDENTITY_ENABLED")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
        }
    }
}
