//! # Frame Agent
//!
//! The home-side daemon: owns frame lifecycle (§4.2-§4.7) and maintains the
//! single outbound tunnel connection to the relay (§4.8). Structure mirrors
//! `relay`'s own `main.rs` — a thin wiring layer over one shared set of
//! collaborators, `tracing` for logs, startup reconciliation before the
//! tunnel loop is ever spawned.
//!
//! ## Modules
//!
//! - [`frame_protocol`] (external crate) — the shared wire codec.
//! - [`config`]     — CLI/env/file configuration (§6).
//! - [`error`]      — agent-side error kinds (§7).
//! - [`store`]      — the frame store (§4.2).
//! - [`ports`]      — the port allocator (§4.3).
//! - [`container`]  — the container adapter (§4.4).
//! - [`pty`]        — native PTY spawning, used by [`terminal`].
//! - [`terminal`]   — the terminal attach adapter (§4.5).
//! - [`template`]   — the template engine (§4.6).
//! - [`supervisor`] — the frame supervisor (§4.7).
//! - [`api`]        — the internal control-plane router (§4.8).
//! - [`tunnel`]     — the home tunnel client (§4.8).

mod api;
mod config;
mod container;
mod error;
mod ports;
mod pty;
mod store;
mod supervisor;
mod template;
mod terminal;
mod tunnel;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::api::ApiRouter;
use crate::config::AgentConfig;
use crate::container::{ContainerAdapter, EngineContainerAdapter};
use crate::store::FrameStore;
use crate::supervisor::FrameSupervisor;
use crate::template::TemplateEngine;
use crate::tunnel::HomeTunnelClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::load()?;
    init_tracing(&config.log_format);
    info!(home = %config.home.display(), relay_url = %config.relay_url, server_name = %config.server_name, "starting frame agent");

    std::fs::create_dir_all(config.frames_dir())?;
    std::fs::create_dir_all(config.builtin_templates_dir())?;
    std::fs::create_dir_all(config.user_templates_dir())?;

    let store = Arc::new(FrameStore::connect(&config.db_url()).await?);
    let container = Arc::new(EngineContainerAdapter::autodetect());
    info!(runtime = container.runtime_name(), "container runtime ready");

    let templates = Arc::new(TemplateEngine::load(&config.builtin_templates_dir(), &config.user_templates_dir()));

    let global_api_keys: HashMap<String, String> = config.file.api_keys.clone();
    let supervisor = Arc::new(FrameSupervisor::new(store, container, templates, config.frames_dir(), global_api_keys));

    supervisor.reconcile_on_startup().await?;

    let api = Arc::new(ApiRouter::new(supervisor.clone()));
    let tunnel = Arc::new(HomeTunnelClient::new(&config, supervisor, api)?);

    tunnel.run().await;
    Ok(())
}

fn init_tracing(log_format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "frame_agent=info".into());
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
