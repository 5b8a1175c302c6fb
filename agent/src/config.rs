//! # Configuration
//!
//! Layered the way `coop`'s `crates/cli/src/config.rs` layers its clap
//! `Config`: flags with `env` fallbacks for the process-level surface
//! (relay URL, home root directory, log format), merged with a `figment`
//! JSON-file provider for the freeform per-user config file described in §6
//! ("a configuration file (JSON, freeform key/value including provider API
//! keys and an optional database URL)"). `DATABASE_URL` overrides the file
//! value per §6 "Environment (home side)".

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use figment::providers::{Format, Json};
use figment::Figment;
use serde::Deserialize;

#[derive(Debug, Parser)]
#[command(name = "frame-agent", version, about = "Home-side frame supervisor and relay tunnel")]
pub struct Cli {
    /// WebSocket URL of the relay's `/tunnel` upgrade endpoint.
    #[arg(long, env = "FRAME_RELAY_URL", default_value = "ws://127.0.0.1:7070/tunnel")]
    pub relay_url: String,

    /// Human name advertised to the relay (§3 "Home-agent session").
    #[arg(long, env = "FRAME_SERVER_NAME")]
    pub server_name: Option<String>,

    /// Per-user root directory (§6 "On-disk layout (home side)").
    #[arg(long, env = "FRAME_HOME", default_value = "~/.frame-agent")]
    pub home: String,

    /// Log format (json or text).
    #[arg(long, env = "FRAME_LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}

/// Freeform JSON config file contents (§3 "Frame configuration", §6).
/// Deserialized loosely: unknown keys are preserved so provider-specific API
/// keys of any shape survive round-tripping without the agent needing to
/// know every provider ahead of time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub database_url: Option<String>,
    /// Provider API keys, keyed by the env var name the supervisor forwards
    /// into the container (e.g. `ANTHROPIC_API_KEY`).
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}

/// Resolved runtime configuration: CLI/env settings plus the loaded file.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub relay_url: String,
    pub server_name: String,
    pub home: PathBuf,
    pub log_format: String,
    pub file: FileConfig,
}

impl AgentConfig {
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();
        let home = expand_home(&cli.home);
        std::fs::create_dir_all(&home)?;

        let config_path = home.join("config.json");
        let mut file: FileConfig = if config_path.exists() {
            Figment::new().merge(Json::file(&config_path)).extract()?
        } else {
            FileConfig::default()
        };
        // §6 "Environment (home side)": DATABASE_URL overrides the file value.
        if let Ok(url) = std::env::var("DATABASE_URL") {
            file.database_url = Some(url);
        }

        let server_name = cli.server_name.unwrap_or_else(|| {
            hostname().unwrap_or_else(|| "frame-agent".to_string())
        });

        Ok(Self {
            relay_url: cli.relay_url,
            server_name,
            home,
            log_format: cli.log_format,
            file,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.home.join("frames.db")
    }

    /// The URL `store::FrameStore::connect` should use: `DATABASE_URL`/
    /// the config file's `database_url` if set, otherwise the default
    /// on-disk path under `home` (§6 "Environment (home side)").
    pub fn db_url(&self) -> String {
        self.file.database_url.clone().unwrap_or_else(|| format!("sqlite://{}?mode=rwc", self.db_path().display()))
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.home.join("frames")
    }

    pub fn builtin_templates_dir(&self) -> PathBuf {
        self.home.join("templates")
    }

    pub fn user_templates_dir(&self) -> PathBuf {
        self.home.join("templates.d")
    }

    /// Path that persists the `serverId` across restarts (§4.8 "generated on
    /// first run").
    pub fn server_id_path(&self) -> PathBuf {
        self.home.join("server_id")
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME").ok().or_else(|| {
        std::process::Command::new("hostname")
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .map(|s| s.trim().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_home_substitutes_tilde() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(expand_home("~/.frame-agent"), PathBuf::from("/home/tester/.frame-agent"));
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn file_config_defaults_to_empty() {
        let cfg = FileConfig::default();
        assert!(cfg.database_url.is_none());
        assert!(cfg.api_keys.is_empty());
    }
}
