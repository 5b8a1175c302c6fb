//! # Container Adapter (§4.4)
//!
//! Thin capability layer over the local container engine, shelled out to
//! the `podman`/`docker` binary — the same "spawn the binary, parse its
//! stdout" shape as `coop`'s driver adapters
//! (`crates/cli/src/backend/adapter_tests.rs` exercises an equivalent
//! process-adapter contract), generalized from a terminal-session driver to
//! a container lifecycle one. Runtime is autodetected by probing `PATH` for
//! `podman` first, then `docker` (§6 "detection toggles ... are via `PATH`
//! only").

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::AgentError;

/// Fixed prefix namespacing every container this adapter creates (§4.4).
pub const CONTAINER_NAME_PREFIX: &str = "frame-";

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub name: String,
    pub image: String,
    /// `(host, container)` bind mounts, workspace first (read-write), then
    /// the per-frame auxiliary directory (control socket).
    pub mounts: Vec<(String, String, bool)>,
    /// `(host_port, container_port)` pairs: base service port and the
    /// derived port.
    pub port_mappings: Vec<(u16, u16)>,
    /// Optional pass-through of the local engine socket, for
    /// container-in-container use (§4.4).
    pub engine_socket: Option<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    pub ports: Vec<PortBinding>,
}

#[async_trait]
pub trait ContainerAdapter: Send + Sync {
    async fn create(&self, options: CreateOptions) -> Result<String, AgentError>;
    async fn start(&self, id: &str) -> Result<(), AgentError>;
    async fn stop(&self, id: &str) -> Result<(), AgentError>;
    async fn remove(&self, id: &str, force: bool) -> Result<(), AgentError>;
    async fn inspect(&self, id: &str) -> Option<ContainerInfo>;
    async fn find_by_name(&self, name: &str) -> Option<ContainerInfo>;
    async fn list(&self) -> Vec<ContainerInfo>;
    async fn exec(&self, id: &str, argv: &[String]) -> Result<String, AgentError>;
    async fn image_exists(&self, image: &str) -> bool;
    async fn build_image(&self, path: &str) -> Result<(), AgentError>;
    fn runtime_name(&self) -> &'static str;
}

/// Engine-backed implementation. Shells out to whichever of `podman`/
/// `docker` was detected on `PATH` at construction time.
pub struct EngineContainerAdapter {
    binary: &'static str,
}

impl EngineContainerAdapter {
    /// Autodetects the runtime, preferring `podman` (§4.4).
    pub fn autodetect() -> Self {
        let binary = if which("podman") { "podman" } else { "docker" };
        debug!(runtime = binary, "container runtime detected");
        Self { binary }
    }

    async fn run(&self, args: &[&str]) -> Result<String, AgentError> {
        let output = Command::new(self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| AgentError::External(format!("{} exec failed: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(AgentError::External(format!("{} {} failed: {stderr}", self.binary, args.join(" "))));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn parse_inspect(&self, json: &str) -> Option<ContainerInfo> {
        let parsed: serde_json::Value = serde_json::from_str(json).ok()?;
        let entry = parsed.as_array().and_then(|a| a.first())?;

        let id = entry.get("Id").and_then(|v| v.as_str())?.to_string();
        let name = entry
            .get("Name")
            .and_then(|v| v.as_str())
            .map(|s| s.trim_start_matches('/').to_string())
            .unwrap_or_default();
        let status = entry
            .pointer("/State/Status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let mut ports = Vec::new();
        if let Some(bindings) = entry.pointer("/NetworkSettings/Ports").and_then(|v| v.as_object()) {
            for (container_port, host_entries) in bindings {
                let Some(container_port) = container_port.split('/').next().and_then(|p| p.parse().ok()) else {
                    continue;
                };
                if let Some(entries) = host_entries.as_array() {
                    for e in entries {
                        if let Some(host_port) = e.get("HostPort").and_then(|v| v.as_str()).and_then(|p| p.parse().ok()) {
                            ports.push(PortBinding { host_port, container_port });
                        }
                    }
                }
            }
        }

        Some(ContainerInfo { id, name, status, ports })
    }
}

#[async_trait]
impl ContainerAdapter for EngineContainerAdapter {
    async fn create(&self, options: CreateOptions) -> Result<String, AgentError> {
        let mut args: Vec<String> =
            vec!["create".into(), "--name".into(), options.name.clone()];

        for (host, container, rw) in &options.mounts {
            let mode = if *rw { "rw" } else { "ro" };
            args.push("-v".into());
            args.push(format!("{host}:{container}:{mode}"));
        }
        for (host_port, container_port) in &options.port_mappings {
            args.push("-p".into());
            args.push(format!("{host_port}:{container_port}"));
        }
        if let Some(socket) = &options.engine_socket {
            args.push("-v".into());
            args.push(format!("{socket}:{socket}"));
        }
        for (k, v) in &options.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        args.push(options.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&arg_refs).await
    }

    async fn start(&self, id: &str) -> Result<(), AgentError> {
        self.run(&["start", id]).await.map(|_| ())
    }

    async fn stop(&self, id: &str) -> Result<(), AgentError> {
        self.run(&["stop", id]).await.map(|_| ())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), AgentError> {
        if force {
            self.run(&["rm", "-f", id]).await.map(|_| ())
        } else {
            self.run(&["rm", id]).await.map(|_| ())
        }
    }

    async fn inspect(&self, id: &str) -> Option<ContainerInfo> {
        let json = self.run(&["inspect", id]).await.ok()?;
        self.parse_inspect(&json)
    }

    async fn find_by_name(&self, name: &str) -> Option<ContainerInfo> {
        self.inspect(name).await
    }

    async fn list(&self) -> Vec<ContainerInfo> {
        let Ok(names) = self.run(&["ps", "-a", "--format", "{{.Names}}"]).await else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for name in names.lines().filter(|l| l.starts_with(CONTAINER_NAME_PREFIX)) {
            if let Some(info) = self.inspect(name).await {
                out.push(info);
            }
        }
        out
    }

    async fn exec(&self, id: &str, argv: &[String]) -> Result<String, AgentError> {
        let mut args = vec!["exec".to_string(), id.to_string()];
        args.extend(argv.iter().cloned());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&arg_refs).await
    }

    async fn image_exists(&self, image: &str) -> bool {
        self.run(&["image", "inspect", image]).await.is_ok()
    }

    async fn build_image(&self, path: &str) -> Result<(), AgentError> {
        self.run(&["build", "-t", "frame-base", path]).await.map(|_| ())
    }

    fn runtime_name(&self) -> &'static str {
        self.binary
    }
}

fn which(binary: &str) -> bool {
    let Some(path_var) = std::env::var_os("PATH") else { return false };
    std::env::split_paths(&path_var).any(|dir| dir.join(binary).is_file())
}

/// In-memory stand-in used by supervisor tests, avoiding a real container
/// engine dependency in CI (the adapter capability is exercised directly by
/// its own integration tests against a real runtime when available).
#[derive(Default)]
pub struct FakeContainerAdapter {
    containers: tokio::sync::Mutex<HashMap<String, ContainerInfo>>,
}

#[async_trait]
impl ContainerAdapter for FakeContainerAdapter {
    async fn create(&self, options: CreateOptions) -> Result<String, AgentError> {
        let id = uuid::Uuid::new_v4().to_string();
        let ports = options
            .port_mappings
            .iter()
            .map(|(h, c)| PortBinding { host_port: *h, container_port: *c })
            .collect();
        self.containers.lock().await.insert(
            id.clone(),
            ContainerInfo { id: id.clone(), name: options.name, status: "created".into(), ports },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), AgentError> {
        let mut guard = self.containers.lock().await;
        let c = guard.get_mut(id).ok_or_else(|| AgentError::External("no such container".into()))?;
        c.status = "running".into();
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), AgentError> {
        let mut guard = self.containers.lock().await;
        let c = guard.get_mut(id).ok_or_else(|| AgentError::External("no such container".into()))?;
        c.status = "exited".into();
        Ok(())
    }

    async fn remove(&self, id: &str, _force: bool) -> Result<(), AgentError> {
        self.containers.lock().await.remove(id);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Option<ContainerInfo> {
        self.containers.lock().await.get(id).cloned()
    }

    async fn find_by_name(&self, name: &str) -> Option<ContainerInfo> {
        self.containers.lock().await.values().find(|c| c.name == name).cloned()
    }

    async fn list(&self) -> Vec<ContainerInfo> {
        self.containers.lock().await.values().cloned().collect()
    }

    async fn exec(&self, _id: &str, _argv: &[String]) -> Result<String, AgentError> {
        Ok(String::new())
    }

    async fn image_exists(&self, _image: &str) -> bool {
        true
    }

    async fn build_image(&self, _path: &str) -> Result<(), AgentError> {
        Ok(())
    }

    fn runtime_name(&self) -> &'static str {
        "fake"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_inspect_extracts_ports_and_status() {
        let adapter = EngineContainerAdapter { binary: "podman" };
        let json = r#"[{"Id":"abc123def456","Name":"/frame-alpha","State":{"Status":"running"},
            "NetworkSettings":{"Ports":{"33000/tcp":[{"HostPort":"33000"}]}}}]"#;
        let info = adapter.parse_inspect(json).unwrap();
        assert_eq!(info.id, "abc123def456");
        assert_eq!(info.name, "frame-alpha");
        assert_eq!(info.status, "running");
        assert_eq!(info.ports[0].host_port, 33000);
    }

    #[tokio::test]
    async fn fake_adapter_round_trips_lifecycle() {
        let adapter = FakeContainerAdapter::default();
        let id = adapter
            .create(CreateOptions {
                name: "frame-alpha".into(),
                image: "frame-base".into(),
                mounts: vec![],
                port_mappings: vec![(33000, 39375)],
                engine_socket: None,
                env: HashMap::new(),
            })
            .await
            .unwrap();

        adapter.start(&id).await.unwrap();
        let info = adapter.inspect(&id).await.unwrap();
        assert_eq!(info.status, "running");

        adapter.remove(&id, true).await.unwrap();
        assert!(adapter.inspect(&id).await.is_none());
    }
}
