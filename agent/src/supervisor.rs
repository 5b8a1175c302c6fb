//! # Frame Supervisor (§4.7)
//!
//! The single coordinator gluing [`crate::store`], [`crate::ports`],
//! [`crate::container`], and [`crate::template`] together behind the state
//! machine `created -> starting -> running -> stopping -> stopped ->
//! (starting | destroyed)`, with `error` reachable from any non-destroyed
//! state. Every transition is persisted before its side effect runs and
//! rolled forward on success or to `error` on failure, mirroring how
//! `acton-service`'s service-layer methods wrap a repository call with a
//! status update either side of the external action.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::container::{ContainerAdapter, CreateOptions};
use crate::error::AgentError;
use crate::ports::PortAllocator;
use crate::store::{Frame, FrameConfig, FrameStatus, FrameStore, FrameUpdate, NewFrame, EventKind};
use crate::template::TemplateEngine;
use crate::terminal::AttachTarget;

/// Fixed control-socket and session-name convention for every frame's
/// multiplexer (§6 "On-disk layout").
const CONTROL_SOCKET_NAME: &str = "tmux.sock";
const SESSION_NAME: &str = "main";
/// Fallback container-side service port when a frame's config doesn't name
/// one (§4.7 "Ports block contributes the container-side service port").
const DEFAULT_SERVICE_PORT: u16 = 8080;
/// Base image every frame's container is created from.
const BASE_IMAGE: &str = "frame-base";

pub struct FrameSupervisor {
    store: Arc<FrameStore>,
    container: Arc<dyn ContainerAdapter>,
    templates: Arc<TemplateEngine>,
    frames_dir: PathBuf,
    global_api_keys: HashMap<String, String>,
}

impl FrameSupervisor {
    pub fn new(
        store: Arc<FrameStore>,
        container: Arc<dyn ContainerAdapter>,
        templates: Arc<TemplateEngine>,
        frames_dir: PathBuf,
        global_api_keys: HashMap<String, String>,
    ) -> Self {
        Self { store, container, templates, frames_dir, global_api_keys }
    }

    fn aux_dir(&self, frame_name: &str) -> PathBuf {
        self.frames_dir.join(frame_name)
    }

    pub fn attach_target(&self, frame_name: &str) -> AttachTarget {
        AttachTarget {
            socket_path: self.aux_dir(frame_name).join(CONTROL_SOCKET_NAME),
            session_name: SESSION_NAME.to_string(),
        }
    }

    /// §4.7 `getAttachCommand`: the multiplexer attach command string for
    /// the per-frame socket.
    pub fn get_attach_command(&self, frame: &Frame) -> String {
        let target = self.attach_target(&frame.name);
        format!("tmux -S {} attach-session -t {}", target.socket_path.display(), target.session_name)
    }

    async fn resolve(&self, name_or_id: &str) -> Result<Frame, AgentError> {
        if let Some(frame) = self.store.get_frame(name_or_id).await? {
            return Ok(frame);
        }
        self.store
            .get_frame_by_name(name_or_id)
            .await?
            .ok_or_else(|| AgentError::Validation(format!("no frame '{name_or_id}'")))
    }

    // ── Operations ──────────────────────────────────────────────

    pub async fn create_frame(
        &self,
        name: String,
        description: String,
        workspace_path: String,
        template_name: Option<String>,
    ) -> Result<Frame, AgentError> {
        if !Path::new(&workspace_path).exists() {
            return Err(AgentError::Validation(format!("workspace path '{workspace_path}' does not exist")));
        }
        if let Some(t) = &template_name {
            self.templates.resolve(t)?;
        }

        let used = self.store.all_allocated_ports().await?;
        let port = PortAllocator::allocate(&used)?;

        std::fs::create_dir_all(self.aux_dir(&name))?;

        self.store
            .create_frame(NewFrame { name, description, workspace_path }, Some(port), template_name)
            .await
    }

    /// §4.7 `startFrame`: reject if already `running`; `starting` ->
    /// (create-or-reuse container) -> `running`, applying the template once
    /// the container reports ready. Failures transition to `error`.
    pub async fn start_frame(&self, name_or_id: &str) -> Result<Frame, AgentError> {
        let frame = self.resolve(name_or_id).await?;
        if frame.status == FrameStatus::Running {
            return Err(AgentError::Precondition(format!("frame '{}' is already running", frame.name)));
        }

        self.transition(&frame.id, FrameStatus::Starting, EventKind::Started, None).await?;

        match self.start_frame_inner(&frame).await {
            Ok(()) => {
                self.store
                    .update_frame(
                        &frame.id,
                        FrameUpdate { status: Some(FrameStatus::Running), last_active: Some(Some(Utc::now())), ..Default::default() },
                    )
                    .await?;
                self.store.append_event(&frame.id, EventKind::Started, None).await?;
                self.resolve(&frame.id).await
            }
            Err(e) => {
                warn!(frame = %frame.name, error = %e, "startFrame failed, transitioning to error");
                self.fail(&frame.id, &e).await;
                Err(e)
            }
        }
    }

    async fn start_frame_inner(&self, frame: &Frame) -> Result<(), AgentError> {
        let config = self.store.get_frame_config(&frame.id).await?.unwrap_or_default();

        let container_id = match &frame.container_id {
            Some(id) if self.container.inspect(id).await.is_some() => {
                self.container.start(id).await?;
                id.clone()
            }
            _ => {
                let id = self.create_container(frame, &config).await?;
                self.store
                    .update_frame(&frame.id, FrameUpdate { container_id: Some(Some(id.clone())), ..Default::default() })
                    .await?;
                self.container.start(&id).await?;
                id
            }
        };
        let _ = container_id;

        if let Some(template_name) = &frame.template_name {
            let template = self.templates.resolve(template_name)?;
            let target = self.attach_target(&frame.name);
            self.templates.apply(&target, &template).await?;
        }

        Ok(())
    }

    async fn create_container(&self, frame: &Frame, config: &FrameConfig) -> Result<String, AgentError> {
        let env = build_env(config, &self.global_api_keys);
        let base_port = frame.host_port.ok_or_else(|| AgentError::External("frame has no allocated port".into()))?;
        let derived_port = PortAllocator::derived_port(base_port);
        let service_port = config.service_port.unwrap_or(DEFAULT_SERVICE_PORT);

        let mut port_mappings = vec![(base_port, service_port), (derived_port, derived_port)];
        for p in &config.additional_ports {
            port_mappings.push((*p, *p));
        }

        let name = format!("{}{}", crate::container::CONTAINER_NAME_PREFIX, frame.name);
        let aux_dir = self.aux_dir(&frame.name);

        self.container
            .create(CreateOptions {
                name,
                image: BASE_IMAGE.to_string(),
                mounts: vec![
                    (frame.workspace_path.clone(), "/workspace".to_string(), true),
                    (aux_dir.display().to_string(), "/frame/control".to_string(), true),
                ],
                port_mappings,
                engine_socket: None,
                env,
            })
            .await
    }

    pub async fn stop_frame(&self, name_or_id: &str) -> Result<Frame, AgentError> {
        let frame = self.resolve(name_or_id).await?;
        if frame.status != FrameStatus::Running {
            return Err(AgentError::Precondition(format!("frame '{}' is not running", frame.name)));
        }

        self.transition(&frame.id, FrameStatus::Stopping, EventKind::Stopped, None).await?;

        let result = match &frame.container_id {
            Some(id) => self.container.stop(id).await,
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                self.store.update_frame(&frame.id, FrameUpdate { status: Some(FrameStatus::Stopped), ..Default::default() }).await?;
                self.store.append_event(&frame.id, EventKind::Stopped, None).await?;
                self.resolve(&frame.id).await
            }
            Err(e) => {
                self.fail(&frame.id, &e).await;
                Err(e)
            }
        }
    }

    /// §4.7 `destroyFrame(force?)`: reject a running frame unless `force`.
    /// The container is removed best-effort; the `destroyed` event is
    /// appended before the frame row (and its cascade) is deleted.
    pub async fn destroy_frame(&self, name_or_id: &str, force: bool) -> Result<(), AgentError> {
        let frame = self.resolve(name_or_id).await?;
        if frame.status == FrameStatus::Running && !force {
            return Err(AgentError::Precondition(format!("frame '{}' is running; pass force to destroy anyway", frame.name)));
        }

        if let Some(id) = &frame.container_id {
            if let Err(e) = self.container.remove(id, true).await {
                warn!(frame = %frame.name, error = %e, "best-effort container removal failed during destroy");
            }
        }

        self.store.append_event(&frame.id, EventKind::Destroyed, None).await?;
        self.store.delete_frame(&frame.id).await?;

        if let Err(e) = std::fs::remove_dir_all(self.aux_dir(&frame.name)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(frame = %frame.name, error = %e, "failed to remove per-frame aux directory");
            }
        }
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────

    pub async fn get_frame(&self, id_or_name: &str) -> Result<Option<Frame>, AgentError> {
        match self.resolve(id_or_name).await {
            Ok(frame) => Ok(Some(frame)),
            Err(AgentError::Validation(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list_frames(&self, status: Option<FrameStatus>) -> Result<Vec<Frame>, AgentError> {
        self.store.list_frames(status).await
    }

    pub async fn get_frame_config(&self, frame_id: &str) -> Result<Option<FrameConfig>, AgentError> {
        self.store.get_frame_config(frame_id).await
    }

    pub async fn update_frame_config(&self, frame_id: &str, config: FrameConfig) -> Result<(), AgentError> {
        self.store.set_frame_config(frame_id, &config).await
    }

    pub async fn get_frame_events(&self, frame_id: &str, limit: u32) -> Result<Vec<crate::store::FrameEvent>, AgentError> {
        self.store.get_frame_events(frame_id, limit).await
    }

    // ── Reconciliation ───────────────────────────────────────────

    /// §4.7 "Reconciliation on start-up": frames stuck in `starting` or
    /// `stopping` (the supervisor crashed mid-transition) are resolved
    /// against engine reality rather than trusted as-is.
    pub async fn reconcile_on_startup(&self) -> Result<(), AgentError> {
        for status in [FrameStatus::Starting, FrameStatus::Stopping] {
            for frame in self.store.list_frames(Some(status)).await? {
                let running = match &frame.container_id {
                    Some(id) => self.container.inspect(id).await.map(|i| i.status == "running").unwrap_or(false),
                    None => false,
                };
                let (resolved, kind) =
                    if running { (FrameStatus::Running, EventKind::Started) } else { (FrameStatus::Stopped, EventKind::Stopped) };

                info!(frame = %frame.name, from = ?frame.status, to = ?resolved, "reconciling transient frame state on startup");
                self.store.update_frame(&frame.id, FrameUpdate { status: Some(resolved), ..Default::default() }).await?;
                self.store.append_event(&frame.id, kind, None).await?;
            }
        }
        Ok(())
    }

    // ── Internal helpers ─────────────────────────────────────────

    async fn transition(&self, frame_id: &str, status: FrameStatus, kind: EventKind, detail: Option<serde_json::Value>) -> Result<(), AgentError> {
        self.store.update_frame(frame_id, FrameUpdate { status: Some(status), ..Default::default() }).await?;
        self.store.append_event(frame_id, kind, detail).await
    }

    async fn fail(&self, frame_id: &str, err: &AgentError) {
        let detail = serde_json::json!({ "message": err.to_string() });
        if let Err(e) = self.store.update_frame(frame_id, FrameUpdate { status: Some(FrameStatus::Error), ..Default::default() }).await {
            error!(error = %e, "failed to persist error transition");
        }
        if let Err(e) = self.store.append_event(frame_id, EventKind::Error, Some(detail)).await {
            error!(error = %e, "failed to append error event");
        }
    }
}

/// §4.7 "Config-to-env mapping": provider/model/temperature/base-url plus a
/// provider-specific API key, with the per-frame key winning over any
/// process-global key of the same name.
fn build_env(config: &FrameConfig, global_api_keys: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Some(provider) = &config.provider {
        env.insert("PROVIDER".to_string(), provider.clone());

        let key_var = api_key_env_var(provider);
        let key = config.api_key.clone().or_else(|| global_api_keys.get(&key_var).cloned());
        if let Some(key) = key {
            env.insert(key_var, key);
        }
    }
    if let Some(model) = &config.model {
        env.insert("MODEL".to_string(), model.clone());
    }
    if let Some(temp) = config.temperature {
        env.insert("TEMPERATURE".to_string(), temp.to_string());
    }
    if let Some(base_url) = &config.base_url {
        env.insert("BASE_URL".to_string(), base_url.clone());
    }
    env
}

fn api_key_env_var(provider: &str) -> String {
    format!("{}_API_KEY", provider.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::FakeContainerAdapter;

    async fn test_supervisor() -> (FrameSupervisor, tempfile::TempDir) {
        let store = Arc::new(FrameStore::connect("sqlite::memory:").await.unwrap());
        let container = Arc::new(FakeContainerAdapter::default());
        let templates = Arc::new(TemplateEngine::load(Path::new("/nonexistent"), Path::new("/nonexistent")));
        let frames_dir = tempfile::tempdir().unwrap();
        let supervisor =
            FrameSupervisor::new(store, container, templates, frames_dir.path().to_path_buf(), HashMap::new());
        (supervisor, frames_dir)
    }

    #[tokio::test]
    async fn create_frame_rejects_missing_workspace() {
        let (sup, _dir) = test_supervisor().await;
        let err = sup
            .create_frame("alpha".into(), "".into(), "/this/path/does/not/exist".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[tokio::test]
    async fn full_lifecycle_create_start_stop_destroy() {
        let (sup, _dir) = test_supervisor().await;
        let ws = tempfile::tempdir().unwrap();

        let frame = sup.create_frame("alpha".into(), "".into(), ws.path().display().to_string(), None).await.unwrap();
        assert_eq!(frame.status, FrameStatus::Created);
        assert!(frame.host_port.is_some());

        let started = sup.start_frame(&frame.id).await.unwrap();
        assert_eq!(started.status, FrameStatus::Running);
        assert!(started.container_id.is_some());
        assert!(started.last_active.is_some());

        let err = sup.start_frame(&frame.id).await.unwrap_err();
        assert!(matches!(err, AgentError::Precondition(_)));

        let stopped = sup.stop_frame(&frame.id).await.unwrap();
        assert_eq!(stopped.status, FrameStatus::Stopped);

        sup.destroy_frame(&frame.id, false).await.unwrap();
        assert!(sup.get_frame(&frame.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn destroy_running_frame_requires_force() {
        let (sup, _dir) = test_supervisor().await;
        let ws = tempfile::tempdir().unwrap();
        let frame = sup.create_frame("alpha".into(), "".into(), ws.path().display().to_string(), None).await.unwrap();
        sup.start_frame(&frame.id).await.unwrap();

        let err = sup.destroy_frame(&frame.id, false).await.unwrap_err();
        assert!(matches!(err, AgentError::Precondition(_)));
        sup.destroy_frame(&frame.id, true).await.unwrap();
    }

    #[tokio::test]
    async fn reconciliation_resolves_stuck_starting_frame() {
        let (sup, _dir) = test_supervisor().await;
        let ws = tempfile::tempdir().unwrap();
        let frame = sup.create_frame("alpha".into(), "".into(), ws.path().display().to_string(), None).await.unwrap();

        // Simulate a crash mid-`startFrame`: stuck in `starting` with no container.
        sup.store.update_frame(&frame.id, FrameUpdate { status: Some(FrameStatus::Starting), ..Default::default() }).await.unwrap();

        sup.reconcile_on_startup().await.unwrap();
        let resolved = sup.get_frame(&frame.id).await.unwrap().unwrap();
        assert_eq!(resolved.status, FrameStatus::Stopped);
    }

    #[test]
    fn frame_api_key_wins_over_global() {
        let mut global = HashMap::new();
        global.insert("ANTHROPIC_API_KEY".to_string(), "global-key".to_string());
        let config = FrameConfig { provider: Some("anthropic".into()), api_key: Some("frame-key".into()), ..Default::default() };

        let env = build_env(&config, &global);
        assert_eq!(env.get("ANTHROPIC_API_KEY").unwrap(), "frame-key");
    }

    #[test]
    fn global_api_key_used_when_frame_key_absent() {
        let mut global = HashMap::new();
        global.insert("OPENAI_API_KEY".to_string(), "global-key".to_string());
        let config = FrameConfig { provider: Some("openai".into()), ..Default::default() };

        let env = build_env(&config, &global);
        assert_eq!(env.get("OPENAI_API_KEY").unwrap(), "global-key");
    }
}
