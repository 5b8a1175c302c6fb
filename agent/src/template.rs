//! # Template Engine (§4.6)
//!
//! Loads declarative window layouts from two YAML directories (built-in
//! then user overrides), resolves single-level inheritance via `extends`,
//! and applies a resolved template to a live multiplexer session reached
//! through its per-frame control socket. The load/validate/merge split
//! mirrors `coop`'s `profile.rs` (load → validate → apply), generalized
//! from session profiles to window layouts; application shells out to
//! `tmux` the same way [`crate::terminal`] does for resize/detach.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::terminal::AttachTarget;

/// Default overall timeout for readiness waits (§4.6, §5).
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle threshold used by the default "byte-stable" readiness policy.
const READY_IDLE_THRESHOLD: Duration = Duration::from_millis(400);
/// Small inter-line delay between injected lines (§4.6 step 5).
const INJECT_LINE_DELAY: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPolicy {
    #[serde(default)]
    pub mode: ReadyMode,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_READY_TIMEOUT.as_millis() as u64
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadyMode {
    #[default]
    Wait,
    FixedDelay,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub inject: Vec<String>,
    #[serde(default)]
    pub ready: Option<ReadyPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateDoc {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub extends: Option<String>,
    #[serde(default)]
    pub windows: Vec<WindowConfig>,
    #[serde(default)]
    pub default_env: HashMap<String, String>,
}

/// A resolved (post-inheritance) template. `name` is always the filename
/// stem, never the document's internal field, if it had one (§4.6
/// "Loading").
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub description: Option<String>,
    pub windows: Vec<WindowConfig>,
    pub default_env: HashMap<String, String>,
}

pub struct TemplateEngine {
    docs: HashMap<String, TemplateDoc>,
}

impl TemplateEngine {
    /// Scans `builtin_dir` then `user_dir`, in that order, so user-directory
    /// files of the same name override built-ins (§4.6 "Loading"). Parse
    /// failures are logged and skipped, never fatal.
    pub fn load(builtin_dir: &Path, user_dir: &Path) -> Self {
        let mut docs = HashMap::new();
        for dir in [builtin_dir, user_dir] {
            scan_dir(dir, &mut docs);
        }
        Self { docs }
    }

    /// Resolve `name` through its `extends` chain, merging windows per
    /// §4.6's rule (child replaces same-named parent windows; parent-only
    /// windows prepend in parent order; `default_env` merges child-wins).
    /// Cycles are detected and the chain is cut at the point of re-entry.
    pub fn resolve(&self, name: &str) -> Result<Template, AgentError> {
        let mut chain = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut current = name.to_string();

        loop {
            if !seen.insert(current.clone()) {
                warn!(template = %current, "template inheritance cycle detected, breaking");
                break;
            }
            let doc = self
                .docs
                .get(&current)
                .ok_or_else(|| AgentError::Validation(format!("unknown template '{current}'")))?;
            chain.push((current.clone(), doc.clone()));
            match &doc.extends {
                Some(parent) => current = parent.clone(),
                None => break,
            }
        }

        // Merge from the root parent down to the child so later (child)
        // merges win, per the merge rule.
        let mut windows: Vec<WindowConfig> = Vec::new();
        let mut default_env = HashMap::new();
        let mut description = None;

        for (_, doc) in chain.into_iter().rev() {
            description = doc.description.or(description);
            for (k, v) in doc.default_env {
                default_env.insert(k, v);
            }
            windows = merge_windows(windows, doc.windows);
        }

        validate(&windows)?;
        Ok(Template { name: name.to_string(), description, windows, default_env })
    }

    /// Attach the resolved template's windows to a live multiplexer session
    /// (§4.6 "Application").
    pub async fn apply(&self, target: &AttachTarget, template: &Template) -> Result<(), AgentError> {
        wait_for_session(target, DEFAULT_READY_TIMEOUT).await;

        for (i, window) in template.windows.iter().enumerate() {
            let mut env = template.default_env.clone();
            for (k, v) in &window.env {
                env.insert(k.clone(), v.clone());
            }

            if i == 0 {
                run_tmux(target, &["rename-window", "-t", &window_target(target, 0), &window.name]).await;
            } else {
                run_tmux(
                    target,
                    &["new-window", "-t", &target.session_name, "-n", &window.name],
                )
                .await;
            }

            let window_target = window_target_by_name(target, &window.name);

            if let Some(cwd) = &window.cwd {
                send_keys(target, &window_target, &format!("cd {cwd}")).await;
            }
            for (k, v) in &env {
                send_keys(target, &window_target, &format!("export {k}={v}")).await;
            }

            if !is_default_shell(&window.command) {
                send_keys(target, &window_target, &window.command).await;
            }

            if !window.inject.is_empty() {
                let policy = window.ready.clone().unwrap_or(ReadyPolicy { mode: ReadyMode::Wait, timeout_ms: default_timeout_ms() });
                match policy.mode {
                    ReadyMode::Wait => {
                        wait_for_pane_stable(target, &window_target, Duration::from_millis(policy.timeout_ms)).await;
                    }
                    ReadyMode::FixedDelay => {
                        tokio::time::sleep(Duration::from_millis(policy.timeout_ms)).await;
                    }
                }
                for line in &window.inject {
                    send_keys(target, &window_target, line).await;
                    tokio::time::sleep(INJECT_LINE_DELAY).await;
                }
            }
        }

        run_tmux(target, &["select-window", "-t", &window_target(target, 0)]).await;
        Ok(())
    }
}

fn is_default_shell(command: &str) -> bool {
    matches!(command, "$SHELL" | "bash" | "sh" | "zsh")
}

fn validate(windows: &[WindowConfig]) -> Result<(), AgentError> {
    if windows.is_empty() {
        warn!("template has no windows (empty-windows is a warning, not an error)");
    }
    let mut names = std::collections::HashSet::new();
    for w in windows {
        if w.name.is_empty() {
            return Err(AgentError::Validation("window name must not be empty".into()));
        }
        if w.command.is_empty() {
            return Err(AgentError::Validation(format!("window '{}' has an empty command", w.name)));
        }
        if !names.insert(w.name.clone()) {
            return Err(AgentError::Validation(format!("duplicate window name '{}'", w.name)));
        }
    }
    Ok(())
}

/// §4.6 merge rule: windows with names present in the child replace the
/// parent's same-named windows; parent-only windows prepend in parent order.
fn merge_windows(parent: Vec<WindowConfig>, child: Vec<WindowConfig>) -> Vec<WindowConfig> {
    let child_names: std::collections::HashSet<&str> = child.iter().map(|w| w.name.as_str()).collect();
    let mut merged: Vec<WindowConfig> = parent.into_iter().filter(|w| !child_names.contains(w.name.as_str())).collect();
    merged.extend(child);
    merged
}

fn scan_dir(dir: &Path, docs: &mut HashMap<String, TemplateDoc>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else { continue };
        if ext != "yaml" && ext != "yml" {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };

        match std::fs::read_to_string(&path).ok().and_then(|s| serde_yaml::from_str::<TemplateDoc>(&s).ok()) {
            Some(doc) => {
                docs.insert(stem.to_string(), doc);
            }
            None => warn!(path = %path.display(), "failed to parse template, skipping"),
        }
    }
}

fn window_target(target: &AttachTarget, index: usize) -> String {
    format!("{}:{}", target.session_name, index)
}

fn window_target_by_name(target: &AttachTarget, name: &str) -> String {
    format!("{}:{}", target.session_name, name)
}

async fn run_tmux(target: &AttachTarget, args: &[&str]) {
    let mut full = vec!["-S", &target.socket_path.to_str().unwrap_or_default()];
    full.extend_from_slice(args);
    if let Err(e) = Command::new("tmux").args(&full).status().await {
        warn!(error = %e, args = ?args, "tmux command failed");
    }
}

async fn send_keys(target: &AttachTarget, window_target: &str, line: &str) {
    run_tmux(target, &["send-keys", "-t", window_target, line, "Enter"]).await;
}

/// §4.6 step 1: wait up to `timeout` for the session to exist.
async fn wait_for_session(target: &AttachTarget, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let output = Command::new("tmux")
            .args(["-S", &target.socket_path.to_str().unwrap_or_default(), "has-session", "-t", &target.session_name])
            .status()
            .await;
        if matches!(output, Ok(status) if status.success()) {
            return;
        }
        if Instant::now() >= deadline {
            debug!(session = %target.session_name, "session wait timed out, proceeding best-effort");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Default readiness policy (§4.6): capture the pane and consider it ready
/// once content has been byte-stable for [`READY_IDLE_THRESHOLD`], falling
/// back to `timeout` as a non-fatal best-effort bound.
async fn wait_for_pane_stable(target: &AttachTarget, window_target: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    let mut last: Option<String> = None;
    let mut stable_since = Instant::now();

    loop {
        let output = Command::new("tmux")
            .args(["-S", &target.socket_path.to_str().unwrap_or_default(), "capture-pane", "-t", window_target, "-p"])
            .output()
            .await;

        let current = output.ok().map(|o| String::from_utf8_lossy(&o.stdout).to_string());
        match (&last, &current) {
            (Some(prev), Some(now)) if prev == now => {
                if Instant::now().duration_since(stable_since) >= READY_IDLE_THRESHOLD {
                    return;
                }
            }
            _ => stable_since = Instant::now(),
        }
        last = current;

        if Instant::now() >= deadline {
            debug!(window = %window_target, "readiness timeout, treating as best-effort ready");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(extends: Option<&str>, windows: &[(&str, &str)]) -> TemplateDoc {
        TemplateDoc {
            description: None,
            extends: extends.map(String::from),
            windows: windows
                .iter()
                .map(|(n, c)| WindowConfig { name: n.to_string(), command: c.to_string(), cwd: None, env: HashMap::new(), inject: vec![], ready: None })
                .collect(),
            default_env: HashMap::new(),
        }
    }

    #[test]
    fn filename_stem_is_canonical_name_regardless_of_internal_field() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alpha.yaml"), "windows:\n  - name: shell\n    command: bash\n").unwrap();
        let engine = TemplateEngine::load(dir.path(), Path::new("/nonexistent"));
        assert!(engine.docs.contains_key("alpha"));
    }

    #[test]
    fn user_dir_overrides_builtin_of_same_name() {
        let builtin = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        std::fs::write(builtin.path().join("alpha.yaml"), "windows:\n  - name: shell\n    command: bash\n").unwrap();
        std::fs::write(user.path().join("alpha.yaml"), "windows:\n  - name: editor\n    command: vim\n").unwrap();

        let engine = TemplateEngine::load(builtin.path(), user.path());
        let resolved = engine.resolve("alpha").unwrap();
        assert_eq!(resolved.windows.len(), 1);
        assert_eq!(resolved.windows[0].name, "editor");
    }

    #[test]
    fn merge_keeps_parent_order_and_child_overrides() {
        let mut docs = HashMap::new();
        docs.insert("parent".to_string(), doc(None, &[("shell", "bash"), ("editor", "vim")]));
        docs.insert("child".to_string(), doc(Some("parent"), &[("editor", "nvim"), ("logs", "tail -f log")]));
        let engine = TemplateEngine { docs };

        let resolved = engine.resolve("child").unwrap();
        let names: Vec<&str> = resolved.windows.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["shell", "editor", "logs"]);
        assert_eq!(resolved.windows[1].command, "nvim");
    }

    #[test]
    fn inheritance_cycle_terminates_without_duplicating_windows() {
        let mut docs = HashMap::new();
        docs.insert("a".to_string(), doc(Some("b"), &[("shell", "bash")]));
        docs.insert("b".to_string(), doc(Some("a"), &[("editor", "vim")]));
        let engine = TemplateEngine { docs };

        let resolved = engine.resolve("a").unwrap();
        let names: Vec<&str> = resolved.windows.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names.len(), names.iter().collect::<std::collections::HashSet<_>>().len());
    }

    #[test]
    fn validation_rejects_empty_command() {
        let windows = vec![WindowConfig { name: "shell".into(), command: "".into(), cwd: None, env: HashMap::new(), inject: vec![], ready: None }];
        assert!(validate(&windows).is_err());
    }

    #[test]
    fn validation_allows_empty_windows_as_warning_only() {
        assert!(validate(&[]).is_ok());
    }
}
