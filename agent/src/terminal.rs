//! # Terminal Attach Adapter (§4.5)
//!
//! Opens a PTY attached to a frame's named multiplexer session via its
//! per-frame control socket, forwards bytes and resize events, and tears
//! the session down on close. Built on the `forkpty` primitive in
//! [`crate::pty`]; the multiplexer itself is `tmux`, driven both as the
//! attached child (the PTY) and, for resize/detach, as a separate
//! short-lived subprocess against the same `-S <socket>` control socket —
//! mirroring how [`crate::container`] shells out to the container engine
//! binary rather than linking against it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::pty::PtyChild;

/// Grace period between the graceful detach and the SIGTERM escalation
/// (§4.5 "Close attempts graceful detach first ... then escalates to
/// SIGTERM after a bounded grace period").
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Where a channel's PTY attaches: the frame's per-frame control socket and
/// the named multiplexer session/window inside it (§3 "Channel", §6
/// "On-disk layout").
#[derive(Debug, Clone)]
pub struct AttachTarget {
    pub socket_path: PathBuf,
    pub session_name: String,
}

/// Signals emitted to the adapter's owner (§4.5).
#[derive(Debug, Clone)]
pub enum TerminalEvent {
    Data { channel_id: String, bytes: Vec<u8> },
    Exit { channel_id: String, code: Option<i32> },
    Error { channel_id: String, message: String },
}

struct Session {
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    child: Arc<PtyChild>,
    target: AttachTarget,
}

pub struct TerminalAttachAdapter {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    events: mpsc::UnboundedSender<TerminalEvent>,
}

impl TerminalAttachAdapter {
    pub fn new(events: mpsc::UnboundedSender<TerminalEvent>) -> Self {
        Self { sessions: Arc::new(Mutex::new(HashMap::new())), events }
    }

    /// Open a channel attached to `target`. Rejects a redundant open
    /// without disturbing any existing session for the same `channel_id`
    /// (§4.5 contract).
    pub async fn open(
        &self,
        channel_id: &str,
        target: AttachTarget,
        cols: u16,
        rows: u16,
    ) -> Result<(), AgentError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(channel_id) {
            return Err(AgentError::Precondition(format!("channel {channel_id} already open")));
        }

        let argv = vec![
            "tmux".to_string(),
            "-S".to_string(),
            target.socket_path.display().to_string(),
            "attach-session".to_string(),
            "-t".to_string(),
            target.session_name.clone(),
        ];
        let child = Arc::new(PtyChild::spawn(&argv, cols, rows)?);

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        spawn_pump(channel_id.to_string(), child.clone(), input_rx, self.events.clone(), self.sessions.clone());

        sessions.insert(channel_id.to_string(), Session { input_tx, child, target });
        Ok(())
    }

    pub async fn write(&self, channel_id: &str, bytes: Vec<u8>) -> Result<(), AgentError> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(channel_id)
            .ok_or_else(|| AgentError::Precondition(format!("no open channel {channel_id}")))?;
        session
            .input_tx
            .send(bytes)
            .map_err(|_| AgentError::Transport("terminal write sink closed".into()))
    }

    /// §4.5: resize both the local PTY (`TIOCSWINSZ`) and the remote
    /// multiplexer's window, since a host-side SIGWINCH alone doesn't
    /// propagate into the attached session.
    pub async fn resize(&self, channel_id: &str, cols: u16, rows: u16) -> Result<(), AgentError> {
        let (child, target) = {
            let sessions = self.sessions.lock().await;
            let session = sessions
                .get(channel_id)
                .ok_or_else(|| AgentError::Precondition(format!("no open channel {channel_id}")))?;
            (session.child.clone(), session.target.clone())
        };

        child.resize(cols, rows).map_err(|e| AgentError::External(format!("TIOCSWINSZ: {e}")))?;

        let status = Command::new("tmux")
            .args([
                "-S",
                &target.socket_path.display().to_string(),
                "resize-window",
                "-t",
                &target.session_name,
                "-x",
                &cols.to_string(),
                "-y",
                &rows.to_string(),
            ])
            .status()
            .await;
        if let Err(e) = status {
            warn!(channel_id, error = %e, "tmux resize-window failed");
        }
        Ok(())
    }

    /// Graceful detach, then SIGTERM escalation after [`CLOSE_GRACE`]
    /// (§4.5).
    pub async fn close(&self, channel_id: &str) {
        let (child, target) = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.remove(channel_id) else { return };
            (session.child, session.target)
        };

        let _ = Command::new("tmux")
            .args(["-S", &target.socket_path.display().to_string(), "detach-client", "-t", &target.session_name])
            .status()
            .await;

        tokio::time::sleep(CLOSE_GRACE).await;
        child.signal(Signal::SIGTERM);
    }

    pub async fn close_all(&self) {
        let channel_ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for channel_id in channel_ids {
            self.close(&channel_id).await;
        }
    }

    pub async fn is_open(&self, channel_id: &str) -> bool {
        self.sessions.lock().await.contains_key(channel_id)
    }
}

/// Drains the PTY into `Data` events and, on EOF, removes the session and
/// emits `Exit`. Reads the input channel concurrently and writes it to the
/// PTY master.
fn spawn_pump(
    channel_id: String,
    child: Arc<PtyChild>,
    mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<TerminalEvent>,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            tokio::select! {
                read = child.read_chunk(&mut buf) => {
                    match read {
                        Ok(0) => break,
                        Ok(n) => {
                            if events.send(TerminalEvent::Data { channel_id: channel_id.clone(), bytes: buf[..n].to_vec() }).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => break,
                        Err(e) => {
                            let _ = events.send(TerminalEvent::Error { channel_id: channel_id.clone(), message: e.to_string() });
                            break;
                        }
                    }
                }
                input = input_rx.recv() => {
                    match input {
                        Some(data) => {
                            if let Err(e) = child.write_all(&data).await {
                                warn!(channel_id, error = %e, "terminal write failed");
                            }
                        }
                        None => {} // input_tx dropped on close(); keep draining output until EOF
                    }
                }
            }
        }
        debug!(channel_id, "terminal pump exiting");
        // Drop this task's clone, then drop the session map's clone so the
        // PTY's reference count reaches zero and we can reclaim `wait()`.
        drop(child);
        let removed = sessions.lock().await.remove(&channel_id);
        let code = match removed.and_then(|s| Arc::try_unwrap(s.child).ok()) {
            Some(child) => child.wait().await,
            None => None,
        };
        let _ = events.send(TerminalEvent::Exit { channel_id, code });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn redundant_open_is_rejected_without_disturbing_existing() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let adapter = TerminalAttachAdapter::new(tx);

        // Use `sh -c` as the attach target stand-in so the test doesn't
        // require tmux to be installed; the rejection path under test never
        // spawns a second process.
        let target = AttachTarget { socket_path: PathBuf::from("/tmp/does-not-matter.sock"), session_name: "main".into() };

        // We can't spawn a real tmux in this sandboxed test environment, so
        // this test only exercises the bookkeeping path by pre-seeding a
        // session directly rather than going through `open`.
        {
            let mut sessions = adapter.sessions.lock().await;
            let (input_tx, _input_rx) = mpsc::unbounded_channel();
            let child = PtyChild::spawn(&["/bin/cat".to_string()], 80, 24).expect("spawn cat for test double");
            sessions.insert("c1".into(), Session { input_tx, child: Arc::new(child), target: target.clone() });
        }

        let err = adapter.open("c1", target, 80, 24).await.unwrap_err();
        assert!(matches!(err, AgentError::Precondition(_)));
        assert!(adapter.is_open("c1").await);
    }

    #[tokio::test]
    async fn write_to_unknown_channel_is_precondition_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let adapter = TerminalAttachAdapter::new(tx);
        let err = adapter.write("missing", vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, AgentError::Precondition(_)));
    }
}
