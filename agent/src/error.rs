//! Agent-side error kinds (§7): validation / precondition / resource
//! exhaustion / external-system / transport / protocol. Each variant maps to
//! a fixed downstream contract; callers match on the variant rather than
//! inspecting the message text.

use frame_protocol::TerminalErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("precondition error: {0}")]
    Precondition(String),

    #[error("no free port in the configured range")]
    PortsExhausted,

    #[error("external system error: {0}")]
    External(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl AgentError {
    /// Project onto the wire's `terminal_error` code domain (§6), used by
    /// the terminal-channel bridging path in `tunnel`.
    pub fn terminal_code(&self) -> TerminalErrorCode {
        match self {
            AgentError::Precondition(_) => TerminalErrorCode::FrameNotRunning,
            AgentError::External(_) => TerminalErrorCode::AttachFailed,
            _ => TerminalErrorCode::AttachFailed,
        }
    }
}

impl From<sqlx::Error> for AgentError {
    fn from(e: sqlx::Error) -> Self {
        AgentError::External(format!("store: {e}"))
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::External(format!("io: {e}"))
    }
}
