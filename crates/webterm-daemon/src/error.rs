//! Domain errors for session and hub operations.
//!
//! Each error maps to a stable code and category and carries structured
//! context. `Display` text is safe to show clients; OS-level causes stay in
//! `context()` and the logs.

use serde_json::{Value, json};
use thiserror::Error;
use webterm_common::error_codes::{self, ErrorCategory};
use webterm_terminal::{PipeError, PtyError};

use crate::limits::LimitError;
use crate::session::SessionStatus;

/// Session-level errors with structured context.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session {id} cannot be terminated in state {status}")]
    InvalidState { id: String, status: SessionStatus },
    #[error("Failed to create PTY")]
    Pty(#[from] PtyError),
    #[error("Failed to create pipes")]
    Pipe(#[from] PipeError),
    #[error("Failed to resize terminal")]
    Resize(PtyError),
    #[error("{0}")]
    Limit(#[from] LimitError),
    #[error("Failed to start session: {0}")]
    StartFailed(String),
    #[error("Session manager is shutting down")]
    ShuttingDown,
}

impl SessionError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) => error_codes::SESSION_NOT_FOUND,
            SessionError::InvalidState { .. } => error_codes::SESSION_INVALID_STATE,
            SessionError::Pty(e) => e.code(),
            SessionError::Pipe(e) => e.code(),
            SessionError::Resize(e) => e.code(),
            SessionError::Limit(e) => e.code(),
            SessionError::StartFailed(_) => error_codes::SESSION_CREATE_FAILED,
            SessionError::ShuttingDown => error_codes::SERVICE_UNAVAILABLE,
        }
    }

    /// Returns the error category for programmatic handling.
    pub fn category(&self) -> ErrorCategory {
        error_codes::category_for_code(self.code())
    }

    /// Returns structured context about the error for debugging.
    pub fn context(&self) -> Value {
        match self {
            SessionError::NotFound(id) => json!({ "session_id": id }),
            SessionError::InvalidState { id, status } => {
                json!({ "session_id": id, "status": status.as_str() })
            }
            SessionError::Pty(e) => e.context(),
            SessionError::Pipe(e) => e.context(),
            SessionError::Resize(e) => e.context(),
            SessionError::Limit(e) => e.context(),
            SessionError::StartFailed(reason) => json!({ "reason": reason }),
            SessionError::ShuttingDown => json!({}),
        }
    }

    /// Returns a helpful suggestion for resolving the error.
    pub fn suggestion(&self) -> String {
        match self {
            SessionError::NotFound(_) => {
                "List sessions to find a valid id, or create a new session.".to_string()
            }
            SessionError::InvalidState { .. } => {
                "Only starting or running sessions can be terminated.".to_string()
            }
            SessionError::Pty(e) => e.suggestion(),
            SessionError::Pipe(e) => e.suggestion(),
            SessionError::Resize(e) => e.suggestion(),
            SessionError::Limit(e) => e.suggestion(),
            SessionError::StartFailed(_) => {
                "Session bridging could not start. Check system thread limits (ulimit -u)."
                    .to_string()
            }
            SessionError::ShuttingDown => "The server is shutting down. Retry later.".to_string(),
        }
    }

    /// Returns whether this error is potentially transient and may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Pty(e) => e.is_retryable(),
            SessionError::Pipe(e) => e.is_retryable(),
            SessionError::Resize(e) => e.is_retryable(),
            _ => error_codes::is_retryable(self.code()),
        }
    }
}

/// Errors reported on the live channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("Session not found")]
    SessionNotFound(String),
    #[error("Invalid message format")]
    InvalidMessage,
    #[error("Invalid message type")]
    InvalidMessageType(String),
    #[error("Unsupported message type")]
    UnsupportedMessageType(String),
    #[error("Invalid resize dimensions")]
    InvalidResize { rows: i64, cols: i64 },
    #[error("Failed to deliver input")]
    InputUnavailable(String),
    #[error("Failed to resize terminal")]
    ResizeFailed(String),
    #[error("Hub is shutting down")]
    ShuttingDown,
}

impl HubError {
    pub fn code(&self) -> &'static str {
        match self {
            HubError::SessionNotFound(_) => error_codes::SESSION_NOT_FOUND,
            HubError::InvalidMessage
            | HubError::InvalidMessageType(_)
            | HubError::UnsupportedMessageType(_)
            | HubError::InvalidResize { .. } => error_codes::WEBSOCKET_MESSAGE_INVALID,
            HubError::InputUnavailable(_) => error_codes::PIPE_IO_FAILED,
            HubError::ResizeFailed(_) => error_codes::PTY_IO_FAILED,
            HubError::ShuttingDown => error_codes::SERVICE_UNAVAILABLE,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        error_codes::category_for_code(self.code())
    }

    pub fn context(&self) -> Value {
        match self {
            HubError::SessionNotFound(id) => json!({ "session_id": id }),
            HubError::InvalidMessage => json!({}),
            HubError::InvalidMessageType(kind) | HubError::UnsupportedMessageType(kind) => {
                json!({ "type": kind })
            }
            HubError::InvalidResize { rows, cols } => json!({ "rows": rows, "cols": cols }),
            HubError::InputUnavailable(reason) | HubError::ResizeFailed(reason) => {
                json!({ "reason": reason })
            }
            HubError::ShuttingDown => json!({}),
        }
    }

    pub fn is_retryable(&self) -> bool {
        error_codes::is_retryable(self.code())
    }
}

/// Server startup and lifecycle errors.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("Failed to setup signal handler: {0}")]
    SignalSetup(String),
    #[error("Failed to start runtime: {0}")]
    Runtime(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl DaemonError {
    pub fn code(&self) -> &'static str {
        match self {
            DaemonError::Config(_) => error_codes::CONFIG_INVALID,
            DaemonError::Session(e) => e.code(),
            _ => error_codes::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            DaemonError::Config(_) => ErrorCategory::InvalidInput,
            DaemonError::Session(e) => e.category(),
            _ => ErrorCategory::External,
        }
    }

    pub fn context(&self) -> Value {
        match self {
            DaemonError::Config(reason) => json!({ "operation": "config", "reason": reason }),
            DaemonError::Bind { addr, reason } => {
                json!({ "operation": "bind", "addr": addr, "reason": reason })
            }
            DaemonError::SignalSetup(reason) => {
                json!({ "operation": "signal_setup", "reason": reason })
            }
            DaemonError::Runtime(reason) => json!({ "operation": "runtime", "reason": reason }),
            DaemonError::Session(e) => e.context(),
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            DaemonError::Config(_) => {
                "Check WEBTERM_* environment variables and command-line flags.".to_string()
            }
            DaemonError::Bind { .. } => {
                "Another process may be using the port. Pick another with --port.".to_string()
            }
            DaemonError::SignalSetup(_) => {
                "Signal handler setup failed. Check system signal configuration.".to_string()
            }
            DaemonError::Runtime(_) => {
                "Runtime creation failed. Check system thread limits (ulimit -u).".to_string()
            }
            DaemonError::Session(e) => e.suggestion(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DaemonError::Bind { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_codes() {
        assert_eq!(
            SessionError::NotFound("x".into()).code(),
            error_codes::SESSION_NOT_FOUND
        );
        let err = SessionError::InvalidState {
            id: "x".into(),
            status: SessionStatus::Stopped,
        };
        assert_eq!(err.code(), error_codes::SESSION_INVALID_STATE);
        assert_eq!(err.category(), ErrorCategory::Conflict);
        assert_eq!(err.context()["status"], "stopped");
    }

    #[test]
    fn test_session_error_hides_os_cause() {
        let err = SessionError::from(PtyError::Spawn("execvp: /secret/path".into()));
        assert_eq!(err.to_string(), "Failed to create PTY");
        assert_eq!(err.code(), error_codes::PTY_CREATE_FAILED);
        assert_eq!(err.context()["reason"], "execvp: /secret/path");
    }

    #[test]
    fn test_limit_error_is_retryable() {
        let err = SessionError::from(LimitError::Sessions { current: 3, max: 3 });
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Busy);
    }

    #[test]
    fn test_hub_error_messages() {
        assert_eq!(HubError::InvalidMessage.to_string(), "Invalid message format");
        assert_eq!(
            HubError::InvalidMessageType("bogus".into()).to_string(),
            "Invalid message type"
        );
        assert_eq!(
            HubError::InvalidResize { rows: 0, cols: 80 }.to_string(),
            "Invalid resize dimensions"
        );
        assert!(!HubError::InvalidMessage.is_retryable());
        assert!(HubError::InputUnavailable("enxio".into()).is_retryable());
    }

    #[test]
    fn test_daemon_error_suggestions() {
        let err = DaemonError::Bind {
            addr: "127.0.0.1:8080".into(),
            reason: "in use".into(),
        };
        assert!(err.suggestion().contains("--port"));
        assert!(err.is_retryable());
        assert_eq!(DaemonError::Config("bad".into()).code(), error_codes::CONFIG_INVALID);
    }
}
