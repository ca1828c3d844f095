//! PTY and pipe errors with structured context.
//!
//! These errors carry stable codes, categories, and actionable suggestions so
//! the HTTP surface and the live channel can report them uniformly.

use std::path::Path;

use serde_json::{Value, json};
use thiserror::Error;
use webterm_common::error_codes::{self, ErrorCategory};

/// PTY operation errors with structured context.
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    Open(String),
    #[error("Failed to spawn process: {0}")]
    Spawn(String),
    #[error("Failed to write to PTY: {0}")]
    Write(String),
    #[error("Failed to read from PTY: {0}")]
    Read(String),
    #[error("Failed to resize PTY: {0}")]
    Resize(String),
    #[error("PTY is closed")]
    Closed,
}

impl PtyError {
    /// Returns the stable error code for this error.
    ///
    /// Allocation failures map to PTY_CREATE_FAILED; everything that happens
    /// on an established PTY maps to PTY_IO_FAILED.
    pub fn code(&self) -> &'static str {
        match self {
            PtyError::Open(_) | PtyError::Spawn(_) => error_codes::PTY_CREATE_FAILED,
            _ => error_codes::PTY_IO_FAILED,
        }
    }

    /// Returns the error category for programmatic handling.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::External
    }

    /// Returns structured context about the error for debugging.
    pub fn context(&self) -> Value {
        json!({
            "operation": self.operation(),
            "reason": self.reason()
        })
    }

    /// Returns a helpful suggestion for resolving the error.
    pub fn suggestion(&self) -> String {
        match self {
            PtyError::Open(_) => {
                "PTY allocation failed. Check system resource limits (ulimit -n) or try restarting."
                    .to_string()
            }
            PtyError::Spawn(reason) => {
                if reason.contains("not found") || reason.contains("No such file") {
                    "Command not found. Check if the command exists and is in PATH.".to_string()
                } else if reason.contains("Permission denied") {
                    "Permission denied. Check file permissions.".to_string()
                } else {
                    "Process spawn failed. Check command syntax and permissions.".to_string()
                }
            }
            PtyError::Write(_) | PtyError::Read(_) | PtyError::Closed => {
                "The session may have ended. List sessions to check its status.".to_string()
            }
            PtyError::Resize(_) => {
                "Failed to resize terminal. Try again or restart the session.".to_string()
            }
        }
    }

    /// Returns whether this error is potentially transient and may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PtyError::Read(_) | PtyError::Write(_))
    }

    /// Returns the operation that failed.
    pub fn operation(&self) -> &'static str {
        match self {
            PtyError::Open(_) => "open",
            PtyError::Spawn(_) => "spawn",
            PtyError::Write(_) => "write",
            PtyError::Read(_) => "read",
            PtyError::Resize(_) => "resize",
            PtyError::Closed => "close",
        }
    }

    /// Returns the underlying reason/message for the error.
    pub fn reason(&self) -> &str {
        match self {
            PtyError::Open(r)
            | PtyError::Spawn(r)
            | PtyError::Write(r)
            | PtyError::Read(r)
            | PtyError::Resize(r) => r,
            PtyError::Closed => "already closed",
        }
    }
}

/// Errors allocating or removing a session's FIFO and output log.
#[derive(Error, Debug)]
pub enum PipeError {
    #[error("Failed to create pipes directory {path}: {reason}")]
    CreateDir { path: String, reason: String },
    #[error("Failed to create input FIFO {path}: {reason}")]
    CreateFifo { path: String, reason: String },
    #[error("Failed to create output file {path}: {reason}")]
    CreateOutput { path: String, reason: String },
    #[error("Failed to remove pipe files: {0}")]
    Remove(String),
    #[error("Pipe I/O failed on {path}: {reason}")]
    Io { path: String, reason: String },
}

impl PipeError {
    pub(crate) fn create_dir(path: &Path, err: std::io::Error) -> Self {
        PipeError::CreateDir {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn create_fifo(path: &Path, err: std::io::Error) -> Self {
        PipeError::CreateFifo {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn create_output(path: &Path, err: std::io::Error) -> Self {
        PipeError::CreateOutput {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }

    pub fn io(path: &Path, err: std::io::Error) -> Self {
        PipeError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            PipeError::Io { .. } => error_codes::PIPE_IO_FAILED,
            _ => error_codes::PIPE_CREATE_FAILED,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::External
    }

    pub fn context(&self) -> Value {
        match self {
            PipeError::CreateDir { path, reason } => {
                json!({ "operation": "create_dir", "path": path, "reason": reason })
            }
            PipeError::CreateFifo { path, reason } => {
                json!({ "operation": "create_fifo", "path": path, "reason": reason })
            }
            PipeError::CreateOutput { path, reason } => {
                json!({ "operation": "create_output", "path": path, "reason": reason })
            }
            PipeError::Remove(reason) => json!({ "operation": "remove", "reason": reason }),
            PipeError::Io { path, reason } => {
                json!({ "operation": "io", "path": path, "reason": reason })
            }
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            PipeError::CreateDir { .. } | PipeError::CreateFifo { .. } => {
                "Check that the pipes directory is writable (WEBTERM_PIPES_DIR).".to_string()
            }
            PipeError::CreateOutput { .. } => {
                "Check free disk space and permissions in the pipes directory.".to_string()
            }
            PipeError::Remove(_) => {
                "Stale pipe files are removed on the next server start.".to_string()
            }
            PipeError::Io { .. } => {
                "The session may have ended. List sessions to check its status.".to_string()
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PipeError::Io { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pty_error_code() {
        assert_eq!(
            PtyError::Open("test".into()).code(),
            error_codes::PTY_CREATE_FAILED
        );
        assert_eq!(
            PtyError::Read("eio".into()).code(),
            error_codes::PTY_IO_FAILED
        );
    }

    #[test]
    fn test_pty_error_category() {
        let err = PtyError::Write("broken pipe".into());
        assert_eq!(err.category(), ErrorCategory::External);
    }

    #[test]
    fn test_pty_error_context() {
        let err = PtyError::Spawn("command not found".into());
        let ctx = err.context();
        assert_eq!(ctx["operation"], "spawn");
        assert_eq!(ctx["reason"], "command not found");
    }

    #[test]
    fn test_pty_error_suggestion_not_found() {
        let err = PtyError::Spawn("No such file or directory".into());
        assert!(err.suggestion().contains("not found"));
    }

    #[test]
    fn test_pty_error_is_retryable() {
        assert!(PtyError::Read("timeout".into()).is_retryable());
        assert!(PtyError::Write("broken pipe".into()).is_retryable());
        assert!(!PtyError::Open("failed".into()).is_retryable());
        assert!(!PtyError::Closed.is_retryable());
    }

    #[test]
    fn test_pipe_error_context_carries_path() {
        let err = PipeError::create_fifo(
            Path::new("/tmp/x.input"),
            std::io::Error::from_raw_os_error(libc::EEXIST),
        );
        let ctx = err.context();
        assert_eq!(ctx["operation"], "create_fifo");
        assert_eq!(ctx["path"], "/tmp/x.input");
        assert_eq!(err.code(), error_codes::PIPE_CREATE_FAILED);
    }
}
