//! Session records and the shared per-session state cell.
//!
//! `SessionInfo` is the wire shape; `SessionCell` pairs it with the OS
//! handles so that status and handle ownership always change together.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use webterm_common::{rwlock_read_or_recover, rwlock_write_or_recover};
use webterm_terminal::{PtyHandle, SpawnRequest};

use crate::cleanup::ProcessHandle;

/// Error returned when SessionId validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdError {
    pub message: String,
}

impl fmt::Display for SessionIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SessionIdError {}

/// Opaque, globally unique session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Validates an identifier received from a client.
    pub fn try_new(id: impl Into<String>) -> Result<Self, SessionIdError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SessionIdError {
                message: "Session ID cannot be empty or whitespace-only".to_string(),
            });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for SessionId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Starting | SessionStatus::Running)
    }

    pub fn can_terminate(&self) -> bool {
        self.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Error)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session record as exposed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub shell: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub input_pipe: String,
    pub output_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SessionInfo {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn input_path(&self) -> PathBuf {
        PathBuf::from(&self.input_pipe)
    }

    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(&self.output_file)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateSessionRequest {
    pub shell: Option<String>,
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
}

impl CreateSessionRequest {
    pub fn to_spawn_request(&self) -> SpawnRequest {
        SpawnRequest {
            shell: self.shell.clone(),
            command: self.command.clone(),
            working_dir: self.working_dir.as_ref().map(PathBuf::from),
            env: self.env.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
    pub count: usize,
}

impl From<Vec<SessionInfo>> for SessionListResponse {
    fn from(sessions: Vec<SessionInfo>) -> Self {
        let count = sessions.len();
        Self { sessions, count }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session: SessionInfo,
}

/// OS handles a live session owns.
pub struct SessionResources {
    pub pty: Arc<PtyHandle>,
    pub process: ProcessHandle,
}

/// How a session left the active states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Stopped,
    Failed(String),
}

impl SessionEnd {
    fn status(&self) -> SessionStatus {
        match self {
            SessionEnd::Stopped => SessionStatus::Stopped,
            SessionEnd::Failed(_) => SessionStatus::Error,
        }
    }
}

struct SessionState {
    info: SessionInfo,
    resources: Option<SessionResources>,
    finished_at: Option<DateTime<Utc>>,
}

/// Record plus handles behind one lock.
///
/// Handles are present exactly while the status is `starting` or `running`;
/// every transition out of those states takes them in the same write.
pub struct SessionCell {
    state: RwLock<SessionState>,
}

impl SessionCell {
    pub(crate) fn new(info: SessionInfo, resources: SessionResources) -> Self {
        Self {
            state: RwLock::new(SessionState {
                info,
                resources: Some(resources),
                finished_at: None,
            }),
        }
    }

    pub fn snapshot(&self) -> SessionInfo {
        rwlock_read_or_recover(&self.state).info.clone()
    }

    pub fn status(&self) -> SessionStatus {
        rwlock_read_or_recover(&self.state).info.status
    }

    pub fn pty(&self) -> Option<Arc<PtyHandle>> {
        rwlock_read_or_recover(&self.state)
            .resources
            .as_ref()
            .map(|r| Arc::clone(&r.pty))
    }

    pub fn pid(&self) -> Option<u32> {
        rwlock_read_or_recover(&self.state)
            .resources
            .as_ref()
            .map(|r| r.process.pid())
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        rwlock_read_or_recover(&self.state).finished_at
    }

    pub(crate) fn mark_running(&self) -> bool {
        let mut state = rwlock_write_or_recover(&self.state);
        if state.info.status != SessionStatus::Starting {
            return false;
        }
        state.info.status = SessionStatus::Running;
        state.info.last_active_at = Utc::now();
        true
    }

    /// Moves an active session to `stopping` and hands its handles to the
    /// caller. Returns the current status when termination is not allowed.
    pub(crate) fn begin_stopping(&self) -> Result<Option<SessionResources>, SessionStatus> {
        let mut state = rwlock_write_or_recover(&self.state);
        if !state.info.status.can_terminate() {
            return Err(state.info.status);
        }
        state.info.status = SessionStatus::Stopping;
        Ok(state.resources.take())
    }

    /// Moves the session to its terminal status regardless of where it is.
    pub(crate) fn finish(&self, end: SessionEnd) -> Option<SessionResources> {
        let mut state = rwlock_write_or_recover(&self.state);
        Self::apply_end(&mut state, end)
    }

    /// Like `finish`, but only from `starting`/`running`. `None` means another
    /// path already owns the transition.
    pub(crate) fn finish_if_active(&self, end: SessionEnd) -> Option<Option<SessionResources>> {
        let mut state = rwlock_write_or_recover(&self.state);
        if !state.info.status.is_active() {
            return None;
        }
        Some(Self::apply_end(&mut state, end))
    }

    fn apply_end(state: &mut SessionState, end: SessionEnd) -> Option<SessionResources> {
        state.info.status = end.status();
        state.info.error_message = match end {
            SessionEnd::Failed(message) => Some(message),
            SessionEnd::Stopped => None,
        };
        if state.finished_at.is_none() {
            state.finished_at = Some(Utc::now());
        }
        state.resources.take()
    }

    #[cfg(test)]
    pub(crate) fn detached(info: SessionInfo) -> Self {
        Self {
            state: RwLock::new(SessionState {
                info,
                resources: None,
                finished_at: None,
            }),
        }
    }
}
