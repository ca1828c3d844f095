//! Pre-flight resource checks consulted before sessions and connections open.

use serde_json::{Value, json};
use thiserror::Error;
use tracing::warn;
use webterm_common::error_codes;

pub const DEFAULT_MAX_SESSIONS: usize = 100;
pub const DEFAULT_MAX_CONNECTIONS: usize = 500;
const WARNING_THRESHOLD: f64 = 0.8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitError {
    #[error("Session limit reached: {current}/{max}")]
    Sessions { current: usize, max: usize },
    #[error("Connection limit reached: {current}/{max}")]
    Connections { current: usize, max: usize },
}

impl LimitError {
    pub fn code(&self) -> &'static str {
        match self {
            LimitError::Sessions { .. } => error_codes::SESSION_LIMIT,
            LimitError::Connections { .. } => error_codes::CONNECTION_LIMIT,
        }
    }

    pub fn context(&self) -> Value {
        match self {
            LimitError::Sessions { current, max } => {
                json!({ "resource": "sessions", "current": current, "max": max })
            }
            LimitError::Connections { current, max } => {
                json!({ "resource": "connections", "current": current, "max": max })
            }
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            LimitError::Sessions { .. } => {
                "Terminate unused sessions or raise WEBTERM_MAX_SESSIONS.".to_string()
            }
            LimitError::Connections { .. } => {
                "Close idle connections or raise WEBTERM_MAX_CONNECTIONS.".to_string()
            }
        }
    }
}

/// Admission check for new sessions and connections.
///
/// Callers pass the current count so implementations stay stateless.
pub trait ResourceGuard: Send + Sync {
    fn check_session(&self, active_sessions: usize) -> Result<(), LimitError>;
    fn check_connection(&self, open_connections: usize) -> Result<(), LimitError>;
}

/// Admits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl ResourceGuard for Unlimited {
    fn check_session(&self, _active_sessions: usize) -> Result<(), LimitError> {
        Ok(())
    }

    fn check_connection(&self, _open_connections: usize) -> Result<(), LimitError> {
        Ok(())
    }
}

/// Fixed ceilings with a warning once usage passes 80%.
#[derive(Debug, Clone, Copy)]
pub struct ResourceMonitor {
    max_sessions: usize,
    max_connections: usize,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS, DEFAULT_MAX_CONNECTIONS)
    }
}

impl ResourceMonitor {
    pub fn new(max_sessions: usize, max_connections: usize) -> Self {
        Self {
            max_sessions,
            max_connections,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

fn approaching(current: usize, max: usize) -> bool {
    current as f64 > max as f64 * WARNING_THRESHOLD
}

impl ResourceGuard for ResourceMonitor {
    fn check_session(&self, active_sessions: usize) -> Result<(), LimitError> {
        if active_sessions >= self.max_sessions {
            return Err(LimitError::Sessions {
                current: active_sessions,
                max: self.max_sessions,
            });
        }
        if approaching(active_sessions, self.max_sessions) {
            warn!(
                current_sessions = active_sessions,
                max_sessions = self.max_sessions,
                "Approaching session limit"
            );
        }
        Ok(())
    }

    fn check_connection(&self, open_connections: usize) -> Result<(), LimitError> {
        if open_connections >= self.max_connections {
            return Err(LimitError::Connections {
                current: open_connections,
                max: self.max_connections,
            });
        }
        if approaching(open_connections, self.max_connections) {
            warn!(
                current_connections = open_connections,
                max_connections = self.max_connections,
                "Approaching connection limit"
            );
        }
        Ok(())
    }
}
