//! Observer hooks the core fires into.
//!
//! Every hook is fire-and-forget; the core behaves identically when they
//! are no-ops.

use std::sync::Arc;
use std::sync::RwLock;

use webterm_common::{rwlock_read_or_recover, rwlock_write_or_recover};

use crate::session::{SessionId, SessionStatus};

/// Counter/event hooks for logging and metrics collaborators.
pub trait EventSink: Send + Sync {
    fn session_created(&self, _id: &SessionId) {}
    fn session_terminated(&self, _id: &SessionId) {}
    fn session_failed(&self, _id: &SessionId, _message: &str) {}
    fn connection_opened(&self, _id: &SessionId) {}
    fn connection_closed(&self, _id: &SessionId) {}
    fn error_recorded(&self, _code: &'static str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl EventSink for NoopEvents {}

/// Receives session status transitions.
pub trait StatusListener: Send + Sync {
    fn status_changed(&self, id: &SessionId, status: SessionStatus);
}

/// Single optional listener slot shared by the manager and its runners, so a
/// listener registered after a session started still sees its transitions.
#[derive(Clone, Default)]
pub struct StatusNotifier {
    listener: Arc<RwLock<Option<Arc<dyn StatusListener>>>>,
}

impl StatusNotifier {
    pub fn set(&self, listener: Arc<dyn StatusListener>) {
        *rwlock_write_or_recover(&self.listener) = Some(listener);
    }

    pub fn clear(&self) {
        rwlock_write_or_recover(&self.listener).take();
    }

    pub fn notify(&self, id: &SessionId, status: SessionStatus) {
        let listener = rwlock_read_or_recover(&self.listener).clone();
        if let Some(listener) = listener {
            listener.status_changed(id, status);
        }
    }
}
