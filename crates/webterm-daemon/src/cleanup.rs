//! Teardown of a session's OS resources and startup orphan recovery.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use tracing::{debug, error, info, warn};
use webterm_terminal::{PipeError, PipeManager};

use crate::session::{SessionId, SessionResources};

/// Observer side of a child process's exit.
///
/// The process is reaped by whoever owns the matching [`ExitNotifier`]; this
/// handle only signals the process and waits for that owner to report exit.
pub struct ProcessHandle {
    pid: u32,
    exited: Receiver<()>,
}

/// Dropped by the thread that reaped the child.
pub struct ExitNotifier {
    _exited: Sender<()>,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> (Self, ExitNotifier) {
        let (tx, rx) = bounded(0);
        (Self { pid, exited: rx }, ExitNotifier { _exited: tx })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        matches!(self.exited.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Waits until the child has been reaped. Returns false on timeout.
    pub fn wait_exit(&self, timeout: Duration) -> bool {
        matches!(
            self.exited.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    fn signal(&self, signal: libc::c_int) -> bool {
        let Ok(pid) = libc::pid_t::try_from(self.pid) else {
            return false;
        };
        // SAFETY: kill has no memory-safety preconditions. The pid is still
        // ours because the reaper has not dropped its notifier yet.
        unsafe { libc::kill(pid, signal) == 0 }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

/// Closes PTYs, terminates processes and removes per-session files.
pub struct CleanupManager {
    pipes: PipeManager,
    termination_timeout: Duration,
}

impl CleanupManager {
    pub fn new(pipes: PipeManager, termination_timeout: Duration) -> Self {
        Self {
            pipes,
            termination_timeout,
        }
    }

    /// Full teardown: handles first, then the session's files.
    pub fn cleanup(&self, id: &SessionId, resources: Option<SessionResources>) {
        if let Some(resources) = resources {
            self.release(id, resources);
        }
        self.remove_pipes(id);
    }

    /// Closes the PTY and terminates the process, leaving files in place.
    pub fn release(&self, id: &SessionId, resources: SessionResources) {
        resources.pty.close();
        self.terminate_process(id, &resources.process);
    }

    /// SIGTERM, then SIGKILL if the process outlives the termination timeout.
    pub fn terminate_process(&self, id: &SessionId, process: &ProcessHandle) {
        if process.has_exited() {
            return;
        }

        debug!(session_id = %id, pid = process.pid(), "Sending SIGTERM");
        if !process.signal(libc::SIGTERM) && process.has_exited() {
            return;
        }
        if process.wait_exit(self.termination_timeout) {
            return;
        }

        warn!(
            session_id = %id,
            pid = process.pid(),
            timeout_ms = self.termination_timeout.as_millis() as u64,
            "Process ignored SIGTERM, sending SIGKILL"
        );
        process.signal(libc::SIGKILL);
        if !process.wait_exit(self.termination_timeout) {
            error!(session_id = %id, pid = process.pid(), "Process not reaped after SIGKILL");
        }
    }

    pub fn remove_pipes(&self, id: &SessionId) {
        let pipes = self.pipes.paths_for(id.as_str());
        if let Err(e) = self.pipes.remove(&pipes) {
            warn!(session_id = %id, error = %e, "Failed to remove session pipes");
        }
    }

    /// Removes every file in the pipes directory.
    pub fn sweep_orphans(&self) -> Result<usize, PipeError> {
        let removed = self.pipes.sweep_orphans()?;
        if removed > 0 {
            info!(
                removed,
                dir = %self.pipes.dir().display(),
                "Removed orphaned pipe files"
            );
        }
        Ok(removed)
    }
}
