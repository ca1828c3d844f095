//! Session registry and lifecycle orchestration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use portable_pty::Child;
use tracing::{debug, error, info, warn};
use webterm_common::{mutex_lock_or_recover, rwlock_read_or_recover, rwlock_write_or_recover};
use webterm_terminal::{PipeManager, PtyHandle};

use crate::cleanup::{CleanupManager, ProcessHandle};
use crate::config::DaemonConfig;
use crate::error::SessionError;
use crate::events::{EventSink, NoopEvents, StatusListener, StatusNotifier};
use crate::hub::SessionDirectory;
use crate::limits::{ResourceGuard, ResourceMonitor, Unlimited};
use crate::output_buffer::OutputSink;
use crate::runner::{RunnerConfig, RunnerContext, RunnerStatistics, SessionRunner};
use crate::session::{
    CreateSessionRequest, SessionCell, SessionEnd, SessionId, SessionInfo, SessionResources,
    SessionStatus,
};

/// Optional collaborators wired into a manager.
#[derive(Clone)]
pub struct ManagerHooks {
    pub events: Arc<dyn EventSink>,
    pub limits: Arc<dyn ResourceGuard>,
    pub output_sink: Option<Arc<dyn OutputSink>>,
}

impl Default for ManagerHooks {
    fn default() -> Self {
        Self {
            events: Arc::new(NoopEvents),
            limits: Arc::new(Unlimited),
            output_sink: None,
        }
    }
}

impl ManagerHooks {
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_limits(mut self, limits: Arc<dyn ResourceGuard>) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_output_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.output_sink = Some(sink);
        self
    }
}

#[derive(Clone)]
struct SessionEntry {
    cell: Arc<SessionCell>,
    runner: Arc<SessionRunner>,
}

struct Registry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    pipes: PipeManager,
    cleanup: Arc<CleanupManager>,
    config: DaemonConfig,
    status: StatusNotifier,
    hooks: ManagerHooks,
    shutting_down: AtomicBool,
    shutdown_rx: Receiver<()>,
}

/// Creates, tracks and tears down sessions.
///
/// Registry writes are serialized behind one lock; lookups run concurrently.
/// A background sweeper evicts finished sessions and terminates idle ones.
pub struct SessionManager {
    registry: Arc<Registry>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
}

impl SessionManager {
    /// Builds a manager with a [`ResourceMonitor`] sized from `config`.
    pub fn new(config: DaemonConfig) -> Result<Self, SessionError> {
        let limits = ResourceMonitor::new(config.max_sessions, config.max_connections);
        Self::with_hooks(config, ManagerHooks::default().with_limits(Arc::new(limits)))
    }

    pub fn with_hooks(config: DaemonConfig, hooks: ManagerHooks) -> Result<Self, SessionError> {
        let pipes = PipeManager::new(&config.pipes_dir);
        pipes.ensure_dir()?;
        let cleanup = Arc::new(CleanupManager::new(
            pipes.clone(),
            config.termination_timeout,
        ));
        if let Err(e) = cleanup.sweep_orphans() {
            warn!(error = %e, "Startup orphan sweep failed");
        }

        let (shutdown_tx, shutdown_rx) = bounded(0);
        let registry = Arc::new(Registry {
            sessions: RwLock::new(HashMap::new()),
            pipes,
            cleanup,
            config,
            status: StatusNotifier::default(),
            hooks,
            shutting_down: AtomicBool::new(false),
            shutdown_rx,
        });

        let sweeper = spawn_sweeper(Arc::clone(&registry))
            .map_err(|e| SessionError::StartFailed(e.to_string()))?;

        info!(
            pipes_dir = %registry.config.pipes_dir.display(),
            sweep_interval_secs = registry.config.sweep_interval.as_secs(),
            "Session manager started"
        );

        Ok(Self {
            registry,
            sweeper: Mutex::new(Some(sweeper)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.registry.config
    }

    pub fn limits(&self) -> Arc<dyn ResourceGuard> {
        Arc::clone(&self.registry.hooks.limits)
    }

    pub fn set_status_listener(&self, listener: Arc<dyn StatusListener>) {
        self.registry.status.set(listener);
    }

    pub fn clear_status_listener(&self) {
        self.registry.status.clear();
    }

    /// Allocates pipes, spawns the process and starts its runner.
    ///
    /// The returned record is the state at registration (`starting`); the
    /// runner moves it to `running` once its threads are up.
    pub fn create(&self, request: &CreateSessionRequest) -> Result<SessionInfo, SessionError> {
        let registry = &self.registry;
        if registry.shutting_down.load(Ordering::SeqCst) {
            return Err(SessionError::ShuttingDown);
        }
        registry.hooks.limits.check_session(self.active_count())?;

        let id = SessionId::generate();
        let pipes = registry.pipes.create(id.as_str()).inspect_err(|e| {
            registry.hooks.events.error_recorded(e.code());
        })?;

        let mut spawned = match PtyHandle::spawn(&request.to_spawn_request()) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(session_id = %id, error = %e, "Failed to spawn session process");
                registry.hooks.events.error_recorded(e.code());
                registry.cleanup.remove_pipes(&id);
                return Err(e.into());
            }
        };
        let Some(pid) = spawned.pty.pid() else {
            registry.discard_unstarted(&id, &spawned.pty, &mut spawned.child);
            return Err(SessionError::StartFailed(
                "spawned process has no pid".to_string(),
            ));
        };

        let now = Utc::now();
        let info = SessionInfo {
            id: id.clone(),
            status: SessionStatus::Starting,
            created_at: now,
            last_active_at: now,
            shell: spawned.command.program.clone(),
            command: spawned.command.argv(),
            working_dir: spawned.working_dir.display().to_string(),
            input_pipe: pipes.input.display().to_string(),
            output_file: pipes.output.display().to_string(),
            error_message: None,
        };

        let pty = Arc::new(spawned.pty);
        let (process, notifier) = ProcessHandle::new(pid);
        let cell = Arc::new(SessionCell::new(
            info,
            SessionResources {
                pty: Arc::clone(&pty),
                process,
            },
        ));
        let runner = Arc::new(SessionRunner::new(
            id.clone(),
            Arc::clone(&pty),
            pipes,
            RunnerConfig::from(&registry.config),
            RunnerContext {
                cell: Arc::clone(&cell),
                cleanup: Arc::clone(&registry.cleanup),
                status: registry.status.clone(),
                events: Arc::clone(&registry.hooks.events),
                output_sink: registry.hooks.output_sink.clone(),
            },
        ));

        let created = cell.snapshot();
        {
            // Checked under the same lock shutdown drains with, so a session
            // is either drained by shutdown or never registered.
            let mut sessions = rwlock_write_or_recover(&registry.sessions);
            if registry.shutting_down.load(Ordering::SeqCst) {
                drop(sessions);
                info!(session_id = %id, "Discarding session created during shutdown");
                cell.finish(SessionEnd::Stopped);
                drop(notifier);
                registry.discard_unstarted(&id, &pty, &mut spawned.child);
                return Err(SessionError::ShuttingDown);
            }
            sessions.insert(
                id.clone(),
                SessionEntry {
                    cell: Arc::clone(&cell),
                    runner: Arc::clone(&runner),
                },
            );
        }

        if let Err(e) = runner.start(spawned.child, notifier) {
            error!(session_id = %id, error = %e, "Failed to start session runner");
            let resources = cell.finish(SessionEnd::Failed("Failed to start session".to_string()));
            runner.stop();
            registry.cleanup.cleanup(&id, resources);
            rwlock_write_or_recover(&registry.sessions).remove(&id);
            if registry.shutting_down.load(Ordering::SeqCst) {
                return Err(SessionError::ShuttingDown);
            }
            registry.hooks.events.error_recorded(e.code());
            return Err(e);
        }

        registry.hooks.events.session_created(&id);
        info!(
            session_id = %id,
            pid,
            command = ?created.command,
            working_dir = %created.working_dir,
            "Session created"
        );
        self.schedule_prompt(&id, pty);
        Ok(created)
    }

    pub fn get(&self, id: &SessionId) -> Result<SessionInfo, SessionError> {
        self.registry
            .entry(id)
            .map(|entry| entry.info())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Snapshot of every registered session, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = rwlock_read_or_recover(&self.registry.sessions)
            .values()
            .map(SessionEntry::info)
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn session_count(&self) -> usize {
        rwlock_read_or_recover(&self.registry.sessions).len()
    }

    pub fn active_count(&self) -> usize {
        rwlock_read_or_recover(&self.registry.sessions)
            .values()
            .filter(|entry| entry.cell.status().is_active())
            .count()
    }

    pub fn statistics(&self, id: &SessionId) -> Result<RunnerStatistics, SessionError> {
        self.registry
            .entry(id)
            .map(|entry| entry.runner.statistics())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub fn pid(&self, id: &SessionId) -> Result<Option<u32>, SessionError> {
        self.registry
            .entry(id)
            .map(|entry| entry.cell.pid())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Resizes the session's PTY. A session whose PTY is already gone is a
    /// no-op.
    pub fn resize(&self, id: &SessionId, rows: u16, cols: u16) -> Result<(), SessionError> {
        let entry = self
            .registry
            .entry(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let Some(pty) = entry.cell.pty() else {
            debug!(session_id = %id, "Resize ignored, PTY already closed");
            return Ok(());
        };
        pty.resize(rows, cols).map_err(SessionError::Resize)?;
        debug!(session_id = %id, rows, cols, "PTY resized");
        Ok(())
    }

    /// Stops an active session and schedules its eviction.
    pub fn terminate(&self, id: &SessionId) -> Result<(), SessionError> {
        self.registry.terminate(id)?;
        self.registry.schedule_eviction(id);
        Ok(())
    }

    /// Runs one sweep pass immediately.
    pub fn sweep(&self) {
        self.registry.sweep();
    }

    /// Stops the sweeper, tears down and evicts every session, then sweeps
    /// the pipes directory. Safe to call more than once.
    pub fn shutdown(&self) {
        let registry = &self.registry;
        if registry.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down session manager");

        mutex_lock_or_recover(&self.shutdown_tx).take();
        if let Some(sweeper) = mutex_lock_or_recover(&self.sweeper).take() {
            if sweeper.join().is_err() {
                warn!("Session sweeper panicked");
            }
        }

        let entries: Vec<(SessionId, SessionEntry)> =
            rwlock_write_or_recover(&registry.sessions).drain().collect();
        for (id, entry) in entries {
            registry.teardown(&id, &entry);
        }

        if let Err(e) = registry.cleanup.sweep_orphans() {
            warn!(error = %e, "Shutdown orphan sweep failed");
        }
        info!("Session manager stopped");
    }

    fn schedule_prompt(&self, id: &SessionId, pty: Arc<PtyHandle>) {
        let delay = self.registry.config.prompt_settle;
        let session_id = id.clone();
        let spawned = thread::Builder::new()
            .name(format!("prompt-{id}"))
            .spawn(move || {
                thread::sleep(delay);
                if pty.is_closed() {
                    return;
                }
                if let Err(e) = pty.write(b"\n") {
                    debug!(session_id = %session_id, error = %e, "Initial prompt write failed");
                }
            });
        if let Err(e) = spawned {
            warn!(session_id = %id, error = %e, "Failed to schedule initial prompt");
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SessionDirectory for SessionManager {
    fn session(&self, id: &SessionId) -> Option<SessionInfo> {
        self.get(id).ok()
    }

    fn resize(&self, id: &SessionId, rows: u16, cols: u16) -> Result<(), SessionError> {
        SessionManager::resize(self, id, rows, cols)
    }
}

impl SessionEntry {
    fn info(&self) -> SessionInfo {
        let mut info = self.cell.snapshot();
        let activity = self.runner.stats().last_activity();
        if activity > info.last_active_at {
            info.last_active_at = activity;
        }
        info
    }
}

impl Registry {
    fn entry(&self, id: &SessionId) -> Option<SessionEntry> {
        rwlock_read_or_recover(&self.sessions).get(id).cloned()
    }

    fn terminate(&self, id: &SessionId) -> Result<(), SessionError> {
        let entry = self
            .entry(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let resources = entry
            .cell
            .begin_stopping()
            .map_err(|status| SessionError::InvalidState {
                id: id.to_string(),
                status,
            })?;
        info!(session_id = %id, "Terminating session");
        self.status.notify(id, SessionStatus::Stopping);

        entry.runner.stop();
        self.cleanup.cleanup(id, resources);
        entry.cell.finish(SessionEnd::Stopped);

        self.status.notify(id, SessionStatus::Stopped);
        self.hooks.events.session_terminated(id);
        Ok(())
    }

    /// Tears down a process that never got a runner: nothing reaps it, so
    /// kill and wait here.
    fn discard_unstarted(
        &self,
        id: &SessionId,
        pty: &PtyHandle,
        child: &mut Box<dyn Child + Send + Sync>,
    ) {
        pty.close();
        let _ = child.kill();
        let _ = child.wait();
        self.cleanup.remove_pipes(id);
    }

    /// Shutdown path: like `terminate`, but for any status and without
    /// scheduling an eviction.
    fn teardown(&self, id: &SessionId, entry: &SessionEntry) {
        match entry.cell.begin_stopping() {
            Ok(resources) => {
                self.status.notify(id, SessionStatus::Stopping);
                entry.runner.stop();
                self.cleanup.cleanup(id, resources);
                entry.cell.finish(SessionEnd::Stopped);
                self.status.notify(id, SessionStatus::Stopped);
                self.hooks.events.session_terminated(id);
            }
            Err(_) => {
                entry.runner.stop();
                self.cleanup.remove_pipes(id);
            }
        }
    }

    fn evict(&self, id: &SessionId) {
        let removed = {
            let mut sessions = rwlock_write_or_recover(&self.sessions);
            match sessions.get(id) {
                Some(entry) if entry.cell.status().is_terminal() => sessions.remove(id),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            entry.runner.stop();
            self.cleanup.remove_pipes(id);
            debug!(session_id = %id, "Session evicted");
        }
    }

    fn schedule_eviction(self: &Arc<Self>, id: &SessionId) {
        let registry: Weak<Registry> = Arc::downgrade(self);
        let shutdown_rx = self.shutdown_rx.clone();
        let delay = self.config.eviction_delay;
        let session_id = id.clone();
        let spawned = thread::Builder::new()
            .name(format!("evict-{id}"))
            .spawn(move || {
                select! {
                    recv(shutdown_rx) -> _ => {}
                    default(delay) => {
                        if let Some(registry) = registry.upgrade() {
                            registry.evict(&session_id);
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            warn!(session_id = %id, error = %e, "Failed to schedule eviction, sweep will evict");
        }
    }

    fn sweep(self: &Arc<Self>) {
        let now = Utc::now();
        let entries: Vec<(SessionId, SessionEntry)> = rwlock_read_or_recover(&self.sessions)
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        let mut evicted = 0usize;
        let mut terminated = 0usize;
        for (id, entry) in entries {
            let status = entry.cell.status();
            if status.is_terminal() {
                let finished = entry.cell.finished_at().unwrap_or(now);
                if elapsed_at_least(finished, now, self.config.terminal_grace) {
                    self.evict(&id);
                    evicted += 1;
                }
            } else if status.is_active() {
                let last_active = entry.info().last_active_at;
                if elapsed_at_least(last_active, now, self.config.inactivity_timeout) {
                    info!(session_id = %id, %last_active, "Terminating inactive session");
                    match self.terminate(&id) {
                        Ok(()) => {
                            self.schedule_eviction(&id);
                            terminated += 1;
                        }
                        Err(e) => debug!(session_id = %id, error = %e, "Inactive session already ending"),
                    }
                }
            }
        }

        if evicted > 0 || terminated > 0 {
            info!(evicted, terminated, "Session sweep finished");
        }
    }
}

fn elapsed_at_least(since: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    (now - since)
        .to_std()
        .map(|elapsed| elapsed >= threshold)
        .unwrap_or(false)
}

fn spawn_sweeper(registry: Arc<Registry>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("session-sweeper".to_string())
        .spawn(move || {
            let interval = registry.config.sweep_interval;
            let shutdown_rx = registry.shutdown_rx.clone();
            loop {
                select! {
                    recv(shutdown_rx) -> _ => break,
                    default(interval) => registry.sweep(),
                }
            }
            debug!("Session sweeper stopped");
        })
}
