//! Per-session I/O bridge.
//!
//! A runner owns four threads: the PTY→log pump, the FIFO→PTY pump, a
//! process monitor and an error aggregator. Pumps never touch the session
//! record themselves; fatal pump failures go through the aggregator so the
//! failure path and the exit path serialize on the session cell.

use std::any::Any;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded, select};
use portable_pty::Child;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use webterm_common::{error_codes, mutex_lock_or_recover};
use webterm_terminal::{
    FifoRead, FifoReader, PtyError, PtyHandle, PtyRead, SessionPipes, open_output_log,
};

use crate::cleanup::{CleanupManager, ExitNotifier};
use crate::config::DaemonConfig;
use crate::error::SessionError;
use crate::events::{EventSink, StatusNotifier};
use crate::output_buffer::{OutputCoalescer, OutputSink};
use crate::session::{SessionCell, SessionEnd, SessionId, SessionStatus};

const POLL_INTERVAL_MS: i32 = 50;
const ERROR_CHANNEL_CAPACITY: usize = 10;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub stop_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub read_buffer_bytes: usize,
}

impl From<&DaemonConfig> for RunnerConfig {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            stop_timeout: config.stop_timeout,
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay,
            read_buffer_bytes: config.read_buffer_bytes,
        }
    }
}

/// Byte and activity counters updated from the pump threads.
pub struct RunnerStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    last_activity_ms: AtomicI64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerStatistics {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub last_activity: DateTime<Utc>,
}

impl Default for RunnerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerStats {
    pub fn new() -> Self {
        Self {
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn record_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_write(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }

    pub fn snapshot(&self) -> RunnerStatistics {
        RunnerStatistics {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            last_activity: self.last_activity(),
        }
    }
}

/// Collaborators a runner reports into.
#[derive(Clone)]
pub(crate) struct RunnerContext {
    pub cell: Arc<SessionCell>,
    pub cleanup: Arc<CleanupManager>,
    pub status: StatusNotifier,
    pub events: Arc<dyn EventSink>,
    pub output_sink: Option<Arc<dyn OutputSink>>,
}

#[derive(Debug)]
struct PumpFailure {
    pump: &'static str,
    detail: String,
    panicked: bool,
}

impl PumpFailure {
    /// Message stored on the session record; the detail only goes to the log.
    fn public_message(&self) -> String {
        if self.panicked {
            format!("{} bridge crashed", self.pump)
        } else {
            format!("{} bridge failed", self.pump)
        }
    }
}

/// Owns the child and reports its exit by dropping the notifier.
///
/// If dropped before the child was reaped, kills and reaps it.
struct Reaper {
    child: Box<dyn Child + Send + Sync>,
    notifier: Option<ExitNotifier>,
}

impl Reaper {
    fn wait(&mut self) -> io::Result<portable_pty::ExitStatus> {
        let status = self.child.wait();
        self.notifier.take();
        status
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if self.notifier.is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
            self.notifier.take();
        }
    }
}

pub struct SessionRunner {
    id: SessionId,
    pty: Arc<PtyHandle>,
    pipes: SessionPipes,
    config: RunnerConfig,
    ctx: RunnerContext,
    stats: RunnerStats,
    coalescer: Mutex<Option<Arc<OutputCoalescer>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    drained_tx: Mutex<Option<Sender<()>>>,
    drained_rx: Receiver<()>,
    err_tx: Sender<PumpFailure>,
    err_rx: Receiver<PumpFailure>,
    stopped: AtomicBool,
}

impl SessionRunner {
    pub(crate) fn new(
        id: SessionId,
        pty: Arc<PtyHandle>,
        pipes: SessionPipes,
        config: RunnerConfig,
        ctx: RunnerContext,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded(0);
        let (done_tx, done_rx) = bounded(0);
        let (drained_tx, drained_rx) = bounded(0);
        let (err_tx, err_rx) = bounded(ERROR_CHANNEL_CAPACITY);
        Self {
            id,
            pty,
            pipes,
            config,
            ctx,
            stats: RunnerStats::new(),
            coalescer: Mutex::new(None),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            drained_tx: Mutex::new(Some(drained_tx)),
            drained_rx,
            err_tx,
            err_rx,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn stats(&self) -> &RunnerStats {
        &self.stats
    }

    pub fn statistics(&self) -> RunnerStatistics {
        self.stats.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Starts the monitor, the error aggregator and both pumps, then marks
    /// the session running.
    pub(crate) fn start(
        self: &Arc<Self>,
        child: Box<dyn Child + Send + Sync>,
        notifier: ExitNotifier,
    ) -> Result<(), SessionError> {
        let reaper = Reaper {
            child,
            notifier: Some(notifier),
        };
        let done = mutex_lock_or_recover(&self.done_tx)
            .clone()
            .ok_or_else(|| SessionError::StartFailed("runner already stopped".to_string()))?;
        let drained = mutex_lock_or_recover(&self.drained_tx).take();

        if let Some(sink) = &self.ctx.output_sink {
            let coalescer = OutputCoalescer::spawn(self.id.clone(), Arc::clone(sink))
                .map_err(|e| SessionError::StartFailed(e.to_string()))?;
            *mutex_lock_or_recover(&self.coalescer) = Some(Arc::new(coalescer));
        }

        self.spawn_task("monitor", None, move |runner| runner.monitor(reaper))?;
        self.spawn_task("errors", Some(done.clone()), |runner| {
            runner.aggregate_errors()
        })?;
        self.spawn_task("pty-out", Some(done.clone()), move |runner| {
            let _drained = drained;
            runner.supervise("output", Self::pump_output);
        })?;
        self.spawn_task("pipe-in", Some(done), |runner| {
            runner.supervise("input", Self::pump_input)
        })?;

        if self.ctx.cell.mark_running() {
            info!(session_id = %self.id, pid = ?self.pty.pid(), "Session running");
            self.ctx.status.notify(&self.id, SessionStatus::Running);
        }
        Ok(())
    }

    /// Signals every task and waits for the pumps and aggregator to exit,
    /// bounded by the stop timeout. Only the first call does anything.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(coalescer) = mutex_lock_or_recover(&self.coalescer).take() {
            coalescer.flush();
        }
        mutex_lock_or_recover(&self.stop_tx).take();
        mutex_lock_or_recover(&self.done_tx).take();

        let deadline = Instant::now() + self.config.stop_timeout;
        loop {
            match self.done_rx.recv_deadline(deadline) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!(session_id = %self.id, "Runner stopped");
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        session_id = %self.id,
                        timeout_ms = self.config.stop_timeout.as_millis() as u64,
                        "Runner tasks did not exit before stop timeout"
                    );
                    return;
                }
            }
        }
    }

    fn stop_requested(&self) -> bool {
        matches!(self.stop_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn spawn_task<F>(
        self: &Arc<Self>,
        role: &str,
        done: Option<Sender<()>>,
        task: F,
    ) -> Result<(), SessionError>
    where
        F: FnOnce(&SessionRunner) + Send + 'static,
    {
        let runner = Arc::clone(self);
        thread::Builder::new()
            .name(format!("{role}-{}", self.id))
            .spawn(move || {
                let _done = done;
                task(&runner);
            })
            .map(|_| ())
            .map_err(|e| {
                error!(session_id = %self.id, role, error = %e, "Failed to spawn runner thread");
                SessionError::StartFailed(e.to_string())
            })
    }

    /// Runs `pump` until it finishes cleanly or stop is requested. Errors are
    /// retried with linear backoff up to the retry cap; a panic is reported
    /// at once.
    fn supervise(&self, pump_name: &'static str, mut pump: impl FnMut(&Self) -> Result<(), String>) {
        let mut retries: u32 = 0;
        loop {
            if self.stop_requested() {
                return;
            }

            let failure = match panic::catch_unwind(AssertUnwindSafe(|| pump(self))) {
                Ok(Ok(())) => {
                    debug!(session_id = %self.id, pump = pump_name, "Pump finished");
                    return;
                }
                Ok(Err(detail)) => PumpFailure {
                    pump: pump_name,
                    detail,
                    panicked: false,
                },
                Err(payload) => PumpFailure {
                    pump: pump_name,
                    detail: panic_message(payload.as_ref()),
                    panicked: true,
                },
            };

            if self.stop_requested() {
                return;
            }

            retries += 1;
            if failure.panicked || retries > self.config.max_retries {
                self.report(failure);
                return;
            }

            let delay = self.config.retry_base_delay * retries;
            warn!(
                session_id = %self.id,
                pump = pump_name,
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                error = %failure.detail,
                "Pump failed, retrying"
            );
            if let Err(RecvTimeoutError::Disconnected) = self.stop_rx.recv_timeout(delay) {
                return;
            }
        }
    }

    fn report(&self, failure: PumpFailure) {
        error!(
            session_id = %self.id,
            pump = failure.pump,
            panicked = failure.panicked,
            error = %failure.detail,
            "Pump gave up"
        );
        if self.err_tx.try_send(failure).is_err() {
            warn!(session_id = %self.id, "Runner error channel full, dropping failure");
        }
    }

    fn pump_output(&self) -> Result<(), String> {
        let mut log = open_output_log(&self.pipes.output).map_err(|e| e.to_string())?;
        let coalescer = mutex_lock_or_recover(&self.coalescer).clone();
        let mut buf = vec![0u8; self.config.read_buffer_bytes];

        loop {
            if self.stop_requested() {
                return Ok(());
            }
            match self.pty.try_read(&mut buf, POLL_INTERVAL_MS) {
                Ok(PtyRead::Data(n)) => {
                    let chunk = &buf[..n];
                    log.write_all(chunk)
                        .and_then(|()| log.sync_data())
                        .map_err(|e| format!("append to output log: {e}"))?;
                    self.stats.record_read(n);
                    if let Some(coalescer) = &coalescer {
                        coalescer.push(chunk);
                    }
                }
                Ok(PtyRead::Idle) => {}
                Ok(PtyRead::Closed) | Err(PtyError::Closed) => return Ok(()),
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    fn pump_input(&self) -> Result<(), String> {
        let mut reader = FifoReader::open(&self.pipes.input).map_err(|e| e.to_string())?;
        let mut buf = vec![0u8; self.config.read_buffer_bytes];

        loop {
            if self.stop_requested() {
                return Ok(());
            }
            match reader
                .read_timeout(&mut buf, POLL_INTERVAL_MS)
                .map_err(|e| e.to_string())?
            {
                FifoRead::Data(n) => match self.pty.write(&buf[..n]) {
                    Ok(()) => self.stats.record_write(n),
                    Err(PtyError::Closed) => return Ok(()),
                    Err(e) => return Err(e.to_string()),
                },
                FifoRead::Idle => {}
                // Every writer left; reopen so the next one can connect.
                FifoRead::WriterClosed => {
                    reader = FifoReader::open(&self.pipes.input).map_err(|e| e.to_string())?;
                }
            }
        }
    }

    fn monitor(&self, mut reaper: Reaper) {
        let end = match reaper.wait() {
            Ok(status) if status.success() => SessionEnd::Stopped,
            Ok(status) => {
                SessionEnd::Failed(format!("Process exited with code {}", status.exit_code()))
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Failed to wait for process");
                SessionEnd::Failed("Process exited abnormally".to_string())
            }
        };
        debug!(session_id = %self.id, end = ?end, "Process exited");

        // Give the output pump a moment to copy what the process wrote last.
        let _ = self.drained_rx.recv_timeout(DRAIN_TIMEOUT);

        if let Some(resources) = self.ctx.cell.finish_if_active(end.clone()) {
            if let SessionEnd::Failed(message) = &end {
                self.ctx.events.session_failed(&self.id, message);
            }
            info!(session_id = %self.id, status = %self.ctx.cell.status(), "Session ended");
            self.ctx.status.notify(&self.id, self.ctx.cell.status());
            if let Some(resources) = resources {
                self.ctx.cleanup.release(&self.id, resources);
            }
        }
        self.stop();
    }

    fn aggregate_errors(&self) {
        loop {
            select! {
                recv(self.err_rx) -> failure => {
                    if let Ok(failure) = failure {
                        self.fail(failure);
                    }
                }
                recv(self.stop_rx) -> _ => return,
            }
        }
    }

    fn fail(&self, failure: PumpFailure) {
        self.ctx.events.error_recorded(error_codes::PTY_IO_FAILED);
        let message = failure.public_message();
        if let Some(resources) = self.ctx.cell.finish_if_active(SessionEnd::Failed(message.clone())) {
            self.ctx.events.session_failed(&self.id, &message);
            self.ctx.status.notify(&self.id, SessionStatus::Error);
            if let Some(resources) = resources {
                self.ctx.cleanup.release(&self.id, resources);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::ProcessHandle;
    use crate::events::NoopEvents;
    use crate::session::test_support::sample_info;
    use crate::session::SessionResources;
    use std::sync::atomic::AtomicUsize;
    use webterm_terminal::{FifoWriter, PipeManager, SpawnRequest};

    struct Harness {
        runner: Arc<SessionRunner>,
        cell: Arc<SessionCell>,
        pipes: SessionPipes,
        _dir: tempfile::TempDir,
    }

    fn config() -> RunnerConfig {
        RunnerConfig {
            stop_timeout: Duration::from_secs(2),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(5),
            read_buffer_bytes: 1024,
        }
    }

    fn launch(command: &[&str]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let manager = PipeManager::new(dir.path());
        let id = SessionId::generate();
        let pipes = manager.create(id.as_str()).unwrap();

        let request = SpawnRequest {
            command: command.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let spawned = PtyHandle::spawn(&request).unwrap();
        let pid = spawned.pty.pid().unwrap();
        let pty = Arc::new(spawned.pty);
        let (process, notifier) = ProcessHandle::new(pid);

        let mut info = sample_info(SessionStatus::Starting);
        info.id = id.clone();
        let cell = Arc::new(SessionCell::new(
            info,
            SessionResources {
                pty: Arc::clone(&pty),
                process,
            },
        ));
        let ctx = RunnerContext {
            cell: Arc::clone(&cell),
            cleanup: Arc::new(CleanupManager::new(manager, Duration::from_secs(1))),
            status: StatusNotifier::default(),
            events: Arc::new(NoopEvents),
            output_sink: None,
        };
        let runner = Arc::new(SessionRunner::new(id, pty, pipes.clone(), config(), ctx));
        runner.start(spawned.child, notifier).unwrap();

        Harness {
            runner,
            cell,
            pipes,
            _dir: dir,
        }
    }

    fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    fn log_contains(pipes: &SessionPipes, needle: &str) -> bool {
        std::fs::read_to_string(&pipes.output)
            .map(|s| s.contains(needle))
            .unwrap_or(false)
    }

    #[test]
    fn test_output_reaches_log_and_exit_stops_session() {
        let h = launch(&["/bin/sh", "-c", "echo bridged-output"]);
        assert!(wait_for(|| h.cell.status() == SessionStatus::Stopped));
        assert!(log_contains(&h.pipes, "bridged-output"));
        assert!(h.cell.pty().is_none());
        assert!(h.runner.statistics().bytes_read > 0);
        assert!(wait_for(|| h.runner.is_stopped()));
    }

    #[test]
    fn test_abnormal_exit_marks_error() {
        let h = launch(&["/bin/sh", "-c", "exit 3"]);
        assert!(wait_for(|| h.cell.status() == SessionStatus::Error));
        let message = h.cell.snapshot().error_message.unwrap();
        assert!(message.contains('3'));
        assert!(h.cell.pid().is_none());
    }

    #[test]
    fn test_input_round_trip_through_fifo() {
        let h = launch(&["/bin/cat"]);
        assert_eq!(h.cell.status(), SessionStatus::Running);

        let mut writer = None;
        assert!(wait_for(|| {
            writer = FifoWriter::open(&h.pipes.input).ok();
            writer.is_some()
        }));
        writer.unwrap().write_all(b"round-trip\n").unwrap();

        assert!(wait_for(|| log_contains(&h.pipes, "round-trip")));
        assert!(h.runner.statistics().bytes_written >= 11);

        h.runner.stop();
        h.runner.stop();
        assert!(h.runner.is_stopped());
    }

    #[test]
    fn test_fifo_reopens_after_writer_leaves() {
        let h = launch(&["/bin/cat"]);
        for word in ["first-writer", "second-writer"] {
            let mut writer = None;
            assert!(wait_for(|| {
                writer = FifoWriter::open(&h.pipes.input).ok();
                writer.is_some()
            }));
            writer.unwrap().write_all(format!("{word}\n").as_bytes()).unwrap();
            assert!(wait_for(|| log_contains(&h.pipes, word)));
        }
        h.runner.stop();
    }

    #[test]
    fn test_supervisor_escalates_after_retry_cap() {
        let h = launch(&["/bin/cat"]);
        let attempts = AtomicUsize::new(0);
        h.runner.supervise("test", |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err("always failing".to_string())
        });
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(wait_for(|| h.cell.status() == SessionStatus::Error));
        assert_eq!(
            h.cell.snapshot().error_message.as_deref(),
            Some("test bridge failed")
        );
        assert!(h.cell.pty().is_none());
    }

    #[test]
    fn test_supervisor_does_not_retry_panics() {
        let h = launch(&["/bin/cat"]);
        let attempts = AtomicUsize::new(0);
        h.runner.supervise("test", |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            panic!("pump exploded");
        });
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(wait_for(|| h.cell.status() == SessionStatus::Error));
    }

    #[test]
    fn test_supervisor_returns_immediately_after_stop() {
        let h = launch(&["/bin/cat"]);
        h.runner.stop();
        let attempts = AtomicUsize::new(0);
        h.runner.supervise("test", |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stats_track_activity() {
        let stats = RunnerStats::new();
        let before = stats.last_activity();
        thread::sleep(Duration::from_millis(5));
        stats.record_read(10);
        stats.record_write(4);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_read, 10);
        assert_eq!(snapshot.bytes_written, 4);
        assert!(snapshot.last_activity > before);
    }
}
