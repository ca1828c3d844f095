use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io;
use std::io::Read;
use std::io::Write;
use std::os::fd::RawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use portable_pty::Child;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tracing::{debug, info, warn};
use webterm_common::mutex_lock_or_recover;

use crate::error::PtyError;

pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// Upper bound on one writability wait; `close` is observed between waits.
const WRITE_POLL_INTERVAL_MS: i32 = 50;

const FALLBACK_SHELLS: &[&str] = &["/bin/bash", "/bin/sh", "/bin/zsh"];
const LAST_RESORT_SHELL: &str = "/bin/sh";

/// Variables an interactive shell needs; only set when absent.
const TERMINAL_DEFAULTS: &[(&str, &str)] = &[
    ("TERM", "xterm-256color"),
    ("COLUMNS", "80"),
    ("LINES", "24"),
    ("PS1", "$ "),
    ("PS2", "> "),
    ("PS3", "#? "),
    ("PS4", "+ "),
];

/// What to run inside a new pseudo-terminal.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub shell: Option<String>,
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ResolvedCommand {
    fn interactive(shell: &str) -> Self {
        Self {
            program: shell.to_string(),
            args: vec!["-i".to_string()],
        }
    }

    /// Full argument vector including the program.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Picks the program to run: explicit command, then explicit shell, then
/// `$SHELL`, then the first fallback shell that exists, then `/bin/sh`.
pub fn resolve_command(command: &[String], shell: Option<&str>) -> ResolvedCommand {
    let env_shell = std::env::var("SHELL").ok();
    resolve_command_from(command, shell, env_shell.as_deref(), |path| {
        Path::new(path).exists()
    })
}

fn resolve_command_from(
    command: &[String],
    shell: Option<&str>,
    env_shell: Option<&str>,
    exists: impl Fn(&str) -> bool,
) -> ResolvedCommand {
    if let Some((program, args)) = command.split_first() {
        if !program.is_empty() {
            return ResolvedCommand {
                program: program.clone(),
                args: args.to_vec(),
            };
        }
    }

    if let Some(shell) = shell.filter(|s| !s.is_empty()) {
        return ResolvedCommand::interactive(shell);
    }

    if let Some(shell) = env_shell.filter(|s| !s.is_empty()) {
        return ResolvedCommand::interactive(shell);
    }

    FALLBACK_SHELLS
        .iter()
        .find(|candidate| exists(**candidate))
        .map(|shell| ResolvedCommand::interactive(shell))
        .unwrap_or_else(|| ResolvedCommand::interactive(LAST_RESORT_SHELL))
}

/// Requested directory if it is a directory, else `$HOME`, else the current
/// directory, else `/`.
pub fn resolve_working_dir(requested: Option<&Path>) -> PathBuf {
    if let Some(dir) = requested.filter(|d| !d.as_os_str().is_empty()) {
        if dir.is_dir() {
            return dir.to_path_buf();
        }
        warn!(
            working_dir = %dir.display(),
            "Requested working directory is not a directory, falling back to home"
        );
    }

    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        if home.is_dir() {
            return home;
        }
    }

    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}

/// Parent environment, overlaid with caller overrides, then topped up with
/// terminal defaults for any variable still missing.
pub fn build_environment(overrides: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut env: BTreeMap<String, String> = std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect();

    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }

    for (key, value) in TERMINAL_DEFAULTS {
        env.entry((*key).to_string())
            .or_insert_with(|| (*value).to_string());
    }

    env.into_iter().collect()
}

/// Outcome of a bounded read from the PTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyRead {
    Data(usize),
    Idle,
    Closed,
}

/// A freshly spawned process and the PTY it is attached to.
pub struct SpawnedPty {
    pub pty: PtyHandle,
    pub child: Box<dyn Child + Send + Sync>,
    pub command: ResolvedCommand,
    pub working_dir: PathBuf,
}

/// Master side of a pseudo-terminal.
///
/// Shared between the I/O bridge, the hub's resize path, and cleanup; every
/// operation after `close` reports `PtyError::Closed` instead of touching a
/// recycled descriptor.
pub struct PtyHandle {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    size: Mutex<PtySize>,
    master_fd: RawFd,
    pid: Option<u32>,
    closed: AtomicBool,
}

impl PtyHandle {
    pub fn spawn(request: &SpawnRequest) -> Result<SpawnedPty, PtyError> {
        let command = resolve_command(&request.command, request.shell.as_deref());
        let working_dir = resolve_working_dir(request.working_dir.as_deref());
        let env = build_environment(&request.env);

        let size = PtySize {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = native_pty_system()
            .openpty(size)
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        cmd.cwd(&working_dir);
        cmd.env_clear();
        for (key, value) in &env {
            cmd.env(key, value);
        }

        info!(
            program = %command.program,
            args = ?command.args,
            working_dir = %working_dir.display(),
            env_count = env.len(),
            "Spawning process under PTY"
        );

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        // The child holds its own copy; ours would keep the PTY open after exit.
        drop(pair.slave);

        let (master_fd, reader, writer) = match attach_master(pair.master.as_ref()) {
            Ok(parts) => parts,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        let pid = child.process_id();
        debug!(pid = ?pid, "PTY process started");

        let pty = PtyHandle {
            master: Mutex::new(Some(pair.master)),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            size: Mutex::new(size),
            master_fd,
            pid,
            closed: AtomicBool::new(false),
        };

        Ok(SpawnedPty {
            pty,
            child,
            command,
            working_dir,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current window size as `(rows, cols)`.
    pub fn size(&self) -> (u16, u16) {
        let size = mutex_lock_or_recover(&self.size);
        (size.rows, size.cols)
    }

    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if data.is_empty() {
            return Ok(());
        }

        let mut guard = mutex_lock_or_recover(&self.writer);
        let writer = guard.as_mut().ok_or(PtyError::Closed)?;
        let mut offset = 0;
        while offset < data.len() {
            if self.is_closed() {
                return Err(PtyError::Closed);
            }
            match writer.write(&data[offset..]) {
                Ok(0) => {
                    return Err(PtyError::Write(
                        "write returned 0 bytes, PTY closed".to_string(),
                    ));
                }
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_writable(self.master_fd, WRITE_POLL_INTERVAL_MS)?;
                }
                Err(e) => return Err(PtyError::Write(e.to_string())),
            }
        }
        writer.flush().map_err(|e| PtyError::Write(e.to_string()))
    }

    /// Waits up to `timeout_ms` for output and reads whatever is available.
    ///
    /// `Closed` means the child side hung up (or `close` was called); the
    /// caller should treat it as end of stream.
    pub fn try_read(&self, buf: &mut [u8], timeout_ms: i32) -> Result<PtyRead, PtyError> {
        if buf.is_empty() {
            return Ok(PtyRead::Idle);
        }

        let mut guard = mutex_lock_or_recover(&self.reader);
        let Some(reader) = guard.as_mut() else {
            return Ok(PtyRead::Closed);
        };

        match wait_readable(self.master_fd, timeout_ms)? {
            Readiness::Idle => return Ok(PtyRead::Idle),
            Readiness::Hangup => return Ok(PtyRead::Closed),
            Readiness::Readable => {}
        }

        loop {
            match reader.read(buf) {
                Ok(0) => return Ok(PtyRead::Closed),
                Ok(n) => return Ok(PtyRead::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(PtyRead::Idle),
                // Linux reports EIO on the master once the slave side is gone.
                Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(PtyRead::Closed),
                Err(e) => return Err(PtyError::Read(e.to_string())),
            }
        }
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let guard = mutex_lock_or_recover(&self.master);
        let master = guard.as_ref().ok_or(PtyError::Closed)?;
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        master
            .resize(size)
            .map_err(|e| PtyError::Resize(e.to_string()))?;
        *mutex_lock_or_recover(&self.size) = size;
        Ok(())
    }

    /// Releases the master descriptor and its clones. Idempotent.
    ///
    /// The flag is raised before any lock is taken: a writer stuck on a full
    /// input queue sees it within one poll interval and lets go of its lock.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Reader first: an in-flight poll holds it and must finish before the
        // master fd it polls goes away.
        mutex_lock_or_recover(&self.reader).take();
        mutex_lock_or_recover(&self.writer).take();
        mutex_lock_or_recover(&self.master).take();
        debug!(pid = ?self.pid, "PTY closed");
    }
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle")
            .field("pid", &self.pid)
            .field("size", &self.size())
            .field("closed", &self.is_closed())
            .finish()
    }
}

type MasterParts = (RawFd, Box<dyn Read + Send>, Box<dyn Write + Send>);

fn attach_master(master: &(dyn MasterPty + Send)) -> Result<MasterParts, PtyError> {
    let master_fd = master
        .as_raw_fd()
        .ok_or_else(|| PtyError::Open("Failed to get master fd".to_string()))?;

    if let Err(e) = set_raw_mode(master_fd) {
        warn!(error = %e, "Failed to put PTY in raw mode, continuing anyway");
    }

    let reader = master
        .try_clone_reader()
        .map_err(|e| PtyError::Open(e.to_string()))?;

    set_non_blocking(master_fd)?;

    let writer = master
        .take_writer()
        .map_err(|e| PtyError::Open(e.to_string()))?;

    Ok((master_fd, reader, writer))
}

fn set_raw_mode(fd: RawFd) -> io::Result<()> {
    // SAFETY: termios is plain data; tcgetattr fully initialises it on success.
    let mut termios: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(fd, &mut termios) } != 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { libc::cfmakeraw(&mut termios) };
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_non_blocking(fd: RawFd) -> Result<(), PtyError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(PtyError::Open(io::Error::last_os_error().to_string()));
    }

    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }

    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(PtyError::Open(io::Error::last_os_error().to_string()));
    }

    Ok(())
}

enum Readiness {
    Readable,
    Idle,
    Hangup,
}

fn wait_readable(fd: RawFd, timeout_ms: i32) -> Result<Readiness, PtyError> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Readiness::Idle);
        }
        return Err(PtyError::Read(err.to_string()));
    }
    if result == 0 {
        return Ok(Readiness::Idle);
    }

    if pollfd.revents & libc::POLLIN != 0 {
        return Ok(Readiness::Readable);
    }

    if pollfd.revents & libc::POLLHUP != 0 {
        return Ok(Readiness::Hangup);
    }

    if pollfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        return Err(PtyError::Read("poll error on PTY".to_string()));
    }

    Ok(Readiness::Idle)
}

/// Waits up to `timeout_ms` for room in the PTY input queue. A timeout is
/// not an error; the caller retries the write and rechecks for `close`.
fn wait_writable(fd: RawFd, timeout_ms: i32) -> Result<(), PtyError> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };

    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(());
        }
        return Err(PtyError::Write(err.to_string()));
    }
    if result == 0 {
        return Ok(());
    }

    if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(PtyError::Write("poll error on PTY".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_explicit_command_wins() {
        let resolved = resolve_command_from(
            &strings(&["/usr/bin/top", "-b"]),
            Some("/bin/zsh"),
            Some("/bin/bash"),
            |_| true,
        );
        assert_eq!(resolved.program, "/usr/bin/top");
        assert_eq!(resolved.args, strings(&["-b"]));
    }

    #[test]
    fn test_explicit_shell_is_interactive() {
        let resolved = resolve_command_from(&[], Some("/bin/zsh"), Some("/bin/bash"), |_| true);
        assert_eq!(resolved.argv(), strings(&["/bin/zsh", "-i"]));
    }

    #[test]
    fn test_empty_shell_falls_through_to_env() {
        let resolved = resolve_command_from(&[], Some(""), Some("/bin/fish"), |_| true);
        assert_eq!(resolved.program, "/bin/fish");
    }

    #[test]
    fn test_fallback_list_skips_missing_shells() {
        let resolved = resolve_command_from(&[], None, None, |path| path == "/bin/sh");
        assert_eq!(resolved.argv(), strings(&["/bin/sh", "-i"]));
    }

    #[test]
    fn test_last_resort_shell() {
        let resolved = resolve_command_from(&[], None, None, |_| false);
        assert_eq!(resolved.program, LAST_RESORT_SHELL);
    }

    #[test]
    fn test_working_dir_uses_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_working_dir(Some(dir.path())), dir.path());
    }

    #[test]
    fn test_working_dir_rejects_regular_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_ne!(resolve_working_dir(Some(file.path())), file.path());
    }

    #[test]
    fn test_environment_keeps_caller_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("TERM".to_string(), "vt100".to_string());
        overrides.insert("WEBTERM_TEST_VAR".to_string(), "1".to_string());

        let env: HashMap<_, _> = build_environment(&overrides).into_iter().collect();
        assert_eq!(env.get("TERM").map(String::as_str), Some("vt100"));
        assert_eq!(env.get("WEBTERM_TEST_VAR").map(String::as_str), Some("1"));
        assert!(env.contains_key("LINES"));
        assert!(env.contains_key("PS2"));
    }

    #[test]
    fn test_spawn_captures_command_output() {
        let request = SpawnRequest {
            command: strings(&["/bin/echo", "hello-from-pty"]),
            ..Default::default()
        };
        let mut spawned = PtyHandle::spawn(&request).unwrap();
        assert_eq!(spawned.pty.size(), (DEFAULT_ROWS, DEFAULT_COLS));

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut output = Vec::new();
        let mut buf = [0u8; 1024];
        while Instant::now() < deadline {
            match spawned.pty.try_read(&mut buf, 50).unwrap() {
                PtyRead::Data(n) => output.extend_from_slice(&buf[..n]),
                PtyRead::Idle => continue,
                PtyRead::Closed => break,
            }
        }

        assert!(String::from_utf8_lossy(&output).contains("hello-from-pty"));
        let _ = spawned.child.wait();
        spawned.pty.close();
    }

    #[test]
    fn test_operations_after_close_report_closed() {
        let request = SpawnRequest {
            command: strings(&["/bin/sleep", "5"]),
            ..Default::default()
        };
        let mut spawned = PtyHandle::spawn(&request).unwrap();
        spawned.pty.resize(40, 120).unwrap();
        assert_eq!(spawned.pty.size(), (40, 120));

        spawned.pty.close();
        spawned.pty.close();
        assert!(spawned.pty.is_closed());
        assert!(matches!(spawned.pty.write(b"x"), Err(PtyError::Closed)));
        assert!(matches!(spawned.pty.resize(10, 10), Err(PtyError::Closed)));
        let mut buf = [0u8; 8];
        assert_eq!(spawned.pty.try_read(&mut buf, 10).unwrap(), PtyRead::Closed);

        let _ = spawned.child.kill();
        let _ = spawned.child.wait();
    }

    #[test]
    fn test_close_unblocks_writer_on_full_input_queue() {
        let request = SpawnRequest {
            command: strings(&["/bin/sleep", "60"]),
            ..Default::default()
        };
        let SpawnedPty { pty, mut child, .. } = PtyHandle::spawn(&request).unwrap();
        let pty = std::sync::Arc::new(pty);

        let (tx, rx) = std::sync::mpsc::channel();
        let writer_pty = std::sync::Arc::clone(&pty);
        std::thread::spawn(move || {
            let _ = tx.send(writer_pty.write(&vec![b'x'; 1024 * 1024]));
        });

        // sleep never reads stdin, so the writer parks on POLLOUT.
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

        let started = Instant::now();
        pty.close();
        assert!(started.elapsed() < Duration::from_secs(2));
        let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(result, Err(PtyError::Closed)));

        let _ = child.kill();
        let _ = child.wait();
    }
}
