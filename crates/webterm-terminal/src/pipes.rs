use std::ffi::CString;
use std::fs;
use std::fs::DirBuilder;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::error::PipeError;

const DIR_MODE: u32 = 0o755;
const FIFO_MODE: libc::mode_t = 0o622;
const OUTPUT_MODE: u32 = 0o644;

const INPUT_SUFFIX: &str = "input";
const OUTPUT_SUFFIX: &str = "output";

/// Filesystem paths owned by one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPipes {
    pub input: PathBuf,
    pub output: PathBuf,
}

/// Allocates and destroys per-session FIFOs and output logs under one directory.
///
/// Knows nothing about which sessions exist; callers hand it identifiers.
#[derive(Debug, Clone)]
pub struct PipeManager {
    dir: PathBuf,
}

impl PipeManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<(), PipeError> {
        DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&self.dir)
            .map_err(|e| PipeError::create_dir(&self.dir, e))
    }

    pub fn paths_for(&self, session_id: &str) -> SessionPipes {
        SessionPipes {
            input: self.dir.join(format!("{session_id}.{INPUT_SUFFIX}")),
            output: self.dir.join(format!("{session_id}.{OUTPUT_SUFFIX}")),
        }
    }

    /// Creates `{id}.input` as a FIFO and `{id}.output` as an empty log.
    ///
    /// All or nothing: if the log cannot be created the FIFO is removed again.
    pub fn create(&self, session_id: &str) -> Result<SessionPipes, PipeError> {
        self.ensure_dir()?;
        let pipes = self.paths_for(session_id);

        make_fifo(&pipes.input).map_err(|e| PipeError::create_fifo(&pipes.input, e))?;

        let created = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(OUTPUT_MODE)
            .open(&pipes.output);
        if let Err(e) = created {
            if let Err(rm) = remove_if_present(&pipes.input) {
                warn!(path = %pipes.input.display(), error = %rm, "Failed to roll back input FIFO");
            }
            return Err(PipeError::create_output(&pipes.output, e));
        }

        debug!(
            session_id = session_id,
            input = %pipes.input.display(),
            output = %pipes.output.display(),
            "Created session pipes"
        );
        Ok(pipes)
    }

    /// Removes both paths. Paths that are already gone count as removed.
    pub fn remove(&self, pipes: &SessionPipes) -> Result<(), PipeError> {
        let failures: Vec<String> = [&pipes.input, &pipes.output]
            .into_iter()
            .filter_map(|path| {
                remove_if_present(path)
                    .err()
                    .map(|e| format!("{}: {}", path.display(), e))
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PipeError::Remove(failures.join("; ")))
        }
    }

    /// Deletes every entry in the pipes directory. A missing directory is
    /// already clean. Returns how many entries were removed.
    pub fn sweep_orphans(&self) -> Result<usize, PipeError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(PipeError::Remove(format!("{}: {}", self.dir.display(), e))),
        };

        let mut removed = 0;
        let mut failures = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    failures.push(e.to_string());
                    continue;
                }
            };
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => failures.push(format!("{}: {}", path.display(), e)),
            }
        }

        if removed > 0 {
            info!(dir = %self.dir.display(), removed, "Removed orphaned pipe files");
        }

        if failures.is_empty() {
            Ok(removed)
        } else {
            Err(PipeError::Remove(failures.join("; ")))
        }
    }
}

fn make_fifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    if unsafe { libc::mkfifo(c_path.as_ptr(), FIFO_MODE) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Opens a session's output log for appending.
pub fn open_output_log(path: &Path) -> Result<File, PipeError> {
    OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| PipeError::io(path, e))
}

/// Outcome of a bounded read from the input FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoRead {
    Data(usize),
    Idle,
    /// Every writer has closed its end.
    WriterClosed,
}

/// Read side of an input FIFO.
///
/// Opened non-blocking so the open itself never waits for a writer; readiness
/// is awaited with a bounded poll so the caller can check for stop requests.
#[derive(Debug)]
pub struct FifoReader {
    file: File,
    path: PathBuf,
}

impl FifoReader {
    pub fn open(path: &Path) -> Result<Self, PipeError> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| PipeError::io(path, e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn read_timeout(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<FifoRead, PipeError> {
        let mut pollfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(FifoRead::Idle);
            }
            return Err(PipeError::io(&self.path, err));
        }
        if result == 0 {
            return Ok(FifoRead::Idle);
        }

        if pollfd.revents & (libc::POLLIN | libc::POLLHUP) == 0 {
            return Err(PipeError::io(
                &self.path,
                io::Error::other("poll error on FIFO"),
            ));
        }

        loop {
            match self.file.read(buf) {
                Ok(0) => return Ok(FifoRead::WriterClosed),
                Ok(n) => return Ok(FifoRead::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(FifoRead::Idle),
                Err(e) => return Err(PipeError::io(&self.path, e)),
            }
        }
    }
}

/// Write side of an input FIFO.
#[derive(Debug)]
pub struct FifoWriter {
    file: File,
    path: PathBuf,
}

impl FifoWriter {
    /// Connects to a FIFO that already has a reader.
    ///
    /// The open is non-blocking so a FIFO nobody reads fails immediately
    /// (ENXIO) instead of parking the caller; writes afterwards block normally.
    pub fn open(path: &Path) -> Result<Self, PipeError> {
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| PipeError::io(path, e))?;

        let fd = file.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0
            || unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0
        {
            return Err(PipeError::io(path, io::Error::last_os_error()));
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<(), PipeError> {
        self.file
            .write_all(data)
            .map_err(|e| PipeError::io(&self.path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
