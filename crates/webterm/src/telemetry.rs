//! Subscriber setup for the `webterm` binary.

use std::io::IsTerminal;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::{DEFAULT_LOG_LEVEL, ServerConfig};

/// Keeps the non-blocking log writer alive; drop it last.
#[derive(Debug)]
pub struct TelemetryGuard {
    _guard: Option<WorkerGuard>,
}

impl TelemetryGuard {
    fn disabled() -> Self {
        Self { _guard: None }
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured
/// level; logs go to `config.log_file` when set, stderr otherwise.
pub fn init_tracing(config: &ServerConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level_filter(&config.log_level));

    let (writer, guard, ansi) = match config.log_file.as_deref() {
        Some(path) => match file_writer(path) {
            Ok((writer, guard)) => (writer, Some(guard), false),
            Err(err) => {
                eprintln!(
                    "Warning: failed to open log file {}: {}",
                    path.display(),
                    err
                );
                stderr_writer()
            }
        },
        None => stderr_writer(),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_ansi(ansi)
        .with_writer(writer);

    if subscriber.try_init().is_err() {
        return TelemetryGuard::disabled();
    }

    TelemetryGuard { _guard: guard }
}

/// Filter for the configured level; an unparsable level falls back to
/// the default rather than silencing everything.
fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| {
        eprintln!("Warning: invalid log level {level:?}, using {DEFAULT_LOG_LEVEL}");
        EnvFilter::new(DEFAULT_LOG_LEVEL)
    })
}

fn file_writer(path: &Path) -> std::io::Result<(BoxMakeWriter, WorkerGuard)> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    Ok((BoxMakeWriter::new(non_blocking), guard))
}

fn stderr_writer() -> (BoxMakeWriter, Option<WorkerGuard>, bool) {
    (
        BoxMakeWriter::new(std::io::stderr),
        None,
        std::io::stderr().is_terminal(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_accepts_directives() {
        assert_eq!(level_filter("debug").to_string(), "debug");
        assert_eq!(
            level_filter("webterm_daemon=trace").to_string(),
            "webterm_daemon=trace"
        );
    }

    #[test]
    fn test_level_filter_falls_back_on_garbage() {
        assert_eq!(level_filter("webterm=loud").to_string(), DEFAULT_LOG_LEVEL);
    }

    #[test]
    fn test_file_writer_creates_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webterm.log");
        let (_writer, _guard) = file_writer(&path).unwrap();
        assert!(path.exists());

        let missing = dir.path().join("no-such-dir").join("webterm.log");
        assert!(file_writer(&missing).is_err());
    }
}
