use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::{DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_SESSIONS};

pub const DEFAULT_PIPES_DIR: &str = "/tmp/webterm-pipes";
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_TERMINAL_GRACE_SECS: u64 = 300;
const DEFAULT_EVICTION_DELAY_SECS: u64 = 30;

const PROMPT_SETTLE: Duration = Duration::from_millis(100);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const TERMINATION_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const READ_BUFFER_BYTES: usize = 8192;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_or(key, default))
}

/// Session manager configuration.
///
/// Durations and limits read from `WEBTERM_*` variables fall back to their
/// defaults when unset or unparsable.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub pipes_dir: PathBuf,
    pub sweep_interval: Duration,
    pub inactivity_timeout: Duration,
    pub terminal_grace: Duration,
    pub eviction_delay: Duration,
    pub max_sessions: usize,
    pub max_connections: usize,
    pub prompt_settle: Duration,
    pub stop_timeout: Duration,
    pub termination_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub read_buffer_bytes: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self {
            pipes_dir: env::var_os("WEBTERM_PIPES_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PIPES_DIR)),
            sweep_interval: env_secs("WEBTERM_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS),
            inactivity_timeout: env_secs(
                "WEBTERM_INACTIVITY_TIMEOUT_SECS",
                DEFAULT_INACTIVITY_TIMEOUT_SECS,
            ),
            terminal_grace: env_secs("WEBTERM_TERMINAL_GRACE_SECS", DEFAULT_TERMINAL_GRACE_SECS),
            eviction_delay: env_secs("WEBTERM_EVICTION_DELAY_SECS", DEFAULT_EVICTION_DELAY_SECS),
            max_sessions: env_or("WEBTERM_MAX_SESSIONS", DEFAULT_MAX_SESSIONS),
            max_connections: env_or("WEBTERM_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS),
            prompt_settle: PROMPT_SETTLE,
            stop_timeout: STOP_TIMEOUT,
            termination_timeout: TERMINATION_TIMEOUT,
            max_retries: MAX_RETRIES,
            retry_base_delay: RETRY_BASE_DELAY,
            read_buffer_bytes: READ_BUFFER_BYTES,
        }
    }

    pub fn with_pipes_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pipes_dir = dir.into();
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn with_terminal_grace(mut self, grace: Duration) -> Self {
        self.terminal_grace = grace;
        self
    }

    pub fn with_eviction_delay(mut self, delay: Duration) -> Self {
        self.eviction_delay = delay;
        self
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_termination_timeout(mut self, timeout: Duration) -> Self {
        self.termination_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }
}
