#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use webterm_daemon::{
    CreateSessionRequest, DaemonConfig, Hub, HubConfig, SessionManager, StatusListener,
};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestHarness {
    pub dir: TempDir,
    pub manager: Arc<SessionManager>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    pub fn with_config(adjust: impl FnOnce(DaemonConfig) -> DaemonConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = DaemonConfig::from_env()
            .with_pipes_dir(dir.path().join("pipes"))
            .with_sweep_interval(Duration::from_secs(3600))
            .with_eviction_delay(Duration::from_millis(300))
            .with_termination_timeout(Duration::from_secs(2))
            .with_stop_timeout(Duration::from_secs(2));
        let manager = SessionManager::new(adjust(config)).expect("manager");
        Self {
            dir,
            manager: Arc::new(manager),
        }
    }

    /// Hub wired to this manager, with status transitions fanned out.
    pub fn hub(&self) -> Hub {
        let hub = Hub::spawn(
            self.manager.clone(),
            HubConfig {
                poll_interval: Duration::from_millis(20),
                ..HubConfig::default()
            },
        );
        let listener: Arc<dyn StatusListener> = Arc::new(hub.clone());
        self.manager.set_status_listener(listener);
        hub
    }

    pub fn pipe_files(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("pipes"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

pub fn sh_request() -> CreateSessionRequest {
    CreateSessionRequest {
        shell: Some("/bin/sh".to_string()),
        ..Default::default()
    }
}

pub fn command_request(argv: &[&str]) -> CreateSessionRequest {
    CreateSessionRequest {
        command: argv.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

pub fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}
