use std::path::PathBuf;

use clap::Parser;
use webterm_daemon::DaemonConfig;

use crate::config::{DEFAULT_HOST, DEFAULT_LOG_LEVEL, DEFAULT_PORT, ServerConfig};

const LONG_ABOUT: &str = r#"webterm runs shell sessions under real pseudo-terminals and serves them
to browsers over HTTP and WebSocket.

ENDPOINTS:
    GET    /health                      server status and counters
    POST   /api/sessions                create a session
    GET    /api/sessions                list sessions
    GET    /api/sessions/:id            one session
    DELETE /api/sessions/:id            terminate a session
    GET    /api/sessions/:id/output     captured output so far
    GET    /ws?session=<id>             live terminal channel

ENVIRONMENT:
    RUST_LOG=<filter>                   override --log-level with a full filter"#;

#[derive(Debug, Parser)]
#[command(name = "webterm")]
#[command(author, version)]
#[command(about = "Serve real shell sessions to browsers over HTTP and WebSocket")]
#[command(long_about = LONG_ABOUT)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "WEBTERM_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, env = "WEBTERM_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory for per-session FIFOs and output logs
    #[arg(long, env = "WEBTERM_PIPES_DIR")]
    pub pipes_dir: Option<PathBuf>,

    /// Default log level when RUST_LOG is not set
    #[arg(long, env = "WEBTERM_LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "WEBTERM_LOG")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::from_env()
            .with_host(self.host.clone())
            .with_port(self.port)
            .with_log_level(self.log_level.clone())
            .with_log_file(self.log_file.clone())
    }

    pub fn daemon_config(&self) -> DaemonConfig {
        let config = DaemonConfig::from_env();
        match &self.pipes_dir {
            Some(dir) => config.with_pipes_dir(dir.clone()),
            None => config,
        }
    }
}
