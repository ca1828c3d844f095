use std::env;
use std::path::PathBuf;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Listener and logging configuration for the HTTP/WebSocket server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Filter used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Log to this file instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: non_empty_var("WEBTERM_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: env::var("WEBTERM_PORT")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_PORT),
            log_level: non_empty_var("WEBTERM_LOG_LEVEL")
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            log_file: non_empty_var("WEBTERM_LOG").map(PathBuf::from),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_log_file(mut self, path: Option<PathBuf>) -> Self {
        self.log_file = path;
        self
    }

    /// `host:port`, suitable for binding. Port 0 asks the OS for a free port.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_override() {
        let config = ServerConfig::from_env()
            .with_host("127.0.0.1")
            .with_port(0)
            .with_log_level("debug")
            .with_log_file(Some(PathBuf::from("/tmp/webterm.log")));
        assert_eq!(config.bind_addr(), "127.0.0.1:0");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/webterm.log")));
    }
}
