#![deny(clippy::all)]

pub mod cli;
pub mod config;
pub mod server;
mod signal_handler;
pub mod telemetry;

use tokio::sync::watch;
use webterm_daemon::DaemonError;

pub use cli::Cli;
pub use config::ServerConfig;
pub use server::{ApiError, AppState, Server, build_router};
pub use signal_handler::{SignalHandler, wait_for_shutdown};
pub use telemetry::{TelemetryGuard, init_tracing};

/// Runs the server until SIGINT or SIGTERM, then shuts down gracefully.
pub fn run(cli: &Cli) -> Result<(), DaemonError> {
    let server_config = cli.server_config();
    let daemon_config = cli.daemon_config();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("webterm-worker")
        .build()
        .map_err(|e| DaemonError::Runtime(e.to_string()))?;

    runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _signals = SignalHandler::setup(shutdown_tx)?;

        let state = AppState::new(daemon_config)?;
        let server = Server::bind(&server_config, state).await?;
        server.serve(wait_for_shutdown(shutdown_rx)).await
    })
}
