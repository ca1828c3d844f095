#![deny(clippy::all)]

mod cleanup;
mod config;
mod error;
mod events;
pub mod hub;
mod limits;
mod manager;
mod metrics;
mod output_buffer;
mod runner;
mod session;

pub use cleanup::CleanupManager;
pub use cleanup::ExitNotifier;
pub use cleanup::ProcessHandle;
pub use config::DEFAULT_PIPES_DIR;
pub use config::DaemonConfig;
pub use error::DaemonError;
pub use error::HubError;
pub use error::SessionError;
pub use events::EventSink;
pub use events::NoopEvents;
pub use events::StatusListener;
pub use events::StatusNotifier;
pub use hub::Hub;
pub use hub::HubConfig;
pub use hub::HubStats;
pub use hub::SessionDirectory;
pub use limits::DEFAULT_MAX_CONNECTIONS;
pub use limits::DEFAULT_MAX_SESSIONS;
pub use limits::LimitError;
pub use limits::ResourceGuard;
pub use limits::ResourceMonitor;
pub use limits::Unlimited;
pub use manager::ManagerHooks;
pub use manager::SessionManager;
pub use metrics::DaemonMetrics;
pub use metrics::MetricsSnapshot;
pub use output_buffer::OutputCoalescer;
pub use output_buffer::OutputSink;
pub use runner::RunnerConfig;
pub use runner::RunnerStatistics;
pub use runner::RunnerStats;
pub use runner::SessionRunner;
pub use session::CreateSessionRequest;
pub use session::SessionEnd;
pub use session::SessionId;
pub use session::SessionIdError;
pub use session::SessionInfo;
pub use session::SessionListResponse;
pub use session::SessionResources;
pub use session::SessionResponse;
pub use session::SessionStatus;

pub type Result<T> = std::result::Result<T, SessionError>;
