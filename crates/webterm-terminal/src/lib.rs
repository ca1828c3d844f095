#![deny(clippy::all)]

pub mod error;
mod pipes;
mod pty;

pub use error::PipeError;
pub use error::PtyError;
pub use pipes::FifoRead;
pub use pipes::FifoReader;
pub use pipes::FifoWriter;
pub use pipes::PipeManager;
pub use pipes::SessionPipes;
pub use pipes::open_output_log;
pub use pty::DEFAULT_COLS;
pub use pty::DEFAULT_ROWS;
pub use pty::PtyHandle;
pub use pty::PtyRead;
pub use pty::ResolvedCommand;
pub use pty::SpawnRequest;
pub use pty::SpawnedPty;
pub use pty::build_environment;
pub use pty::resolve_command;
pub use pty::resolve_working_dir;

pub type Result<T> = std::result::Result<T, PtyError>;
