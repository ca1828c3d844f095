//! Stable error codes shared by the HTTP surface and the live channel.
//!
//! Codes are strings so they can be surfaced verbatim in JSON error bodies
//! and `error` frames.

// Session lifecycle
pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
pub const SESSION_CREATE_FAILED: &str = "SESSION_CREATE_FAILED";
pub const SESSION_TERMINATE_FAILED: &str = "SESSION_TERMINATE_FAILED";
pub const SESSION_INVALID_STATE: &str = "SESSION_INVALID_STATE";

// Resource allocation
pub const PTY_CREATE_FAILED: &str = "PTY_CREATE_FAILED";
pub const PTY_IO_FAILED: &str = "PTY_IO_FAILED";
pub const PIPE_CREATE_FAILED: &str = "PIPE_CREATE_FAILED";
pub const PIPE_IO_FAILED: &str = "PIPE_IO_FAILED";

// Limits
pub const SESSION_LIMIT: &str = "SESSION_LIMIT";
pub const CONNECTION_LIMIT: &str = "CONNECTION_LIMIT";

// Live channel
pub const WEBSOCKET_MESSAGE_INVALID: &str = "WEBSOCKET_MESSAGE_INVALID";

// Request/response surface
pub const INVALID_REQUEST: &str = "INVALID_REQUEST";

// Process-level
pub const CONFIG_INVALID: &str = "CONFIG_INVALID";
pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";

/// Error category for programmatic handling by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Resource not found (session)
    NotFound,
    /// Invalid input parameters or frames
    InvalidInput,
    /// Operation conflicts with the current lifecycle state
    Conflict,
    /// Resource exhausted or temporarily unavailable
    Busy,
    /// Internal server error
    Internal,
    /// External dependency failure (PTY, filesystem, process)
    External,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Busy => "busy",
            ErrorCategory::Internal => "internal",
            ErrorCategory::External => "external",
        }
    }

    /// HTTP status code a request/response surface should use for this category.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCategory::NotFound => 404,
            ErrorCategory::InvalidInput => 400,
            ErrorCategory::Conflict => 409,
            ErrorCategory::Busy => 503,
            ErrorCategory::Internal | ErrorCategory::External => 500,
        }
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_found" => Ok(ErrorCategory::NotFound),
            "invalid_input" => Ok(ErrorCategory::InvalidInput),
            "conflict" => Ok(ErrorCategory::Conflict),
            "busy" => Ok(ErrorCategory::Busy),
            "internal" => Ok(ErrorCategory::Internal),
            "external" => Ok(ErrorCategory::External),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returns whether an error code represents a transient condition.
///
/// Limit refusals and I/O hiccups may clear up on their own; everything else
/// needs a different request.
pub fn is_retryable(code: &str) -> bool {
    matches!(
        code,
        SESSION_LIMIT | CONNECTION_LIMIT | SERVICE_UNAVAILABLE | PTY_IO_FAILED | PIPE_IO_FAILED
    )
}

/// Returns the error category for a given error code.
pub fn category_for_code(code: &str) -> ErrorCategory {
    match code {
        SESSION_NOT_FOUND => ErrorCategory::NotFound,
        WEBSOCKET_MESSAGE_INVALID | INVALID_REQUEST | CONFIG_INVALID => ErrorCategory::InvalidInput,
        SESSION_INVALID_STATE => ErrorCategory::Conflict,
        SESSION_LIMIT | CONNECTION_LIMIT | SERVICE_UNAVAILABLE => ErrorCategory::Busy,
        SESSION_CREATE_FAILED
        | SESSION_TERMINATE_FAILED
        | PTY_CREATE_FAILED
        | PTY_IO_FAILED
        | PIPE_CREATE_FAILED
        | PIPE_IO_FAILED => ErrorCategory::External,
        _ => ErrorCategory::Internal,
    }
}
