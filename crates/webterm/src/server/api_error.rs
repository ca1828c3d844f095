//! JSON error bodies for the REST surface.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error};
use webterm_common::ErrorCategory;
use webterm_common::error_codes;
use webterm_daemon::{HubError, LimitError, SessionError};

/// A failed request: status, stable code, safe message and retry hint.
///
/// Renders as `{"error": {"code", "message", "retryable", "timestamp"}}`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retryable: bool,
}

impl ApiError {
    pub fn new(category: ErrorCategory, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::from_u16(category.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code,
            message: message.into(),
            retryable: error_codes::is_retryable(code),
        }
    }

    pub fn internal() -> Self {
        Self::new(
            ErrorCategory::Internal,
            error_codes::INTERNAL_SERVER_ERROR,
            "Internal server error",
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let category = err.category();
        if matches!(category, ErrorCategory::Internal | ErrorCategory::External) {
            error!(code = err.code(), context = %err.context(), error = %err, "Session operation failed");
        } else {
            debug!(code = err.code(), error = %err, "Session request refused");
        }
        Self {
            retryable: err.is_retryable(),
            ..Self::new(category, err.code(), err.to_string())
        }
    }
}

impl From<LimitError> for ApiError {
    fn from(err: LimitError) -> Self {
        Self::new(ErrorCategory::Busy, err.code(), err.to_string())
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        Self::new(err.category(), err.code(), err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        debug!(error = %rejection.body_text(), "Rejected request body");
        Self::new(
            ErrorCategory::InvalidInput,
            error_codes::INVALID_REQUEST,
            "Invalid request body",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "retryable": self.retryable,
                "timestamp": Utc::now().to_rfc3339(),
            }
        });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webterm_daemon::SessionStatus;

    #[test]
    fn test_session_errors_map_to_status() {
        let not_found = ApiError::from(SessionError::NotFound("abc".into()));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        assert_eq!(not_found.code(), error_codes::SESSION_NOT_FOUND);
        assert!(!not_found.is_retryable());

        let conflict = ApiError::from(SessionError::InvalidState {
            id: "abc".into(),
            status: SessionStatus::Stopped,
        });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let limited = ApiError::from(SessionError::Limit(LimitError::Sessions {
            current: 100,
            max: 100,
        }));
        assert_eq!(limited.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(limited.code(), error_codes::SESSION_LIMIT);
        assert!(limited.is_retryable());
    }

    #[test]
    fn test_internal_error_is_generic() {
        let err = ApiError::internal();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message(), "Internal server error");
    }

    #[test]
    fn test_connection_limit_is_busy() {
        let err = ApiError::from(LimitError::Connections {
            current: 500,
            max: 500,
        });
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), error_codes::CONNECTION_LIMIT);
    }
}
