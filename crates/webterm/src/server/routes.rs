use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use serde_json::{Value, json};
use webterm_daemon::{
    CreateSessionRequest, SessionError, SessionId, SessionListResponse, SessionResponse,
};

use super::{ApiError, AppState};

fn parse_id(raw: String) -> Result<SessionId, ApiError> {
    SessionId::try_new(raw).map_err(|e| ApiError::from(SessionError::NotFound(e.message)))
}

/// Runs a blocking manager call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, SessionError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            tracing::error!(error = %e, "Blocking session task failed");
            Err(ApiError::internal())
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let hub = state.hub().stats().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_ms": state.metrics().uptime_ms(),
        "sessions": state.manager().session_count(),
        "active_sessions": state.manager().active_count(),
        "connections": state.open_connections(),
        "hub": hub,
        "metrics": state.metrics().snapshot(),
    }))
}

pub async fn create_session(
    State(state): State<AppState>,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body?;
    let manager = state.manager().clone();
    let session = blocking(move || manager.create(&request)).await?;
    Ok((StatusCode::CREATED, Json(SessionResponse { session })))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    Json(SessionListResponse::from(state.manager().list()))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let id = parse_id(id)?;
    let session = state.manager().get(&id)?;
    Ok(Json(SessionResponse { session }))
}

pub async fn terminate_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(id)?;
    let manager = state.manager().clone();
    blocking(move || manager.terminate(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Everything captured so far. Live clients only get output produced after
/// they attach, so this is how they catch up.
pub async fn session_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(id)?;
    let session = state.manager().get(&id)?;
    let bytes = match tokio::fs::read(session.output_path()).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            tracing::warn!(session_id = %id, error = %e, "Failed to read output log");
            return Err(ApiError::internal());
        }
    };
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        String::from_utf8_lossy(&bytes).into_owned(),
    ))
}
