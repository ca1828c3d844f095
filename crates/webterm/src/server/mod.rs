//! HTTP and WebSocket surface over the session manager and hub.

mod api_error;
mod routes;
mod transport;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::{info, warn};
use webterm_daemon::{
    DaemonConfig, DaemonError, DaemonMetrics, Hub, HubConfig, LimitError, ManagerHooks,
    ResourceGuard, ResourceMonitor, SessionManager, StatusListener,
};

pub use api_error::ApiError;
pub use transport::{MAX_FRAME_BYTES, PING_PERIOD, PONG_WAIT, WRITE_WAIT};

use crate::config::ServerConfig;

/// Shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    manager: Arc<SessionManager>,
    hub: Hub,
    metrics: Arc<DaemonMetrics>,
    limits: Arc<dyn ResourceGuard>,
    connections: Arc<AtomicUsize>,
}

impl AppState {
    /// Builds the manager and hub and wires status changes from one to the
    /// other. Must run inside a tokio runtime.
    pub fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        let metrics = Arc::new(DaemonMetrics::new());
        let limits: Arc<dyn ResourceGuard> = Arc::new(ResourceMonitor::new(
            config.max_sessions,
            config.max_connections,
        ));
        let hooks = ManagerHooks::default()
            .with_events(metrics.clone())
            .with_limits(limits.clone());
        let manager = Arc::new(SessionManager::with_hooks(config, hooks)?);
        let hub = Hub::with_events(manager.clone(), HubConfig::default(), metrics.clone());

        let listener: Arc<dyn StatusListener> = Arc::new(hub.clone());
        manager.set_status_listener(listener);

        Ok(Self {
            manager,
            hub,
            metrics,
            limits,
            connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn metrics(&self) -> &DaemonMetrics {
        &self.metrics
    }

    pub fn open_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn acquire_connection(&self) -> Result<ConnectionSlot, LimitError> {
        let open = self.connections.fetch_add(1, Ordering::SeqCst);
        let slot = ConnectionSlot(self.connections.clone());
        self.limits.check_connection(open)?;
        Ok(slot)
    }

    /// Closes all clients, then terminates all sessions.
    pub async fn shutdown(&self) {
        self.hub.shutdown().await;
        self.manager.clear_status_listener();
        let manager = self.manager.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || manager.shutdown()).await {
            warn!(error = %e, "Session manager shutdown task failed");
        }
    }
}

/// One admitted live connection; releases its slot when dropped.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/api/sessions",
            get(routes::list_sessions).post(routes::create_session),
        )
        .route(
            "/api/sessions/:id",
            get(routes::get_session).delete(routes::terminate_session),
        )
        .route("/api/sessions/:id/output", get(routes::session_output))
        .route("/ws", get(transport::upgrade))
        .with_state(state)
}

/// A bound listener plus the state it serves.
pub struct Server {
    listener: TcpListener,
    state: AppState,
}

impl Server {
    pub async fn bind(config: &ServerConfig, state: AppState) -> Result<Self, DaemonError> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| DaemonError::Bind {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DaemonError> {
        self.listener
            .local_addr()
            .map_err(|e| DaemonError::Runtime(e.to_string()))
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serves until `shutdown` resolves, then closes clients and sessions.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server { listener, state } = self;
        let addr = listener
            .local_addr()
            .map_err(|e| DaemonError::Runtime(e.to_string()))?;
        info!(addr = %addr, "webterm listening");

        let hub = state.hub.clone();
        let result = axum::serve(listener, build_router(state.clone()))
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("Shutting down live connections");
                hub.shutdown().await;
            })
            .await
            .map_err(|e| DaemonError::Runtime(e.to_string()));

        state.shutdown().await;
        info!(
            sessions_created = state.metrics.sessions_created(),
            "webterm stopped"
        );
        result
    }
}
