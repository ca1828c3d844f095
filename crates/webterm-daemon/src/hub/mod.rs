//! Live fan-out of session output to connected clients.
//!
//! All registry state lives on one actor task and changes only in response
//! to [`HubCommand`]s, so registration, input, resize and broadcast never
//! race each other. Socket I/O stays with the transport.

mod client;
mod input;
pub mod message;
mod watcher;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub use client::{CLIENT_QUEUE_CAPACITY, ClientConnection, ClientId};
pub use message::{ClientRequest, MessageType, WsMessage, parse_client_frame, validate_resize};
pub use watcher::POLL_INTERVAL;

use crate::error::{HubError, SessionError};
use crate::events::{EventSink, NoopEvents, StatusListener};
use crate::session::{SessionId, SessionInfo, SessionStatus};
use client::{ClientHandle, client_pair};
use input::InputForwarder;
use watcher::{OutputWatcher, current_len};

/// What the hub needs from the session layer.
pub trait SessionDirectory: Send + Sync {
    fn session(&self, id: &SessionId) -> Option<SessionInfo>;
    fn resize(&self, id: &SessionId, rows: u16, cols: u16) -> Result<(), SessionError>;
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub client_queue: usize,
    pub poll_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_queue: CLIENT_QUEUE_CAPACITY,
            poll_interval: POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub sessions: usize,
    pub clients: usize,
    pub watchers: usize,
    pub input_writers: usize,
}

enum HubCommand {
    Register {
        session_id: SessionId,
        reply: oneshot::Sender<Result<ClientConnection, HubError>>,
    },
    Unregister {
        client: ClientId,
    },
    Request {
        client: ClientId,
        request: ClientRequest,
    },
    Reject {
        client: ClientId,
        error: HubError,
    },
    Output {
        session_id: SessionId,
        generation: u64,
        data: String,
    },
    Status {
        session_id: SessionId,
        status: SessionStatus,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, clonable handle to the hub actor.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl Hub {
    /// Starts the actor on the current tokio runtime.
    pub fn spawn(directory: Arc<dyn SessionDirectory>, config: HubConfig) -> Self {
        Self::with_events(directory, config, Arc::new(NoopEvents))
    }

    pub fn with_events(
        directory: Arc<dyn SessionDirectory>,
        config: HubConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let state = HubState {
            directory,
            config,
            events,
            commands: commands.downgrade(),
            sessions: HashMap::new(),
            clients: HashMap::new(),
            next_client: 0,
            next_generation: 0,
            shut_down: false,
        };
        tokio::spawn(state.run(rx));
        Self { commands }
    }

    /// Attaches a new client to `session_id`. The first frames queued for it
    /// are `connected` and the session's current `status`.
    pub async fn register(&self, session_id: SessionId) -> Result<ClientConnection, HubError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Register { session_id, reply })
            .map_err(|_| HubError::ShuttingDown)?;
        rx.await.map_err(|_| HubError::ShuttingDown)?
    }

    pub fn unregister(&self, client: ClientId) {
        let _ = self.commands.send(HubCommand::Unregister { client });
    }

    /// Parses and dispatches one inbound text frame for `client`. Protocol
    /// errors are answered with an `error` frame; the connection stays up.
    pub fn handle_text(&self, client: ClientId, text: &str) {
        let command = match parse_client_frame(text) {
            Ok(request) => HubCommand::Request { client, request },
            Err(error) => HubCommand::Reject { client, error },
        };
        let _ = self.commands.send(command);
    }

    pub async fn stats(&self) -> HubStats {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(HubCommand::Stats { reply }).is_err() {
            return HubStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Closes every client and stops every watcher. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(HubCommand::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

impl StatusListener for Hub {
    fn status_changed(&self, id: &SessionId, status: SessionStatus) {
        let _ = self.commands.send(HubCommand::Status {
            session_id: id.clone(),
            status,
        });
    }
}

struct SessionClients {
    clients: HashMap<ClientId, ClientHandle>,
    watcher: OutputWatcher,
    /// Tags this watcher's deltas; output from an earlier watcher of the
    /// same session is dropped.
    generation: u64,
    input_path: PathBuf,
    input: Option<InputForwarder>,
}

struct HubState {
    directory: Arc<dyn SessionDirectory>,
    config: HubConfig,
    events: Arc<dyn EventSink>,
    commands: mpsc::WeakUnboundedSender<HubCommand>,
    sessions: HashMap<SessionId, SessionClients>,
    clients: HashMap<ClientId, SessionId>,
    next_client: u64,
    next_generation: u64,
    shut_down: bool,
}

impl HubState {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                HubCommand::Register { session_id, reply } => {
                    let result = self.register(session_id).await;
                    if let Err(Ok(connection)) = reply.send(result) {
                        // Transport went away while waiting.
                        self.unregister(connection.id);
                    }
                }
                HubCommand::Unregister { client } => self.unregister(client),
                HubCommand::Request { client, request } => self.dispatch(client, request),
                HubCommand::Reject { client, error } => self.reply_error(client, &error),
                HubCommand::Output {
                    session_id,
                    generation,
                    data,
                } => {
                    let current = self.sessions.get(&session_id).map(|entry| entry.generation);
                    if current == Some(generation) {
                        self.broadcast(&session_id, WsMessage::output(&session_id, data));
                    } else {
                        debug!(
                            session_id = %session_id,
                            generation,
                            "Dropped output from a stopped watcher"
                        );
                    }
                }
                HubCommand::Status { session_id, status } => {
                    self.broadcast(&session_id, WsMessage::status(&session_id, status));
                }
                HubCommand::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                HubCommand::Shutdown { reply } => {
                    self.shutdown();
                    let _ = reply.send(());
                }
            }
        }
        debug!("Hub stopped");
    }

    async fn register(&mut self, session_id: SessionId) -> Result<ClientConnection, HubError> {
        if self.shut_down {
            return Err(HubError::ShuttingDown);
        }
        let info = self
            .directory
            .session(&session_id)
            .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;

        if !self.sessions.contains_key(&session_id) {
            let output = info.output_path();
            let offset = current_len(&output).await;
            self.next_generation += 1;
            let generation = self.next_generation;
            let watcher = self.start_watcher(&session_id, generation, output, offset);
            self.sessions.insert(
                session_id.clone(),
                SessionClients {
                    clients: HashMap::new(),
                    watcher,
                    generation,
                    input_path: info.input_path(),
                    input: None,
                },
            );
            debug!(session_id = %session_id, offset, "Output watcher started");
        }

        self.next_client += 1;
        let id = ClientId::new(self.next_client);
        let (handle, connection) = client_pair(id, session_id.clone(), self.config.client_queue);
        handle.send(WsMessage::connected(&session_id));
        handle.send(WsMessage::status(&session_id, info.status));

        if let Some(entry) = self.sessions.get_mut(&session_id) {
            entry.clients.insert(id, handle);
        }
        self.clients.insert(id, session_id.clone());
        self.events.connection_opened(&session_id);
        info!(session_id = %session_id, client_id = %id, "Client registered");
        Ok(connection)
    }

    fn start_watcher(
        &self,
        session_id: &SessionId,
        generation: u64,
        output: PathBuf,
        offset: u64,
    ) -> OutputWatcher {
        let commands = self.commands.clone();
        let target = session_id.clone();
        OutputWatcher::spawn(
            session_id.clone(),
            output,
            offset,
            self.config.poll_interval,
            move |data| {
                if let Some(commands) = commands.upgrade() {
                    let _ = commands.send(HubCommand::Output {
                        session_id: target.clone(),
                        generation,
                        data,
                    });
                }
            },
        )
    }

    fn unregister(&mut self, client: ClientId) {
        let Some(session_id) = self.clients.remove(&client) else {
            return;
        };
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if let Some(handle) = entry.clients.remove(&client) {
            handle.close();
            self.events.connection_closed(&session_id);
            info!(session_id = %session_id, client_id = %client, "Client unregistered");
        }

        if entry.clients.is_empty() {
            if let Some(entry) = self.sessions.remove(&session_id) {
                entry.watcher.stop();
                debug!(
                    session_id = %session_id,
                    input_open = entry.input.is_some(),
                    "Last client left, watcher stopped"
                );
            }
        }
    }

    fn dispatch(&mut self, client: ClientId, request: ClientRequest) {
        let Some(session_id) = self.clients.get(&client).cloned() else {
            return;
        };
        match request {
            ClientRequest::Input(data) => {
                if data.is_empty() {
                    return;
                }
                let Some(entry) = self.sessions.get_mut(&session_id) else {
                    return;
                };
                let Some(reply_to) = entry.clients.get(&client).map(ClientHandle::outbound) else {
                    return;
                };
                let path = entry.input_path.clone();
                entry
                    .input
                    .get_or_insert_with(|| InputForwarder::spawn(session_id.clone(), path))
                    .send(data, reply_to);
            }
            ClientRequest::Resize { rows, cols } => {
                if let Err(e) = self.directory.resize(&session_id, rows, cols) {
                    warn!(session_id = %session_id, rows, cols, error = %e, "Resize failed");
                    let error = match e {
                        SessionError::NotFound(id) => HubError::SessionNotFound(id),
                        other => HubError::ResizeFailed(other.to_string()),
                    };
                    self.reply_error(client, &error);
                }
            }
            ClientRequest::Ping { timestamp } => self.reply_pong(client, &session_id, timestamp),
        }
    }

    fn reply_pong(&mut self, client: ClientId, session_id: &SessionId, echo: Option<DateTime<Utc>>) {
        self.send_to(client, WsMessage::pong(session_id, echo));
    }

    fn reply_error(&mut self, client: ClientId, error: &HubError) {
        let session_id = self.clients.get(&client).cloned();
        self.events.error_recorded(error.code());
        self.send_to(client, WsMessage::error(session_id.as_ref(), error));
    }

    fn send_to(&mut self, client: ClientId, message: WsMessage) {
        let delivered = self
            .clients
            .get(&client)
            .and_then(|session_id| self.sessions.get(session_id))
            .and_then(|entry| entry.clients.get(&client))
            .map(|handle| handle.send(message));
        if delivered == Some(false) {
            warn!(client_id = %client, "Client queue full, disconnecting");
            self.unregister(client);
        }
    }

    /// Queues `message` for every client of the session. A client whose
    /// queue is full is dropped rather than waited on.
    fn broadcast(&mut self, session_id: &SessionId, message: WsMessage) {
        let Some(entry) = self.sessions.get(session_id) else {
            return;
        };
        let stalled: Vec<ClientId> = entry
            .clients
            .values()
            .filter(|handle| !handle.send(message.clone()))
            .map(|handle| handle.id)
            .collect();
        for client in stalled {
            warn!(session_id = %session_id, client_id = %client, "Client unresponsive, disconnecting");
            self.unregister(client);
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            sessions: self.sessions.len(),
            clients: self.clients.len(),
            watchers: self
                .sessions
                .values()
                .filter(|entry| !entry.watcher.is_finished())
                .count(),
            input_writers: self
                .sessions
                .values()
                .filter(|entry| entry.input.is_some())
                .count(),
        }
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let sessions = std::mem::take(&mut self.sessions);
        let client_count = self.clients.len();
        for (session_id, entry) in sessions {
            entry.watcher.stop();
            for handle in entry.clients.values() {
                handle.close();
                self.events.connection_closed(&session_id);
            }
        }
        self.clients = HashMap::new();
        info!(clients = client_count, "Hub shut down");
    }
}
