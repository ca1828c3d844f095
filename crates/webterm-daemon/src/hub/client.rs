use std::fmt;

use tokio::sync::{mpsc, watch};

use crate::hub::message::WsMessage;
use crate::session::SessionId;

pub const CLIENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Hub-side view of a connected client.
pub(crate) struct ClientHandle {
    pub id: ClientId,
    pub session_id: SessionId,
    outbound: mpsc::Sender<WsMessage>,
    closed: watch::Sender<bool>,
}

impl ClientHandle {
    /// Queues a frame without waiting. False means the queue is full or the
    /// transport is gone.
    pub fn send(&self, message: WsMessage) -> bool {
        self.outbound.try_send(message).is_ok()
    }

    pub fn outbound(&self) -> mpsc::Sender<WsMessage> {
        self.outbound.clone()
    }

    pub fn close(&self) {
        let _ = self.closed.send(true);
    }
}

/// Transport-side half of a registration.
///
/// The transport drains `outbound` into the socket and stops once `closed`
/// flips or the queue ends.
pub struct ClientConnection {
    pub id: ClientId,
    pub session_id: SessionId,
    pub outbound: mpsc::Receiver<WsMessage>,
    pub closed: watch::Receiver<bool>,
}

pub(crate) fn client_pair(
    id: ClientId,
    session_id: SessionId,
    capacity: usize,
) -> (ClientHandle, ClientConnection) {
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let (closed_tx, closed_rx) = watch::channel(false);
    (
        ClientHandle {
            id,
            session_id: session_id.clone(),
            outbound: outbound_tx,
            closed: closed_tx,
        },
        ClientConnection {
            id,
            session_id,
            outbound: outbound_rx,
            closed: closed_rx,
        },
    )
}
