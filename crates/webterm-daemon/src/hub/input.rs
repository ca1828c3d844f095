//! Ordered delivery of client input into a session's FIFO.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use webterm_terminal::{FifoWriter, PipeError};

use crate::error::HubError;
use crate::hub::message::WsMessage;
use crate::session::SessionId;

struct InputJob {
    data: Vec<u8>,
    reply_to: mpsc::Sender<WsMessage>,
}

/// Owns the session's cached FIFO writer on a dedicated task.
///
/// The writer is opened on the first job and closed when the forwarder is
/// dropped.
pub(crate) struct InputForwarder {
    jobs: mpsc::UnboundedSender<InputJob>,
}

impl InputForwarder {
    pub fn spawn(session_id: SessionId, path: PathBuf) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(session_id, path, rx));
        Self { jobs }
    }

    pub fn send(&self, data: String, reply_to: mpsc::Sender<WsMessage>) {
        let _ = self.jobs.send(InputJob {
            data: data.into_bytes(),
            reply_to,
        });
    }
}

async fn forward(session_id: SessionId, path: PathBuf, mut jobs: mpsc::UnboundedReceiver<InputJob>) {
    let mut writer: Option<FifoWriter> = None;

    while let Some(job) = jobs.recv().await {
        let cached = writer.take();
        let target = path.clone();
        let data = job.data;
        let result = tokio::task::spawn_blocking(move || -> Result<FifoWriter, PipeError> {
            let mut writer = match cached {
                Some(writer) => writer,
                None => FifoWriter::open(&target)?,
            };
            writer.write_all(&data)?;
            Ok(writer)
        })
        .await;

        let reason = match result {
            Ok(Ok(open)) => {
                writer = Some(open);
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        warn!(session_id = %session_id, error = %reason, "Failed to deliver input");
        let frame = WsMessage::error(Some(&session_id), &HubError::InputUnavailable(reason));
        let _ = job.reply_to.try_send(frame);
    }

    debug!(session_id = %session_id, open = writer.is_some(), "Input forwarder closed");
}
