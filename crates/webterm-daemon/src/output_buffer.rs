//! Small-buffer coalescing of PTY output for side-channel consumers.
//!
//! Runs beside the append-to-log path; nothing here is on the durability
//! path, so a slow sink only delays its own deliveries.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::debug;

use crate::session::SessionId;

pub const COALESCE_MAX_BYTES: usize = 4096;
pub const COALESCE_MAX_DELAY: Duration = Duration::from_millis(50);
const FLUSH_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Receives coalesced output chunks.
pub trait OutputSink: Send + Sync {
    fn deliver(&self, id: &SessionId, data: &[u8]);
}

enum Chunk {
    Data(Vec<u8>),
    Flush(Sender<()>),
}

/// Accumulates output and hands it to a sink once it reaches
/// [`COALESCE_MAX_BYTES`] or has waited [`COALESCE_MAX_DELAY`].
pub struct OutputCoalescer {
    tx: Sender<Chunk>,
}

impl OutputCoalescer {
    pub fn spawn(id: SessionId, sink: Arc<dyn OutputSink>) -> io::Result<Self> {
        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name(format!("coalesce-{id}"))
            .spawn(move || run(id, sink, rx))?;
        Ok(Self { tx })
    }

    pub fn push(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let _ = self.tx.send(Chunk::Data(data.to_vec()));
    }

    /// Delivers anything buffered and waits for the sink to receive it.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.tx.send(Chunk::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(FLUSH_ACK_TIMEOUT);
        }
    }
}

fn run(id: SessionId, sink: Arc<dyn OutputSink>, rx: Receiver<Chunk>) {
    let mut pending: Vec<u8> = Vec::with_capacity(COALESCE_MAX_BYTES);
    let mut deadline: Option<Instant> = None;

    let deliver = |pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            sink.deliver(&id, pending);
            pending.clear();
        }
    };

    loop {
        let next = match deadline {
            Some(at) => rx.recv_deadline(at),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match next {
            Ok(Chunk::Data(data)) => {
                pending.extend_from_slice(&data);
                if pending.len() >= COALESCE_MAX_BYTES {
                    deliver(&mut pending);
                    deadline = None;
                } else if deadline.is_none() {
                    deadline = Some(Instant::now() + COALESCE_MAX_DELAY);
                }
            }
            Ok(Chunk::Flush(ack)) => {
                deliver(&mut pending);
                deadline = None;
                let _ = ack.send(());
            }
            Err(RecvTimeoutError::Timeout) => {
                deliver(&mut pending);
                deadline = None;
            }
            Err(RecvTimeoutError::Disconnected) => {
                deliver(&mut pending);
                break;
            }
        }
    }
    debug!(session_id = %id, "Output coalescer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Vec<u8>>>);

    impl OutputSink for Collect {
        fn deliver(&self, _id: &SessionId, data: &[u8]) {
            self.0.lock().unwrap().push(data.to_vec());
        }
    }

    #[test]
    fn test_small_writes_are_merged() {
        let sink = Arc::new(Collect::default());
        let coalescer = OutputCoalescer::spawn(SessionId::generate(), sink.clone()).unwrap();
        coalescer.push(b"ab");
        coalescer.push(b"cd");
        coalescer.flush();

        assert_eq!(sink.0.lock().unwrap().as_slice(), &[b"abcd".to_vec()]);
    }

    #[test]
    fn test_delivers_after_delay_without_flush() {
        let sink = Arc::new(Collect::default());
        let coalescer = OutputCoalescer::spawn(SessionId::generate(), sink.clone()).unwrap();
        coalescer.push(b"late");
        thread::sleep(COALESCE_MAX_DELAY * 4);

        assert_eq!(sink.0.lock().unwrap().concat(), b"late".to_vec());
    }

    #[test]
    fn test_large_chunk_delivered_immediately() {
        let sink = Arc::new(Collect::default());
        let coalescer = OutputCoalescer::spawn(SessionId::generate(), sink.clone()).unwrap();
        coalescer.push(&vec![b'x'; COALESCE_MAX_BYTES]);
        coalescer.flush();

        let delivered = sink.0.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].len(), COALESCE_MAX_BYTES);
    }

    #[test]
    fn test_drop_delivers_remainder() {
        let sink = Arc::new(Collect::default());
        let coalescer = OutputCoalescer::spawn(SessionId::generate(), sink.clone()).unwrap();
        coalescer.push(b"tail");
        drop(coalescer);
        thread::sleep(Duration::from_millis(100));

        assert_eq!(sink.0.lock().unwrap().concat(), b"tail".to_vec());
    }
}
