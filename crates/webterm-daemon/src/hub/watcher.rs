//! Follows a session's output log and emits appended text.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::session::SessionId;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_DELTA_BYTES: u64 = 1024 * 1024;

/// Polls one output log on a fixed interval and hands each delta to
/// `deliver`, in log order.
pub struct OutputWatcher {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl OutputWatcher {
    /// Starts following `path` from byte `offset`.
    pub fn spawn<F>(
        session_id: SessionId,
        path: PathBuf,
        offset: u64,
        interval: Duration,
        deliver: F,
    ) -> Self
    where
        F: Fn(String) + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(follow(session_id, path, offset, interval, stop_rx, deliver));
        Self { stop, task }
    }

    pub fn stop(self) {
        let _ = self.stop.send(true);
        drop(self.task);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Current length of the log, or zero when it does not exist yet.
pub async fn current_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn follow<F>(
    session_id: SessionId,
    path: PathBuf,
    mut offset: u64,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
    deliver: F,
) where
    F: Fn(String),
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut carry: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match read_delta(&path, &mut offset, &mut carry).await {
                    Ok(Some(text)) => deliver(text),
                    Ok(None) => {}
                    Err(e) => warn!(session_id = %session_id, error = %e, "Output log read failed"),
                }
            }
        }
    }
    debug!(session_id = %session_id, "Output watcher stopped");
}

/// Reads whatever was appended since `offset`. A truncated log restarts from
/// the beginning; a missing log is not an error.
async fn read_delta(path: &Path, offset: &mut u64, carry: &mut Vec<u8>) -> io::Result<Option<String>> {
    let len = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if len < *offset {
        *offset = 0;
        carry.clear();
    }
    if len == *offset {
        return Ok(None);
    }

    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(*offset)).await?;
    let want = (len - *offset).min(MAX_DELTA_BYTES);
    let mut buf = Vec::with_capacity(want as usize);
    file.take(want).read_to_end(&mut buf).await?;
    if buf.is_empty() {
        return Ok(None);
    }
    *offset += buf.len() as u64;

    carry.extend_from_slice(&buf);
    let boundary = utf8_boundary(carry);
    if boundary == 0 {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&carry[..boundary]).into_owned();
    carry.drain(..boundary);
    Ok(Some(text))
}

/// Length of the prefix of `bytes` that does not end inside a multi-byte
/// UTF-8 sequence.
fn utf8_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { len - back } else { len };
    }
    len
}
