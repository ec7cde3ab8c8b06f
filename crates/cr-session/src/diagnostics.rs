//! Bounded tail of transcoder error output.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use cr_core::SessionId;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Keeps the last `capacity` lines of diagnostic text.
#[derive(Debug, Clone)]
pub struct DiagnosticTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl DiagnosticTail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Record one line, evicting the oldest when full. Blank lines are ignored.
    pub fn push(&self, line: impl Into<String>) {
        let line = line.into();
        if line.trim().is_empty() {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Replace the contents with the last lines of `text`.
    pub fn replace(&self, text: &str) {
        self.lines.lock().clear();
        for line in text.lines() {
            self.push(line);
        }
    }

    /// The retained lines joined by newlines.
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

/// Drain `stderr` line by line into `tail` until the pipe closes.
///
/// Lines are decoded lossily and re-emitted at debug level under the
/// session id.
pub fn spawn_drain<R>(stderr: R, tail: DiagnosticTail, session_id: SessionId) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim_end();
                    tracing::debug!(session_id = %session_id, "transcoder: {line}");
                    tail.push(line);
                }
                Err(e) => {
                    tracing::debug!(session_id = %session_id, "stderr read failed: {e}");
                    break;
                }
            }
        }
    })
}

/// Return the last `lines` lines of a log file, or an empty string if it
/// cannot be read.
pub async fn read_log_tail(path: &Path, lines: usize) -> String {
    let Ok(bytes) = tokio::fs::read(path).await else {
        return String::new();
    };
    let tail = DiagnosticTail::new(lines);
    for line in String::from_utf8_lossy(&bytes).lines() {
        tail.push(line);
    }
    tail.snapshot()
}
