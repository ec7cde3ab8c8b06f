//! Per-session handle: state, counters, process and background task.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cr_core::{Error, SessionId, SessionState, StreamMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::demux::Frame;
use crate::diagnostics::DiagnosticTail;

/// Something a frame session tells its subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Frame(Frame),
    /// Informational text.
    Status(String),
    /// Failure text, possibly with diagnostic lines appended.
    Error(String),
    /// No further events follow.
    End,
}

/// Serializable snapshot of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub mode: StreamMode,
    pub state: SessionState,
    /// Source URI with any password redacted.
    pub source: String,
    pub created_at: DateTime<Utc>,
    /// Frames delivered (frame mode) or distinct segments staged (segmented).
    pub artifact_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Why a session failed, kept so the start path can report it.
#[derive(Debug, Clone)]
pub(crate) struct Failure {
    pub message: String,
    pub diagnostics: String,
    pub start_timeout: Option<Duration>,
}

impl Failure {
    pub(crate) fn from_error(err: &Error) -> Self {
        let start_timeout = match err {
            Error::StreamStartTimeout { secs, .. } => Some(Duration::from_secs(*secs)),
            _ => None,
        };
        Self {
            message: err.to_string(),
            diagnostics: err.diagnostics().unwrap_or_default().to_string(),
            start_timeout,
        }
    }

    pub(crate) fn to_error(&self) -> Error {
        match self.start_timeout {
            Some(t) => Error::StreamStartTimeout {
                secs: t.as_secs(),
                diagnostics: self.diagnostics.clone(),
            },
            None => Error::stream_failure(self.message.clone(), self.diagnostics.clone()),
        }
    }
}

/// Mode-specific parts of a handle.
#[derive(Debug)]
pub(crate) enum ModeState {
    Frames {
        events: broadcast::Sender<SessionEvent>,
        /// Created with the channel so the first subscriber misses nothing.
        first_rx: Mutex<Option<broadcast::Receiver<SessionEvent>>>,
    },
    Segmented {
        work_dir: PathBuf,
        log_path: PathBuf,
    },
}

/// Shared handle to one running session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    source: String,
    created_at: DateTime<Utc>,
    state: watch::Sender<SessionState>,
    artifacts: AtomicU64,
    failure: Mutex<Option<Failure>>,
    diagnostics: DiagnosticTail,
    pub(crate) child: tokio::sync::Mutex<Option<Child>>,
    pub(crate) cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    pub(crate) mode: ModeState,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        source: String,
        child: Child,
        diagnostics: DiagnosticTail,
        mode: ModeState,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            id,
            source,
            created_at: Utc::now(),
            state,
            artifacts: AtomicU64::new(0),
            failure: Mutex::new(None),
            diagnostics,
            child: tokio::sync::Mutex::new(Some(child)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            stopping: AtomicBool::new(false),
            mode,
        }
    }

    pub(crate) fn frame_mode(capacity: usize) -> ModeState {
        let (events, first_rx) = broadcast::channel(capacity.max(1));
        ModeState::Frames {
            events,
            first_rx: Mutex::new(Some(first_rx)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn mode(&self) -> StreamMode {
        match self.mode {
            ModeState::Frames { .. } => StreamMode::FrameStream,
            ModeState::Segmented { .. } => StreamMode::Segmented,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Move to `next` if the state machine allows it. Returns whether the
    /// state changed.
    pub fn transition(&self, next: SessionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(session_id = %self.id, state = %next, "Session state changed");
        }
        changed
    }

    /// Record `err`, publish it, and move to `Failed`.
    pub(crate) fn fail(&self, err: &Error) {
        let failure = Failure::from_error(err);
        if !failure.diagnostics.is_empty() {
            self.diagnostics.replace(&failure.diagnostics);
        }
        let text = match err.diagnostics() {
            Some(diag) => format!("{err}\n{diag}"),
            None => err.to_string(),
        };
        tracing::warn!(session_id = %self.id, "Session failed: {err}");
        *self.failure.lock() = Some(failure);
        self.transition(SessionState::Failed);
        self.publish(SessionEvent::Error(text));
    }

    pub(crate) fn failure(&self) -> Option<Failure> {
        self.failure.lock().clone()
    }

    pub fn artifact_count(&self) -> u64 {
        self.artifacts.load(Ordering::Relaxed)
    }

    pub(crate) fn set_artifact_count(&self, n: u64) {
        self.artifacts.store(n, Ordering::Relaxed);
    }

    pub(crate) fn increment_artifacts(&self) -> u64 {
        self.artifacts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last lines of transcoder error output.
    pub fn diagnostics(&self) -> String {
        self.diagnostics.snapshot()
    }

    pub(crate) fn diagnostic_tail(&self) -> &DiagnosticTail {
        &self.diagnostics
    }

    /// Publish to frame subscribers. A no-op for segmented sessions and when
    /// nobody is listening.
    pub(crate) fn publish(&self, event: SessionEvent) {
        if let ModeState::Frames { events, .. } = &self.mode {
            let _ = events.send(event);
        }
    }

    /// Subscribe to frame events. The first call gets a receiver that has
    /// buffered everything since the session started; later calls join live.
    /// Returns `None` for segmented sessions.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<SessionEvent>> {
        match &self.mode {
            ModeState::Frames { events, first_rx } => {
                Some(first_rx.lock().take().unwrap_or_else(|| events.subscribe()))
            }
            ModeState::Segmented { .. } => None,
        }
    }

    pub(crate) fn set_task(&self, task: JoinHandle<()>) {
        *self.task.lock() = Some(task);
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }

    #[cfg(test)]
    /// Whether the background task is still alive.
    pub(crate) fn task_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Claim teardown. Only the first caller gets `true`.
    pub(crate) fn begin_stop(&self) -> bool {
        !self.stopping.swap(true, Ordering::AcqRel)
    }

    /// Reap the process if it has exited, returning its status text.
    pub(crate) async fn try_reap(&self) -> Option<String> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                *guard = None;
                Some(status.to_string())
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(session_id = %self.id, "Failed to poll transcoder: {e}");
                None
            }
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            mode: self.mode(),
            state: self.state(),
            source: self.source.clone(),
            created_at: self.created_at,
            artifact_count: self.artifact_count(),
            error: self.failure.lock().as_ref().map(|f| f.message.clone()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sleeper() -> Child {
        tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    fn frame_handle() -> SessionHandle {
        SessionHandle::new(
            SessionId::new(),
            "rtsp://cam.example/live".into(),
            sleeper(),
            DiagnosticTail::new(5),
            SessionHandle::frame_mode(8),
        )
    }

    #[tokio::test]
    async fn transitions_are_monotonic() {
        let handle = frame_handle();
        assert_eq!(handle.state(), SessionState::Starting);
        assert!(handle.transition(SessionState::Streaming));
        assert!(!handle.transition(SessionState::Streaming));
        assert!(handle.transition(SessionState::Stopped));
        assert!(!handle.transition(SessionState::Failed));
        assert_eq!(handle.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn first_subscriber_sees_early_events() {
        let handle = frame_handle();
        handle.publish(SessionEvent::Status("hello".into()));

        let mut first = handle.subscribe().unwrap();
        let mut late = handle.subscribe().unwrap();
        handle.publish(SessionEvent::End);

        assert!(matches!(first.recv().await.unwrap(), SessionEvent::Status(s) if s == "hello"));
        assert!(matches!(first.recv().await.unwrap(), SessionEvent::End));
        assert!(matches!(late.recv().await.unwrap(), SessionEvent::End));
    }

    #[tokio::test]
    async fn failure_is_recorded() {
        let handle = frame_handle();
        let mut rx = handle.subscribe().unwrap();
        handle.fail(&Error::stream_failure("No frames received", "Connection refused"));

        assert_eq!(handle.state(), SessionState::Failed);
        assert_eq!(handle.diagnostics(), "Connection refused");
        assert_eq!(
            handle.info().error.as_deref(),
            Some("Stream failure: No frames received")
        );
        match rx.recv().await.unwrap() {
            SessionEvent::Error(text) => assert!(text.contains("Connection refused")),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            handle.failure().unwrap().to_error(),
            Error::StreamFailure { .. }
        ));
    }

    #[tokio::test]
    async fn stop_is_claimed_once() {
        let handle = frame_handle();
        assert!(handle.begin_stop());
        assert!(!handle.begin_stop());
    }

    #[tokio::test]
    async fn segmented_handles_have_no_events() {
        let handle = SessionHandle::new(
            SessionId::new(),
            "rtsp://cam.example/live".into(),
            sleeper(),
            DiagnosticTail::new(5),
            ModeState::Segmented {
                work_dir: PathBuf::from("/tmp/x"),
                log_path: PathBuf::from("/tmp/x/ffmpeg.log"),
            },
        );
        assert_eq!(handle.mode(), StreamMode::Segmented);
        assert!(handle.subscribe().is_none());
        assert!(handle.try_reap().await.is_none());
    }
}
