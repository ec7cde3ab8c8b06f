//! Session start/stop orchestration.
//!
//! [`SessionManager`] ties the launcher, the consumers (frame demuxer or
//! segment watcher) and the registry together. A session is registered as
//! soon as its process exists and stays registered until `stop`, even after
//! the stream ends on its own, so its diagnostics remain readable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cr_av::{FrameProcess, SegmentOutput, SourceUri, TranscoderLauncher};
use cr_core::config::{Config, FrameConfig, LifecycleConfig, SegmentConfig};
use cr_core::{Credentials, Error, Result, SessionId, SessionState, StreamMode, StreamParams};
use futures::StreamExt;
use serde::Serialize;
use tokio::process::Child;

use crate::demux::{frame_stream, Frame, FrameDemuxer};
use crate::diagnostics::{read_log_tail, spawn_drain, DiagnosticTail};
use crate::registry::SessionRegistry;
use crate::session::{ModeState, SessionEvent, SessionHandle, SessionInfo};
use crate::storage::{object_key, session_prefix, ObjectStore};
use crate::watcher::SegmentWatcher;

/// Log file written next to a segmented session's output.
const LOG_FILE_NAME: &str = "ffmpeg.log";

/// How long to wait for stderr to drain after stdout closes.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Parameters for [`SessionManager::start`].
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub source: String,
    pub credentials: Credentials,
    pub params: StreamParams,
}

/// Result of a successful [`SessionManager::stop`].
#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub session_id: SessionId,
    /// State the session was in when teardown finished.
    pub final_state: SessionState,
    /// Staged objects removed from storage.
    pub purged: usize,
    /// Storage or filesystem cleanup error, if any. Never blocks removal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_error: Option<String>,
}

struct Inner {
    registry: SessionRegistry<Arc<SessionHandle>>,
    launcher: TranscoderLauncher,
    store: Arc<dyn ObjectStore>,
    frames: FrameConfig,
    segments: SegmentConfig,
    lifecycle: LifecycleConfig,
    storage_prefix: String,
}

/// Creates, tracks and tears down relay sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(config: &Config, launcher: TranscoderLauncher, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: SessionRegistry::new(),
                launcher,
                store,
                frames: config.frames.clone(),
                segments: config.segments.clone(),
                lifecycle: config.lifecycle.clone(),
                storage_prefix: config.storage.prefix.clone(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.inner.store
    }

    /// Storage key of `file_name` for session `id`.
    pub fn object_key(&self, id: &SessionId, file_name: &str) -> String {
        object_key(&self.inner.storage_prefix, id, file_name)
    }

    pub fn segment_config(&self) -> &SegmentConfig {
        &self.inner.segments
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Spawn a transcoder and register the session as `Starting`.
    ///
    /// Source composition happens before anything is spawned, so an invalid
    /// URI never creates a process. A spawn failure registers nothing.
    pub async fn start(&self, req: StartRequest) -> Result<Arc<SessionHandle>> {
        let source = SourceUri::compose(&req.source, &req.credentials)?;
        let id = SessionId::new();

        let handle = match req.params {
            StreamParams::Frames(params) => {
                let process = self.inner.launcher.spawn_frames(&source, &params)?;
                self.start_frames(id, &source, process)?
            }
            StreamParams::Segmented(params) => {
                let work_dir = self.inner.segments.work_dir.join(id.to_string());
                let output = SegmentOutput {
                    dir: work_dir.clone(),
                    playlist_name: self.inner.segments.playlist_name.clone(),
                    segment_extension: self.inner.segments.segment_extension.clone(),
                };
                let log_path = work_dir.join(LOG_FILE_NAME);
                let child = match self
                    .inner
                    .launcher
                    .spawn_segments(&source, &params, &output, &log_path)
                    .await
                {
                    Ok(child) => child,
                    Err(e) => {
                        remove_work_dir(&work_dir).await;
                        return Err(e);
                    }
                };
                self.start_segments(id, &source, child, work_dir, log_path)?
            }
        };

        tracing::info!(
            session_id = %id,
            mode = %handle.mode(),
            source = %source,
            "Started session"
        );
        Ok(handle)
    }

    /// Start a session and, for segmented sessions, wait until the playlist
    /// has been staged.
    ///
    /// If the session fails while starting it is torn down and its failure
    /// (with diagnostics) is returned.
    pub async fn start_ready(&self, req: StartRequest) -> Result<Arc<SessionHandle>> {
        let handle = self.start(req).await?;
        if handle.mode() != StreamMode::Segmented || !self.inner.segments.wait_ready_on_start {
            return Ok(handle);
        }

        // The watcher enforces the start timeout itself; the slack only covers
        // scheduling delays.
        let limit = self.inner.segments.start_timeout() + Duration::from_secs(2);
        let state = self.wait_ready(&handle.id(), limit).await?;
        if state == SessionState::Streaming {
            return Ok(handle);
        }

        let err = match handle.failure() {
            Some(failure) => failure.to_error(),
            None => Error::StreamStartTimeout {
                secs: self.inner.segments.start_timeout_secs,
                diagnostics: handle.diagnostics(),
            },
        };
        if let Err(e) = self.stop(&handle.id()).await {
            tracing::debug!(session_id = %handle.id(), "Teardown after failed start: {e}");
        }
        Err(err)
    }

    fn start_frames(
        &self,
        id: SessionId,
        source: &SourceUri,
        process: FrameProcess,
    ) -> Result<Arc<SessionHandle>> {
        let FrameProcess {
            child,
            stdout,
            stderr,
        } = process;

        let cfg = &self.inner.frames;
        let demuxer = match cfg.markers() {
            Ok((start, end)) => FrameDemuxer::new(start, end, cfg.max_buffer_bytes),
            Err(e) => {
                tracing::warn!("Invalid frame markers ({e}); using JPEG markers");
                FrameDemuxer::jpeg(cfg.max_buffer_bytes)
            }
        };

        let tail = DiagnosticTail::new(cfg.diagnostic_lines);
        let handle = Arc::new(SessionHandle::new(
            id,
            source.redacted(),
            child,
            tail.clone(),
            SessionHandle::frame_mode(cfg.event_capacity),
        ));
        self.inner.registry.create(id, handle.clone())?;
        handle.publish(SessionEvent::Status("Stream started".into()));

        let drain = spawn_drain(stderr, tail, id);
        let chunk = if cfg.read_chunk_bytes == 0 { 4096 } else { cfg.read_chunk_bytes };
        let task = tokio::spawn(pump_frames(
            handle.clone(),
            frame_stream(stdout, demuxer, chunk),
            drain,
        ));
        handle.set_task(task);
        Ok(handle)
    }

    fn start_segments(
        &self,
        id: SessionId,
        source: &SourceUri,
        child: Child,
        work_dir: PathBuf,
        log_path: PathBuf,
    ) -> Result<Arc<SessionHandle>> {
        let cfg = &self.inner.segments;
        let handle = Arc::new(SessionHandle::new(
            id,
            source.redacted(),
            child,
            DiagnosticTail::new(cfg.diagnostic_lines),
            ModeState::Segmented {
                work_dir: work_dir.clone(),
                log_path,
            },
        ));
        self.inner.registry.create(id, handle.clone())?;

        let watcher = SegmentWatcher::new(
            id,
            work_dir,
            cfg.playlist_name.clone(),
            cfg.segment_extension.clone(),
            self.inner.storage_prefix.clone(),
            self.inner.store.clone(),
        );
        let task = tokio::spawn(watch_segments(handle.clone(), watcher, cfg.clone()));
        handle.set_task(task);
        Ok(handle)
    }

    // -----------------------------------------------------------------------
    // Stop
    // -----------------------------------------------------------------------

    /// Tear a session down.
    ///
    /// Terminates the process (escalating to a kill after the grace period),
    /// cancels the background task, purges staged objects, removes the work
    /// directory and finally drops the registry entry. Concurrent callers
    /// race for the teardown; losers see [`Error::NotFound`].
    pub async fn stop(&self, id: &SessionId) -> Result<StopOutcome> {
        let handle = self.inner.registry.get(id)?;
        if !handle.begin_stop() {
            return Err(Error::not_found("session", id));
        }
        tracing::info!(session_id = %id, "Stopping session");

        handle.cancel.cancel();

        let child = handle.child.lock().await.take();
        if let Some(child) = child {
            terminate(child, self.inner.lifecycle.stop_grace(), id).await;
        }

        if let Some(task) = handle.take_task() {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.inner.lifecycle.task_join_timeout(), task)
                .await
                .is_err()
            {
                tracing::warn!(session_id = %id, "Session task did not finish; aborting");
                abort.abort();
            }
        }

        handle.transition(SessionState::Stopped);
        handle.publish(SessionEvent::End);

        let mut cleanup_error = None;
        let prefix = session_prefix(&self.inner.storage_prefix, id);
        let purged = match self.purge(&prefix).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(session_id = %id, "Failed to purge staged objects: {e}");
                cleanup_error = Some(e.to_string());
                0
            }
        };

        if let ModeState::Segmented { work_dir, .. } = &handle.mode {
            if let Err(e) = tokio::fs::remove_dir_all(work_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(session_id = %id, "Failed to remove {}: {e}", work_dir.display());
                    cleanup_error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        let _ = self.inner.registry.remove(id);
        tracing::info!(session_id = %id, purged, "Session stopped");

        Ok(StopOutcome {
            session_id: *id,
            final_state: handle.state(),
            purged,
            cleanup_error,
        })
    }

    async fn purge(&self, prefix: &str) -> Result<usize> {
        let keys = self.inner.store.list(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.inner.store.delete_many(&keys).await
    }

    /// Stop every registered session.
    pub async fn shutdown(&self) {
        let ids = self.inner.registry.ids();
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "Stopping all sessions");
        let stops = ids.iter().map(|id| self.stop(id));
        for (id, result) in ids.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                tracing::debug!(session_id = %id, "Shutdown stop: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, id: &SessionId) -> Result<Arc<SessionHandle>> {
        self.inner.registry.get(id)
    }

    pub fn info(&self, id: &SessionId) -> Result<SessionInfo> {
        self.get(id).map(|h| h.info())
    }

    /// Snapshots of all sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> =
            self.inner.registry.list().iter().map(|h| h.info()).collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    /// Diagnostic tail for a session. Segmented sessions read their log file.
    pub async fn diagnostics(&self, id: &SessionId) -> Result<String> {
        let handle = self.get(id)?;
        if let ModeState::Segmented { log_path, .. } = &handle.mode {
            let text = read_log_tail(log_path, self.inner.segments.diagnostic_lines).await;
            if !text.is_empty() {
                return Ok(text);
            }
        }
        Ok(handle.diagnostics())
    }

    /// Wait until the session leaves `Starting` or `timeout` elapses, and
    /// return the state at that point.
    pub async fn wait_ready(&self, id: &SessionId, timeout: Duration) -> Result<SessionState> {
        let handle = self.get(id)?;
        let mut rx = handle.watch_state();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| *s != SessionState::Starting),
        )
        .await;
        match waited {
            Ok(Ok(state)) => Ok(*state),
            _ => Ok(handle.state()),
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn pump_frames<S>(
    handle: Arc<SessionHandle>,
    frames: S,
    drain: tokio::task::JoinHandle<()>,
) where
    S: futures::Stream<Item = Result<Frame>>,
{
    futures::pin_mut!(frames);
    let id = handle.id();
    let mut stream_error = None;

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => {
                tracing::debug!(session_id = %id, "Frame pump cancelled");
                return;
            }
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    if handle.increment_artifacts() == 1 {
                        handle.transition(SessionState::Streaming);
                    }
                    handle.publish(SessionEvent::Frame(frame));
                }
                Some(Err(e)) => {
                    stream_error = Some(e);
                    break;
                }
                None => break,
            }
        }
    }

    // Stdout is closed or unusable: release the process, then let stderr
    // finish draining so the diagnostic tail is complete.
    let child = handle.child.lock().await.take();
    if let Some(mut child) = child {
        if let Err(e) = child.kill().await {
            tracing::debug!(session_id = %id, "Kill after stream end: {e}");
        }
    }
    if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
        tracing::debug!(session_id = %id, "Stderr drain did not finish");
    }

    if handle.cancel.is_cancelled() {
        return;
    }

    let frames_sent = handle.artifact_count();
    match stream_error {
        Some(e) => handle.fail(&e),
        None if frames_sent == 0 => {
            let diagnostics = handle.diagnostics();
            handle.fail(&Error::stream_failure("No frames received from stream", diagnostics));
        }
        None => {
            handle.transition(SessionState::Stopped);
            handle.publish(SessionEvent::Status(format!(
                "Stream ended after {frames_sent} frames"
            )));
            tracing::info!(session_id = %id, frames = frames_sent, "Frame stream ended");
        }
    }
    handle.publish(SessionEvent::End);
}

async fn watch_segments(handle: Arc<SessionHandle>, mut watcher: SegmentWatcher, cfg: SegmentConfig) {
    let id = handle.id();
    let ModeState::Segmented { log_path, .. } = &handle.mode else {
        return;
    };

    // Phase 1: wait for the playlist.
    let deadline = tokio::time::Instant::now() + cfg.start_timeout();
    loop {
        if watcher.playlist_exists().await {
            break;
        }
        if let Some(status) = handle.try_reap().await {
            let diagnostics = read_log_tail(log_path, cfg.diagnostic_lines).await;
            handle.fail(&Error::stream_failure(
                format!("transcoder exited ({status}) before writing a playlist"),
                diagnostics,
            ));
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            let diagnostics = read_log_tail(log_path, cfg.diagnostic_lines).await;
            handle.fail(&Error::StreamStartTimeout {
                secs: cfg.start_timeout_secs,
                diagnostics,
            });
            kill_child(&handle).await;
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(cfg.start_probe_interval()) => {}
            _ = handle.cancel.cancelled() => return,
        }
    }

    // Phase 2: stage until cancelled. A transcoder exit settles the state
    // once; polling continues until the session is stopped.
    loop {
        stage(&handle, &mut watcher).await;

        if let Some(status) = handle.try_reap().await {
            stage(&handle, &mut watcher).await;
            let diagnostics = read_log_tail(log_path, cfg.diagnostic_lines).await;
            handle.diagnostic_tail().replace(&diagnostics);
            if handle.state() == SessionState::Streaming {
                tracing::info!(session_id = %id, "Transcoder exited ({status})");
                handle.transition(SessionState::Stopped);
            } else {
                handle.fail(&Error::stream_failure(
                    format!("transcoder exited ({status}) before the playlist was staged"),
                    diagnostics,
                ));
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(cfg.poll_interval()) => {}
            _ = handle.cancel.cancelled() => {
                tracing::debug!(session_id = %id, "Segment watcher cancelled");
                return;
            }
        }
    }
}

async fn stage(handle: &SessionHandle, watcher: &mut SegmentWatcher) {
    match watcher.poll_once().await {
        Ok(report) => {
            handle.set_artifact_count(watcher.segments_staged());
            if report.playlist_staged {
                handle.transition(SessionState::Streaming);
            }
        }
        Err(e) => {
            tracing::warn!(
                session_id = %handle.id(),
                "Failed to scan {}: {e}",
                watcher.dir().display()
            );
        }
    }
}

async fn kill_child(handle: &SessionHandle) {
    let child = handle.child.lock().await.take();
    if let Some(mut child) = child {
        if let Err(e) = child.kill().await {
            tracing::debug!(session_id = %handle.id(), "Kill failed: {e}");
        }
    }
}

/// Ask the process to exit, then force it after `grace`.
async fn terminate(mut child: Child, grace: Duration, id: &SessionId) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(session_id = %id, "SIGTERM failed: {e}");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(session_id = %id, "Transcoder exited: {status}"),
        Ok(Err(e)) => tracing::warn!(session_id = %id, "Failed waiting for transcoder: {e}"),
        Err(_) => {
            tracing::warn!(session_id = %id, "Transcoder ignored SIGTERM for {grace:?}; killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(session_id = %id, "Failed to kill transcoder: {e}");
            }
        }
    }
}

async fn remove_work_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {}: {e}", dir.display());
        }
    }
}
