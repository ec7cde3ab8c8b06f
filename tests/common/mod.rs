//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which builds a full [`AppContext`] whose
//! transcoder is a `/bin/sh` script and whose object store lives in memory,
//! and serves the router on a random port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use cr_av::TranscoderLauncher;
use cr_core::config::{Config, StorageBackend};
use cr_server::context::AppContext;
use cr_server::router::build_router;
use cr_session::{MemoryObjectStore, ObjectStore, SessionManager};

/// Emits two frames on stdout, then idles until killed.
pub const TWO_FRAMES: &str =
    r"printf '\377\330one\377\331\377\330two\377\331'; exec sleep 30";

/// Writes nothing to stdout and complains on stderr.
pub const NO_FRAMES: &str = r"echo 'Connection refused' >&2; sleep 0.2";

/// Writes a playlist and two segments next to the output path (last argument).
pub const HLS_WRITER: &str = r#"for last; do :; done
dir=$(dirname "$last")
printf 'seg0' > "$dir/stream0.ts"
printf 'seg1' > "$dir/stream1.ts"
printf '#EXTM3U\nstream0.ts\nstream1.ts\n' > "$last"
exec sleep 30"#;

/// Never writes a playlist.
pub const AUTH_FAILURE: &str =
    r"echo 'method DESCRIBE failed: 401 Unauthorized' >&2; exec sleep 30";

/// Test harness wrapping a fully-constructed [`AppContext`].
pub struct TestHarness {
    pub ctx: AppContext,
    pub store: MemoryObjectStore,
    pub work_dir: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestHarness {
    /// Build a harness whose transcoder runs `script` under `/bin/sh`.
    pub fn new(script: &str) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let work_dir = dir.path().join("work");

        let mut config = Config::default();
        config.server.public_base_url = Some("http://relay.test".into());
        config.tools.ffmpeg_path = Some(PathBuf::from("/bin/sh"));
        config.tools.ffmpeg_leading_args =
            vec!["-c".into(), script.into(), "fake-ffmpeg".into()];
        config.storage.backend = StorageBackend::Memory;
        config.segments.work_dir = work_dir.clone();
        config.segments.start_timeout_secs = 1;
        config.segments.start_probe_interval_ms = 50;
        config.segments.poll_interval_ms = 50;
        config.lifecycle.stop_grace_secs = 1;

        let store = MemoryObjectStore::new();
        let launcher = TranscoderLauncher::from_config(&config.tools);
        let sessions = SessionManager::new(
            &config,
            launcher,
            Arc::new(store.clone()) as Arc<dyn ObjectStore>,
        );
        let ctx = AppContext::with_sessions(config, sessions);

        Self {
            ctx,
            store,
            work_dir,
            _dir: dir,
        }
    }

    /// Start an Axum server on a random port and return the harness together
    /// with the bound socket address.
    pub async fn with_server(script: &str) -> (Self, SocketAddr) {
        let harness = Self::new(script);
        let app = build_router(harness.ctx.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        (harness, addr)
    }
}

/// POST a start body and return status plus JSON response.
pub async fn start_session(
    addr: SocketAddr,
    body: serde_json::Value,
) -> (reqwest::StatusCode, serde_json::Value) {
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/sessions"))
        .json(&body)
        .send()
        .await
        .expect("request failed");
    let status = resp.status();
    let json = resp.json().await.expect("response was not JSON");
    (status, json)
}
