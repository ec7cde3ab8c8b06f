//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for the server, the transcoder, both stream modes, storage and
//! session teardown. Every section defaults sensibly so a completely empty
//! `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::stream::{FrameParams, SegmentParams};
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tools: ToolsConfig,
    pub frames: FrameConfig,
    pub segments: SegmentConfig,
    pub storage: StorageConfig,
    pub lifecycle: LifecycleConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }

        if let Err(e) = self.frames.markers() {
            warnings.push(format!("frames markers are invalid ({e}); JPEG markers will be used"));
        }
        if self.frames.read_chunk_bytes == 0 {
            warnings.push("frames.read_chunk_bytes is 0; 4096 will be used".into());
        }
        if self.frames.max_buffer_bytes < self.frames.read_chunk_bytes {
            warnings.push(
                "frames.max_buffer_bytes is smaller than one read chunk; every frame will overflow"
                    .into(),
            );
        }
        if self.frames.params.frame_rate == 0 {
            warnings.push("frames.frame_rate is 0".into());
        }

        if self.segments.poll_interval_ms == 0 {
            warnings.push("segments.poll_interval_ms is 0; 1000 will be used".into());
        }
        if self.segments.params.segment_count == 0 {
            warnings.push("segments.segment_count is 0; the playlist will grow forever".into());
        }

        if self.storage.prefix.contains("..") {
            warnings.push("storage.prefix contains '..'".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Absolute URL prefix used when building access references. When unset,
    /// references are server-relative paths.
    pub public_base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            public_base_url: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Explicit transcoder path; otherwise `ffmpeg` is looked up on `PATH`.
    pub ffmpeg_path: Option<PathBuf>,
    /// Arguments inserted before the generated ones (for wrapper programs).
    pub ffmpeg_leading_args: Vec<String>,
    /// Upper bound on `-version` probes.
    pub version_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffmpeg_leading_args: Vec::new(),
            version_timeout_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    #[serde(flatten)]
    pub params: FrameParams,
    /// Size of each read from the transcoder's stdout.
    pub read_chunk_bytes: usize,
    /// Hard bound on bytes buffered while waiting for a frame boundary.
    pub max_buffer_bytes: usize,
    /// Start-of-frame marker as a hex string.
    pub start_marker: String,
    /// End-of-frame marker as a hex string.
    pub end_marker: String,
    /// Lines of stderr kept for diagnostics.
    pub diagnostic_lines: usize,
    /// Per-session event queue depth for frame subscribers.
    pub event_capacity: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            params: FrameParams::default(),
            read_chunk_bytes: 4096,
            max_buffer_bytes: 8 * 1024 * 1024,
            start_marker: "ffd8".into(),
            end_marker: "ffd9".into(),
            diagnostic_lines: 10,
            event_capacity: 64,
        }
    }
}

impl FrameConfig {
    /// Decode the configured start and end markers.
    pub fn markers(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let start = decode_hex(&self.start_marker)?;
        let end = decode_hex(&self.end_marker)?;
        if start.is_empty() || end.is_empty() {
            return Err(Error::Validation("frame markers must not be empty".into()));
        }
        Ok((start, end))
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    hex::decode(s).map_err(|e| Error::Validation(format!("invalid hex marker {s:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Segmented mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    #[serde(flatten)]
    pub params: SegmentParams,
    /// Interval between output directory scans.
    pub poll_interval_ms: u64,
    /// How long to wait for the first playlist before failing the session.
    pub start_timeout_secs: u64,
    /// Interval between playlist existence checks while starting.
    pub start_probe_interval_ms: u64,
    /// Parent of the per-session output directories.
    pub work_dir: PathBuf,
    pub playlist_name: String,
    pub segment_extension: String,
    /// Lines of the transcoder log kept for diagnostics.
    pub diagnostic_lines: usize,
    /// Hold the start response until the playlist has been staged.
    pub wait_ready_on_start: bool,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            params: SegmentParams::default(),
            poll_interval_ms: 1000,
            start_timeout_secs: 10,
            start_probe_interval_ms: 500,
            work_dir: std::env::temp_dir().join("camrelay"),
            playlist_name: "stream.m3u8".into(),
            segment_extension: "ts".into(),
            diagnostic_lines: 10,
            wait_ready_on_start: true,
        }
    }
}

impl SegmentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn start_probe_interval(&self) -> Duration {
        Duration::from_millis(self.start_probe_interval_ms.max(1))
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Objects stored as files under `root`.
    #[default]
    Fs,
    /// Objects kept in process memory.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the filesystem backend.
    pub root: PathBuf,
    /// Key prefix under which every session namespace lives.
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            root: PathBuf::from("media"),
            prefix: "hls_media".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Grace period between the terminate signal and a forced kill.
    pub stop_grace_secs: u64,
    /// Upper bound on waiting for a session's background task after cancel.
    pub task_join_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_grace_secs: 5,
            task_join_timeout_secs: 5,
        }
    }
}

impl LifecycleConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn task_join_timeout(&self) -> Duration {
        Duration::from_secs(self.task_join_timeout_secs)
    }
}
