//! Transcoder discovery and availability checks.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use cr_core::config::ToolsConfig;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Name looked up on `PATH` when no explicit path is configured.
pub const TRANSCODER_NAME: &str = "ffmpeg";

/// Availability information for the transcoder, returned by [`check_transcoder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Tool name.
    pub name: String,
    /// Whether the tool answered a version probe.
    pub available: bool,
    /// Version string (first line of `-version` output), if available.
    pub version: Option<String>,
    /// Path that was probed.
    pub path: PathBuf,
}

/// Resolve the transcoder executable.
///
/// A configured path is used when it exists. Otherwise [`which::which`] looks
/// the tool up on `PATH`. If neither succeeds the bare name is returned, so a
/// missing binary surfaces later as a spawn failure rather than here.
pub fn resolve_transcoder(tools: &ToolsConfig) -> PathBuf {
    if let Some(p) = tools.ffmpeg_path.as_deref() {
        if p.exists() {
            return p.to_path_buf();
        }
        tracing::warn!(
            "Configured transcoder {} does not exist; searching PATH",
            p.display()
        );
    }

    which::which(TRANSCODER_NAME).unwrap_or_else(|_| PathBuf::from(TRANSCODER_NAME))
}

/// Run `<transcoder> -version` with a timeout and report the result.
pub async fn check_transcoder(tools: &ToolsConfig) -> ToolInfo {
    let path = resolve_transcoder(tools);
    let timeout = Duration::from_secs(tools.version_timeout_secs.max(1));
    let version = detect_version(&path, timeout).await;

    ToolInfo {
        name: TRANSCODER_NAME.to_string(),
        available: version.is_some(),
        version,
        path,
    }
}

async fn detect_version(path: &Path, timeout: Duration) -> Option<String> {
    let output = Command::new(path)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, output).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::debug!("Version probe of {} failed: {e}", path.display());
            return None;
        }
        Err(_) => {
            tracing::warn!("Version probe of {} timed out after {timeout:?}", path.display());
            return None;
        }
    };

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|s| s.trim().to_string())
}
