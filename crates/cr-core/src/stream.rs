//! Stream-domain enums and parameter sets shared by the launcher, the
//! session layer, and the HTTP API.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a session delivers its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StreamMode {
    /// Discrete image frames pushed over a persistent connection.
    #[serde(rename = "frames", alias = "frame_stream")]
    FrameStream,
    /// Playlist plus media segments staged to storage for pull retrieval.
    #[default]
    #[serde(rename = "segmented", alias = "hls")]
    Segmented,
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamMode::FrameStream => write!(f, "frames"),
            StreamMode::Segmented => write!(f, "segmented"),
        }
    }
}

/// Lifecycle state of a session.
///
/// Transitions only move forward: `Starting -> Streaming -> {Stopped, Failed}`,
/// and `Starting` may jump straight to a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Streaming,
    Stopped,
    Failed,
}

impl SessionState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }

    /// Whether moving from `self` to `next` keeps the state machine monotonic.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        match (self, next) {
            (SessionState::Starting, SessionState::Starting) => false,
            (SessionState::Starting, _) => true,
            (SessionState::Streaming, SessionState::Stopped | SessionState::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Streaming => "streaming",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Encoding parameters for frame mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameParams {
    /// Output frames per second.
    pub frame_rate: u32,
    /// MJPEG quantizer (`-q:v`), 2 (best) to 31 (worst).
    pub quality: u32,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            frame_rate: 2,
            quality: 5,
        }
    }
}

/// Encoding and segmenting parameters for segmented mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentParams {
    /// Target video bitrate in kbit/s.
    pub video_bitrate_kbps: u32,
    /// Rate-control ceiling in kbit/s.
    pub max_rate_kbps: u32,
    /// Rate-control buffer in kbit.
    pub buffer_size_kbps: u32,
    /// Frames between keyframes (GOP size).
    pub keyframe_interval: u32,
    /// Audio bitrate in kbit/s.
    pub audio_bitrate_kbps: u32,
    /// Target duration of each segment.
    pub segment_duration_secs: u32,
    /// Number of segments kept in the live playlist.
    pub segment_count: u32,
}

impl Default for SegmentParams {
    fn default() -> Self {
        Self {
            video_bitrate_kbps: 2000,
            max_rate_kbps: 2500,
            buffer_size_kbps: 5000,
            keyframe_interval: 30,
            audio_bitrate_kbps: 128,
            segment_duration_secs: 2,
            segment_count: 10,
        }
    }
}

/// Parameters for one session, tagged by mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamParams {
    Frames(FrameParams),
    Segmented(SegmentParams),
}

impl StreamParams {
    /// The mode these parameters belong to.
    pub fn mode(&self) -> StreamMode {
        match self {
            StreamParams::Frames(_) => StreamMode::FrameStream,
            StreamParams::Segmented(_) => StreamMode::Segmented,
        }
    }
}

/// Optional credentials that override those embedded in a source URI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    /// Build credentials from optional parts; empty strings count as absent.
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self {
            username: username.filter(|s| !s.is_empty()),
            password: password.filter(|s| !s.is_empty()),
        }
    }

    /// True when neither part is set.
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.password.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_serde_names() {
        assert_eq!(
            serde_json::to_string(&StreamMode::FrameStream).unwrap(),
            "\"frames\""
        );
        let mode: StreamMode = serde_json::from_str("\"hls\"").unwrap();
        assert_eq!(mode, StreamMode::Segmented);
        assert_eq!(StreamMode::default(), StreamMode::Segmented);
    }

    #[test]
    fn state_machine_is_monotonic() {
        use SessionState::*;
        assert!(Starting.can_transition_to(Streaming));
        assert!(Starting.can_transition_to(Failed));
        assert!(Streaming.can_transition_to(Stopped));
        assert!(!Streaming.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Streaming));
        assert!(!Failed.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Failed));
        assert!(!Streaming.can_transition_to(Streaming));
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Stopped.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Streaming.is_terminal());
    }

    #[test]
    fn credentials_treat_empty_as_absent() {
        let creds = Credentials::new(Some(String::new()), Some("pw".into()));
        assert_eq!(creds.username, None);
        assert_eq!(creds.password.as_deref(), Some("pw"));
        assert!(Credentials::new(None, Some(String::new())).is_empty());
    }

    #[test]
    fn params_report_mode() {
        assert_eq!(
            StreamParams::Frames(FrameParams::default()).mode(),
            StreamMode::FrameStream
        );
        assert_eq!(
            StreamParams::Segmented(SegmentParams::default()).mode(),
            StreamMode::Segmented
        );
    }
}
