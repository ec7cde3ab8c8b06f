//! Application context shared by every handler through Axum state.

use std::sync::Arc;

use cr_av::TranscoderLauncher;
use cr_core::config::Config;
use cr_core::{SessionId, StreamMode};
use cr_session::{build_store, SessionManager};

/// Immutable configuration plus the session manager.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub sessions: SessionManager,
}

impl AppContext {
    /// Build the context from configuration: resolve the transcoder and open
    /// the configured object store.
    pub fn new(config: Config) -> Self {
        let launcher = TranscoderLauncher::from_config(&config.tools);
        let store = build_store(&config.storage);
        let sessions = SessionManager::new(&config, launcher, store);
        Self::with_sessions(config, sessions)
    }

    pub fn with_sessions(config: Config, sessions: SessionManager) -> Self {
        Self {
            config: Arc::new(config),
            sessions,
        }
    }

    fn base_url(&self) -> &str {
        self.config
            .server
            .public_base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/'))
            .unwrap_or("")
    }

    /// Where a client picks up the session's output.
    pub fn access_url(&self, id: &SessionId, mode: StreamMode) -> String {
        match mode {
            StreamMode::FrameStream => format!("{}/ws/sessions/{id}", self.base_url()),
            StreamMode::Segmented => format!(
                "{}/hls/{id}/{}",
                self.base_url(),
                self.config.segments.playlist_name
            ),
        }
    }

    pub fn diagnostics_url(&self, id: &SessionId) -> String {
        format!("{}/api/sessions/{id}/diagnostics", self.base_url())
    }
}
