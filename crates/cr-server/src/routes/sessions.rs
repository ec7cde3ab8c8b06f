//! Session control route handlers.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use cr_core::config::Config;
use cr_core::stream::{FrameParams, SegmentParams};
use cr_core::{Credentials, SessionId, SessionState, StreamMode, StreamParams};
use cr_session::{SessionInfo, StartRequest, StopOutcome};
use serde::{Deserialize, Serialize};

use crate::context::AppContext;
use crate::error::AppError;

/// Request body for starting a session. Unset parameters take the
/// configured defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct StartSessionRequest {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub mode: StreamMode,
    // Frame mode
    pub frame_rate: Option<u32>,
    pub quality: Option<u32>,
    // Segmented mode
    pub video_bitrate_kbps: Option<u32>,
    pub max_rate_kbps: Option<u32>,
    pub buffer_size_kbps: Option<u32>,
    pub keyframe_interval: Option<u32>,
    pub audio_bitrate_kbps: Option<u32>,
    pub segment_duration_secs: Option<u32>,
    pub segment_count: Option<u32>,
}

impl StartSessionRequest {
    /// Merge with config defaults and validate.
    pub fn into_start_request(self, config: &Config) -> cr_core::Result<StartRequest> {
        if self.url.trim().is_empty() {
            return Err(cr_core::Error::Validation("url is required".into()));
        }

        let params = match self.mode {
            StreamMode::FrameStream => {
                let d = config.frames.params;
                let p = FrameParams {
                    frame_rate: self.frame_rate.unwrap_or(d.frame_rate),
                    quality: self.quality.unwrap_or(d.quality),
                };
                positive("frame_rate", p.frame_rate)?;
                if !(2..=31).contains(&p.quality) {
                    return Err(cr_core::Error::Validation(
                        "quality must be between 2 and 31".into(),
                    ));
                }
                StreamParams::Frames(p)
            }
            StreamMode::Segmented => {
                let d = config.segments.params;
                let p = SegmentParams {
                    video_bitrate_kbps: self.video_bitrate_kbps.unwrap_or(d.video_bitrate_kbps),
                    max_rate_kbps: self.max_rate_kbps.unwrap_or(d.max_rate_kbps),
                    buffer_size_kbps: self.buffer_size_kbps.unwrap_or(d.buffer_size_kbps),
                    keyframe_interval: self.keyframe_interval.unwrap_or(d.keyframe_interval),
                    audio_bitrate_kbps: self.audio_bitrate_kbps.unwrap_or(d.audio_bitrate_kbps),
                    segment_duration_secs: self
                        .segment_duration_secs
                        .unwrap_or(d.segment_duration_secs),
                    segment_count: self.segment_count.unwrap_or(d.segment_count),
                };
                positive("video_bitrate_kbps", p.video_bitrate_kbps)?;
                positive("keyframe_interval", p.keyframe_interval)?;
                positive("segment_duration_secs", p.segment_duration_secs)?;
                StreamParams::Segmented(p)
            }
        };

        Ok(StartRequest {
            source: self.url,
            credentials: Credentials::new(self.username, self.password),
            params,
        })
    }
}

fn positive(name: &str, value: u32) -> cr_core::Result<()> {
    if value == 0 {
        return Err(cr_core::Error::Validation(format!("{name} must be positive")));
    }
    Ok(())
}

/// Response to a successful start.
#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: SessionId,
    pub mode: StreamMode,
    pub state: SessionState,
    pub access_url: String,
    pub diagnostics_url: String,
}

/// Session snapshot with its URLs.
#[derive(Debug, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub info: SessionInfo,
    pub access_url: String,
    pub diagnostics_url: String,
}

impl SessionView {
    fn new(ctx: &AppContext, info: SessionInfo) -> Self {
        Self {
            access_url: ctx.access_url(&info.id, info.mode),
            diagnostics_url: ctx.diagnostics_url(&info.id),
            info,
        }
    }
}

pub(crate) fn parse_id(id: &str) -> Result<SessionId, AppError> {
    id.parse()
        .map_err(|_| cr_core::Error::Validation("Invalid session ID".into()).into())
}

/// POST /api/sessions
pub async fn start_session(
    State(ctx): State<AppContext>,
    Json(payload): Json<StartSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let request = payload.into_start_request(&ctx.config)?;
    let handle = ctx.sessions.start_ready(request).await?;

    let id = handle.id();
    let mode = handle.mode();
    let response = StartSessionResponse {
        session_id: id,
        mode,
        state: handle.state(),
        access_url: ctx.access_url(&id, mode),
        diagnostics_url: ctx.diagnostics_url(&id),
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /api/sessions
pub async fn list_sessions(State(ctx): State<AppContext>) -> Json<Vec<SessionView>> {
    let views = ctx
        .sessions
        .list()
        .into_iter()
        .map(|info| SessionView::new(&ctx, info))
        .collect();
    Json(views)
}

/// GET /api/sessions/{id}
pub async fn get_session(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    let id = parse_id(&id)?;
    let info = ctx.sessions.info(&id)?;
    Ok(Json(SessionView::new(&ctx, info)))
}

/// DELETE /api/sessions/{id} and POST /api/sessions/{id}/stop
pub async fn stop_session(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<StopOutcome>, AppError> {
    let id = parse_id(&id)?;
    let outcome = ctx.sessions.stop(&id).await?;
    Ok(Json(outcome))
}

/// GET /api/sessions/{id}/diagnostics
pub async fn session_diagnostics(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_id(&id)?;
    let text = ctx.sessions.diagnostics(&id).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        text,
    ))
}
