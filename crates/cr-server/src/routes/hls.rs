//! Segmented-mode retrieval: playlist and segments read back from the
//! object store.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use cr_core::SessionId;

use crate::context::AppContext;
use crate::error::AppError;

/// Content type for a staged file, by extension.
pub fn content_type_for(file: &str) -> &'static str {
    let ext = file.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        _ => "application/octet-stream",
    }
}

/// GET /hls/{id}/{file}
pub async fn serve_file(
    State(ctx): State<AppContext>,
    Path((id, file)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let session_id: SessionId = id
        .parse()
        .map_err(|_| cr_core::Error::not_found("session", &id))?;

    // Validate the file name to prevent directory traversal.
    if file.is_empty()
        || file.contains('/')
        || file.contains('\\')
        || file.contains("..")
        || file.starts_with('.')
    {
        return Err(cr_core::Error::Validation("Invalid file name".into()).into());
    }

    let key = ctx.sessions.object_key(&session_id, &file);
    let data = ctx
        .sessions
        .store()
        .get(&key)
        .await?
        .ok_or_else(|| cr_core::Error::not_found("file", &file))?;

    let cache = if file.ends_with(".m3u8") {
        "no-cache"
    } else {
        "public, max-age=60"
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type_for(&file)),
            (header::CACHE_CONTROL, cache),
        ],
        data,
    ))
}
