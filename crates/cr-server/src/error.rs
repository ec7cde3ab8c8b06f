//! Error-to-HTTP response conversion.
//!
//! Route handlers return `Result<T, AppError>`; any [`cr_core::Error`] converts
//! with `?`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Wrapper so we can implement `IntoResponse` for an external type.
#[derive(Debug)]
pub struct AppError {
    inner: cr_core::Error,
}

impl AppError {
    pub fn new(inner: cr_core::Error) -> Self {
        Self { inner }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match &self.inner {
            cr_core::Error::NotFound { .. } => "not_found",
            cr_core::Error::Validation(_) => "validation_error",
            cr_core::Error::InvalidSourceUri(_) => "invalid_source_uri",
            cr_core::Error::Conflict(_) => "conflict",
            cr_core::Error::Spawn { .. } => "process_spawn_failure",
            cr_core::Error::StreamFailure { .. } => "stream_failure",
            cr_core::Error::StreamStartTimeout { .. } => "stream_start_timeout",
            cr_core::Error::BufferOverflow { .. } => "buffer_overflow",
            cr_core::Error::Storage(_) => "storage_error",
            cr_core::Error::Io { .. } => "io_error",
            cr_core::Error::Internal(_) => "internal_error",
        }
    }
}

impl From<cr_core::Error> for AppError {
    fn from(e: cr_core::Error) -> Self {
        Self::new(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(
                status = %status,
                error = %self.inner,
                "Server error in API handler"
            );
        }

        let mut body = json!({
            "error": self.inner.to_string(),
            "code": self.code(),
        });
        if let Some(diagnostics) = self.inner.diagnostics() {
            body["diagnostics"] = json!(diagnostics);
        }

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_produces_404() {
        let err = AppError::new(cr_core::Error::not_found("session", "abc"));
        assert_eq!(err.code(), "not_found");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn start_timeout_produces_504() {
        let err = AppError::new(cr_core::Error::StreamStartTimeout {
            secs: 10,
            diagnostics: "401 Unauthorized".into(),
        });
        assert_eq!(err.code(), "stream_start_timeout");
        assert_eq!(err.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn body_carries_diagnostics() {
        let err = AppError::new(cr_core::Error::stream_failure("no frames", "refused"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "stream_failure");
        assert_eq!(body["diagnostics"], "refused");
    }
}
