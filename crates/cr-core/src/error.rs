//! Unified error type for the camrelay application.
//!
//! All crates funnel their failures into [`Error`], which carries enough context
//! for API handlers to derive an HTTP status code via [`Error::http_status`].

use std::fmt;

/// Unified error type covering all failure modes in camrelay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "session", "object").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Request data failed validation (missing or unparseable input).
    #[error("Validation error: {0}")]
    Validation(String),

    /// The source URI has no usable hostname or cannot be parsed.
    #[error("Invalid source URI: {0}")]
    InvalidSourceUri(String),

    /// A conflicting resource already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The transcoder process could not be launched.
    #[error("Failed to spawn [{tool}]: {message}")]
    Spawn {
        /// Name of the program that failed to launch.
        tool: String,
        /// Underlying error text.
        message: String,
    },

    /// The stream produced nothing usable.
    #[error("Stream failure: {reason}")]
    StreamFailure {
        /// Human-readable reason.
        reason: String,
        /// Last lines of transcoder error output, possibly empty.
        diagnostics: String,
    },

    /// The playlist never appeared within the start timeout.
    #[error("Stream did not start within {secs}s")]
    StreamStartTimeout {
        /// The timeout that elapsed, in seconds.
        secs: u64,
        /// Last lines of transcoder error output, possibly empty.
        diagnostics: String,
    },

    /// The frame buffer grew past its bound without yielding a frame.
    #[error("Frame buffer exceeded {limit} bytes without a complete frame")]
    BufferOverflow {
        /// Configured maximum buffer size in bytes.
        limit: usize,
    },

    /// A durable storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::Validation(_) => 400,
            Error::InvalidSourceUri(_) => 400,
            Error::Conflict(_) => 409,
            Error::Spawn { .. } => 502,
            Error::StreamFailure { .. } => 502,
            Error::StreamStartTimeout { .. } => 504,
            Error::BufferOverflow { .. } => 502,
            Error::Storage(_) => 500,
            Error::Io { .. } => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Diagnostic text attached to stream failures, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Error::StreamFailure { diagnostics, .. }
            | Error::StreamStartTimeout { diagnostics, .. }
                if !diagnostics.is_empty() =>
            {
                Some(diagnostics)
            }
            _ => None,
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Spawn`].
    pub fn spawn(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Spawn {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::StreamFailure`].
    pub fn stream_failure(reason: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        Error::StreamFailure {
            reason: reason.into(),
            diagnostics: diagnostics.into(),
        }
    }

    /// Convenience constructor for [`Error::Storage`].
    pub fn storage(message: impl fmt::Display) -> Self {
        Error::Storage(message.to_string())
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = Error::not_found("session", "abc-123");
        assert_eq!(err.to_string(), "session not found: abc-123");
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn validation_display() {
        let err = Error::Validation("missing source url".into());
        assert_eq!(err.to_string(), "Validation error: missing source url");
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn invalid_source_uri_is_client_error() {
        let err = Error::InvalidSourceUri("hostname missing".into());
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn conflict_display() {
        let err = Error::Conflict("session already exists".into());
        assert_eq!(err.to_string(), "Conflict: session already exists");
        assert_eq!(err.http_status(), 409);
    }

    #[test]
    fn spawn_display() {
        let err = Error::spawn("ffmpeg", "No such file or directory");
        assert_eq!(
            err.to_string(),
            "Failed to spawn [ffmpeg]: No such file or directory"
        );
        assert_eq!(err.http_status(), 502);
    }

    #[test]
    fn stream_start_timeout_status() {
        let err = Error::StreamStartTimeout {
            secs: 10,
            diagnostics: String::new(),
        };
        assert_eq!(err.to_string(), "Stream did not start within 10s");
        assert_eq!(err.http_status(), 504);
        assert!(err.diagnostics().is_none());
    }

    #[test]
    fn stream_failure_carries_diagnostics() {
        let err = Error::stream_failure("no frames received", "Connection refused");
        assert_eq!(err.diagnostics(), Some("Connection refused"));
        assert_eq!(err.http_status(), 502);
    }

    #[test]
    fn buffer_overflow_display() {
        let err = Error::BufferOverflow { limit: 1024 };
        assert_eq!(
            err.to_string(),
            "Frame buffer exceeded 1024 bytes without a complete frame"
        );
    }

    #[test]
    fn io_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(err.http_status(), 500);
    }
}
