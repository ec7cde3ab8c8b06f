//! # cr-av
//!
//! External transcoder management for camrelay.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`tools`]) -- locate the transcoder binary and
//!   report its version.
//! - **Source composition** ([`SourceUri`]) -- merge override credentials into
//!   a camera URI and keep a redacted form for logging.
//! - **Launching** ([`TranscoderLauncher`]) -- build the command line for
//!   either output mode and spawn exactly one process per call.

pub mod launcher;
pub mod source;
pub mod tools;

// ---- Re-exports for convenience ----

pub use launcher::{FrameProcess, SegmentOutput, TranscoderLauncher};
pub use source::SourceUri;
pub use tools::{check_transcoder, resolve_transcoder, ToolInfo};
