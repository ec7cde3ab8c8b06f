//! # cr-session
//!
//! Session layer for camrelay: everything between a spawned transcoder and
//! the artifacts that leave the process.
//!
//! - [`demux`] -- split a raw byte stream into marker-delimited frames.
//! - [`diagnostics`] -- bounded tail of transcoder error output.
//! - [`storage`] -- the [`ObjectStore`] seam with filesystem and memory backends.
//! - [`watcher`] -- stage playlist and segment files from an output directory.
//! - [`registry`] -- concurrent id-to-handle map.
//! - [`session`] -- per-session handle, state and events.
//! - [`lifecycle`] -- start/stop orchestration ([`SessionManager`]).

pub mod demux;
pub mod diagnostics;
pub mod lifecycle;
pub mod registry;
pub mod session;
pub mod storage;
pub mod watcher;

pub use demux::{frame_stream, Frame, FrameDemuxer};
pub use diagnostics::DiagnosticTail;
pub use lifecycle::{SessionManager, StartRequest, StopOutcome};
pub use registry::SessionRegistry;
pub use session::{SessionEvent, SessionHandle, SessionInfo};
pub use storage::{build_store, FsObjectStore, MemoryObjectStore, ObjectStore};
pub use watcher::{PollReport, SegmentWatcher};
