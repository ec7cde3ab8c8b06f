//! cr-core: shared types, IDs, errors, and configuration.
//!
//! This crate is the foundational dependency for all other cr-* crates,
//! providing the session identifier, a unified error type, the stream
//! mode/parameter enums, and application configuration.

pub mod config;
pub mod error;
pub mod ids;
pub mod stream;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::SessionId;
pub use stream::*;
