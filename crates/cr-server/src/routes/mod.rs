//! Route handlers for the HTTP API.

pub mod frames;
pub mod health;
pub mod hls;
pub mod sessions;
