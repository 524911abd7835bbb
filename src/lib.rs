//! Tunebox Client Library
//!
//! This crate provides the core functionality for the tunebox jukebox
//! client: command parsing and framing, per-command transport exchanges,
//! the playback-cancellation engine, and telemetry.

pub mod audio;
pub mod dispatcher;
pub mod playback;
pub mod protocol;
pub mod telemetry;
pub mod transport;
