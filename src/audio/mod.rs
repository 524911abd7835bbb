//! Decode-and-render collaborator for playback streams.
//!
//! The session engine only ever talks to the [`AudioRenderer`] seam. The
//! concrete engine decodes the incoming byte stream and drives the output
//! device; builds without the `playback` feature fall back to a silent
//! sink so the session engine stays fully usable and testable.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

#[cfg(feature = "playback")]
mod engine;
#[cfg(feature = "playback")]
mod output;

#[cfg(feature = "playback")]
pub use engine::StreamingRenderer;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("audio output unavailable: {0}")]
    Output(String),
    #[error("audio decode failed: {0}")]
    Decode(String),
    #[error("renderer is not accepting audio")]
    Closed,
}

/// Consumes an audio byte stream and produces audible output.
///
/// One stream is active at a time. `finish_stream` lets buffered audio
/// drain after a natural end of song; `discard` drops buffered audio
/// immediately so nothing from a cancelled stream is ever heard.
#[async_trait]
pub trait AudioRenderer: Send + Sync {
    async fn start_stream(&self) -> Result<(), RenderError>;
    async fn push_chunk(&self, chunk: Bytes) -> Result<(), RenderError>;
    async fn finish_stream(&self) -> Result<(), RenderError>;
    async fn discard(&self) -> Result<(), RenderError>;
}

/// Build the renderer for this build: the streaming engine when the
/// `playback` feature is enabled, a silent sink otherwise.
pub fn default_renderer() -> Arc<dyn AudioRenderer> {
    #[cfg(feature = "playback")]
    {
        Arc::new(StreamingRenderer::new())
    }
    #[cfg(not(feature = "playback"))]
    {
        Arc::new(SilentRenderer)
    }
}

/// Discards every byte. Keeps headless builds honest about stream
/// lifecycle without touching an output device.
#[derive(Debug, Default)]
pub struct SilentRenderer;

#[async_trait]
impl AudioRenderer for SilentRenderer {
    async fn start_stream(&self) -> Result<(), RenderError> {
        debug!(target: "audio_render", "starting silent stream");
        Ok(())
    }

    async fn push_chunk(&self, chunk: Bytes) -> Result<(), RenderError> {
        trace!(target: "audio_render", len = chunk.len(), "discarding audio chunk");
        Ok(())
    }

    async fn finish_stream(&self) -> Result<(), RenderError> {
        debug!(target: "audio_render", "silent stream finished");
        Ok(())
    }

    async fn discard(&self) -> Result<(), RenderError> {
        debug!(target: "audio_render", "silent stream discarded");
        Ok(())
    }
}
