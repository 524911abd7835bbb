//! Playback session lifecycle: at most one live render task.
//!
//! All start/stop transitions are serialized through the handle slot so
//! a rapid play→stop→play sequence never races and two renderers can
//! never feed the output device at the same time.

mod config;
mod handle;
mod worker;

pub use config::PlaybackConfig;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::audio::AudioRenderer;
use crate::protocol::Command;
use crate::telemetry::events::{record_playback_started, record_playback_stopped};
use crate::transport::{Endpoint, Exchange, TransportConfig, TransportError};

use self::handle::PlaybackHandle;
use self::worker::RenderWorker;

pub struct PlaybackSession {
    renderer: Arc<dyn AudioRenderer>,
    config: PlaybackConfig,
    transport: TransportConfig,
    slot: Mutex<Option<PlaybackHandle>>,
}

impl PlaybackSession {
    pub fn new(
        renderer: Arc<dyn AudioRenderer>,
        config: PlaybackConfig,
        transport: TransportConfig,
    ) -> Self {
        Self {
            renderer,
            config,
            transport,
            slot: Mutex::new(None),
        }
    }

    /// Start playing `track`, superseding any in-flight playback.
    ///
    /// The stop transition for the previous handle completes fully
    /// (cancellation acknowledged or force-abandoned) before the new
    /// exchange is opened, so playback connections never overlap.
    pub async fn start(
        &self,
        endpoint: &Endpoint,
        track: Option<u32>,
    ) -> Result<(), TransportError> {
        let mut slot = self.slot.lock().await;

        if let Some(previous) = slot.take() {
            previous.shutdown(self.config.stop_grace).await;
            record_playback_stopped("superseded");
        }

        let Some(wire) = Command::Play(track).wire_text() else {
            return Ok(());
        };
        let exchange = Exchange::open(endpoint, &wire, &self.transport).await?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_notify = Arc::new(Notify::new());
        let worker = RenderWorker::new(
            exchange.into_stream(),
            Arc::clone(&self.renderer),
            Arc::clone(&stop_flag),
            Arc::clone(&stop_notify),
            self.config.chunk_bytes,
        )
        .spawn();

        *slot = Some(PlaybackHandle::new(
            stop_flag,
            stop_notify,
            worker,
            Arc::clone(&self.renderer),
            track,
        ));

        record_playback_started(track);
        info!(target: "playback", ?track, "playback started");
        Ok(())
    }

    /// Stop any in-flight playback with a bounded wait. A no-op when
    /// idle.
    pub async fn stop(&self) {
        let mut slot = self.slot.lock().await;

        match slot.take() {
            Some(handle) => {
                let track = handle.track();
                handle.shutdown(self.config.stop_grace).await;
                record_playback_stopped("stopped");
                info!(target: "playback", ?track, "playback stopped");
            }
            None => {
                debug!(target: "playback", "stop requested while idle");
            }
        }
    }

    /// True while a render task is live. Finished workers are retired
    /// lazily by the next transition.
    pub async fn is_active(&self) -> bool {
        self.slot
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests;
