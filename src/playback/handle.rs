use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::warn;

use crate::audio::AudioRenderer;
use crate::telemetry::events::record_playback_cancel_timeout;

/// The single live render task plus its backing connection.
pub(crate) struct PlaybackHandle {
    stop_flag: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    worker: JoinHandle<()>,
    renderer: Arc<dyn AudioRenderer>,
    track: Option<u32>,
}

impl PlaybackHandle {
    pub(crate) fn new(
        stop_flag: Arc<AtomicBool>,
        stop_notify: Arc<Notify>,
        worker: JoinHandle<()>,
        renderer: Arc<dyn AudioRenderer>,
        track: Option<u32>,
    ) -> Self {
        Self {
            stop_flag,
            stop_notify,
            worker,
            renderer,
            track,
        }
    }

    /// Cooperative stop with a bounded wait.
    ///
    /// A worker that ignores the signal past the grace period is aborted;
    /// aborting drops the worker and thereby closes its connection, and
    /// the renderer's buffered audio is discarded here since the worker
    /// never got to do it.
    pub(crate) async fn shutdown(mut self, grace: Duration) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();

        match timeout(grace, &mut self.worker).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(target: "playback", %err, "render worker terminated abnormally");
            }
            Err(_) => {
                warn!(
                    target: "playback",
                    grace = ?grace,
                    "render worker ignored stop signal, aborting"
                );
                record_playback_cancel_timeout(self.track, grace);

                self.worker.abort();
                let _ = (&mut self.worker).await;

                if let Err(err) = self.renderer.discard().await {
                    warn!(target: "playback", %err, "failed to discard buffered audio");
                }
            }
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    pub(crate) fn track(&self) -> Option<u32> {
        self.track
    }
}
