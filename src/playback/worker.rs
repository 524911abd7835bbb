use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::audio::AudioRenderer;

enum StreamEnd {
    Cancelled,
    Ended,
}

/// Streams audio bytes from an open exchange into the renderer.
///
/// The stop signal is checked at every buffer-read boundary and raced
/// against the socket read, so a stop transition unblocks a worker that
/// is waiting on a slow or stalled server. The worker owns the
/// connection; it closes when the worker finishes or is aborted.
pub(crate) struct RenderWorker {
    stream: TcpStream,
    renderer: Arc<dyn AudioRenderer>,
    stop_flag: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    chunk_bytes: usize,
}

impl RenderWorker {
    pub(crate) fn new(
        stream: TcpStream,
        renderer: Arc<dyn AudioRenderer>,
        stop_flag: Arc<AtomicBool>,
        stop_notify: Arc<Notify>,
        chunk_bytes: usize,
    ) -> Self {
        Self {
            stream,
            renderer,
            stop_flag,
            stop_notify,
            chunk_bytes,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        if let Err(err) = self.renderer.start_stream().await {
            warn!(target: "playback", %err, "failed to start renderer");
            return;
        }

        let mut buf = vec![0_u8; self.chunk_bytes];
        let end = loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                break StreamEnd::Cancelled;
            }

            tokio::select! {
                biased;

                _ = self.stop_notify.notified() => {
                    break StreamEnd::Cancelled;
                }

                read = self.stream.read(&mut buf) => match read {
                    Ok(0) => break StreamEnd::Ended,
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if let Err(err) = self.renderer.push_chunk(chunk).await {
                            warn!(target: "playback", %err, "renderer rejected chunk, stopping stream");
                            break StreamEnd::Cancelled;
                        }
                    }
                    Err(err) => {
                        warn!(target: "playback", %err, "audio stream read failed");
                        break StreamEnd::Ended;
                    }
                },
            }
        };

        match end {
            StreamEnd::Cancelled => {
                if let Err(err) = self.renderer.discard().await {
                    warn!(target: "playback", %err, "failed to discard buffered audio");
                }
                debug!(target: "playback", "render worker cancelled");
            }
            StreamEnd::Ended => {
                if let Err(err) = self.renderer.finish_stream().await {
                    warn!(target: "playback", %err, "failed to finish stream");
                }
                debug!(target: "playback", "stream ended");
            }
        }
        // Dropping self closes the exchange connection.
    }
}
