use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// How long a stop transition waits for the render worker to honour
    /// the cancellation signal before force-abandoning it.
    pub stop_grace: Duration,
    /// Read buffer size for the streaming socket.
    pub chunk_bytes: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_millis(500),
            chunk_bytes: 2_048,
        }
    }
}
