//! Per-command TCP exchanges with the jukebox server.
//!
//! Every command opens a fresh connection scoped to exactly one
//! request/response exchange; connections are never pooled or reused.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::protocol::encode_frame;

/// Where the jukebox server lives. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long a bounded read waits for the first byte before failing.
    pub first_byte_deadline: Duration,
    /// Gap with no new bytes after which a bounded reply is considered
    /// complete.
    pub idle_gap: Duration,
    /// Read buffer size for both bounded and streaming reads.
    pub chunk_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            first_byte_deadline: Duration::from_secs(3),
            idle_gap: Duration::from_millis(100),
            chunk_bytes: 2_048,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to send command to {endpoint}: {source}")]
    Send {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read response from {endpoint}: {source}")]
    Read {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },
    #[error("no response from {endpoint} within {waited:?}")]
    ResponseTimeout { endpoint: Endpoint, waited: Duration },
}

/// One connection scoped to exactly one command/response exchange.
pub struct Exchange {
    stream: TcpStream,
    endpoint: Endpoint,
    config: TransportConfig,
}

impl Exchange {
    /// Open a fresh connection and send the framed command.
    pub async fn open(
        endpoint: &Endpoint,
        wire: &str,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|source| TransportError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;

        let frame = encode_frame(wire);
        stream
            .write_all(&frame)
            .await
            .map_err(|source| TransportError::Send {
                endpoint: endpoint.clone(),
                source,
            })?;
        stream
            .flush()
            .await
            .map_err(|source| TransportError::Send {
                endpoint: endpoint.clone(),
                source,
            })?;

        debug!(target: "transport", endpoint = %endpoint, command = wire, "exchange opened");

        Ok(Self {
            stream,
            endpoint: endpoint.clone(),
            config: config.clone(),
        })
    }

    /// Drain a bounded text reply.
    ///
    /// Blocks for the first byte with a hard deadline, then keeps reading
    /// until a quiescent gap or end-of-stream. The connection closes when
    /// the exchange is dropped on return.
    pub async fn read_bounded(mut self) -> Result<String, TransportError> {
        let mut payload = Vec::new();
        let mut buf = vec![0_u8; self.config.chunk_bytes];

        match timeout(self.config.first_byte_deadline, self.stream.read(&mut buf)).await {
            Ok(Ok(0)) => return Ok(String::new()),
            Ok(Ok(n)) => payload.extend_from_slice(&buf[..n]),
            Ok(Err(source)) => {
                return Err(TransportError::Read {
                    endpoint: self.endpoint,
                    source,
                })
            }
            Err(_) => {
                return Err(TransportError::ResponseTimeout {
                    endpoint: self.endpoint,
                    waited: self.config.first_byte_deadline,
                })
            }
        }

        loop {
            match timeout(self.config.idle_gap, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => payload.extend_from_slice(&buf[..n]),
                Ok(Err(source)) => {
                    return Err(TransportError::Read {
                        endpoint: self.endpoint,
                        source,
                    })
                }
                // The line went quiet: the reply is complete.
                Err(_) => break,
            }
        }

        Ok(String::from_utf8_lossy(&payload).into_owned())
    }

    /// Hand the raw byte source to the playback worker. The worker owns
    /// the connection from here; dropping the stream closes the exchange.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    fn local_endpoint(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1", port)
    }

    fn quick_config() -> TransportConfig {
        TransportConfig {
            first_byte_deadline: Duration::from_millis(200),
            idle_gap: Duration::from_millis(80),
            chunk_bytes: 2_048,
        }
    }

    #[tokio::test]
    async fn sends_the_framed_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut received = vec![0_u8; 6];
            socket
                .read_exact(&mut received)
                .await
                .expect("read frame");
            received
        });

        let _exchange = Exchange::open(&local_endpoint(port), "list", &quick_config())
            .await
            .expect("open");

        let received = server.await.expect("server task");
        assert_eq!(received, encode_frame("list"));
    }

    #[tokio::test]
    async fn bounded_read_drains_until_the_line_goes_quiet() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut frame = vec![0_u8; 6];
            socket.read_exact(&mut frame).await.expect("read frame");
            socket.write_all(b"1: Song A\n").await.expect("write");
            sleep(Duration::from_millis(20)).await;
            socket.write_all(b"2: Song B\n").await.expect("write");
            // Keep the connection open past the idle gap.
            sleep(Duration::from_millis(300)).await;
        });

        let exchange = Exchange::open(&local_endpoint(port), "list", &quick_config())
            .await
            .expect("open");
        let payload = exchange.read_bounded().await.expect("read");
        assert_eq!(payload, "1: Song A\n2: Song B\n");
    }

    #[tokio::test]
    async fn bounded_read_completes_on_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut frame = vec![0_u8; 8];
            socket.read_exact(&mut frame).await.expect("read frame");
            socket.write_all(b"Song A by Band A\n").await.expect("write");
        });

        let exchange = Exchange::open(&local_endpoint(port), "info 0", &quick_config())
            .await
            .expect("open");
        let payload = exchange.read_bounded().await.expect("read");
        assert_eq!(payload, "Song A by Band A\n");
    }

    #[tokio::test]
    async fn bounded_read_times_out_when_the_server_stays_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.expect("accept");
            sleep(Duration::from_secs(2)).await;
        });

        let exchange = Exchange::open(&local_endpoint(port), "list", &quick_config())
            .await
            .expect("open");
        let result = timeout(Duration::from_secs(1), exchange.read_bounded())
            .await
            .expect("read_bounded must not hang");
        assert!(matches!(
            result,
            Err(TransportError::ResponseTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn refused_connections_are_connect_errors() {
        // Bind to learn a free port, then release it before connecting.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let result = Exchange::open(&local_endpoint(port), "list", &quick_config()).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
