//! Interactive session loop: one command line in, one routed action out.

use std::io::Write;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::warn;

use crate::playback::PlaybackSession;
use crate::protocol::{Command, ParseError, ResponseKind};
use crate::telemetry::events::record_exchange_failed;
use crate::transport::{Endpoint, Exchange, TransportConfig, TransportError};

/// Line-oriented input collaborator. Production reads stdin; tests
/// script it.
#[async_trait]
pub trait CommandSource: Send {
    /// Next raw command line, `None` at end of input.
    async fn next_line(&mut self) -> std::io::Result<Option<String>>;
}

pub struct StdinSource {
    lines: Lines<BufReader<Stdin>>,
}

impl StdinSource {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandSource for StdinSource {
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What one dispatched command produced; the run loop renders these.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Bounded reply payload, printed verbatim.
    Reply(String),
    /// Playback was started or superseded.
    Playing,
    Stopped,
    /// Blank input, nothing to do.
    Ignored,
    Exit,
}

pub struct CommandDispatcher {
    endpoint: Endpoint,
    playback: PlaybackSession,
    transport: TransportConfig,
}

impl CommandDispatcher {
    pub fn new(
        endpoint: Endpoint,
        playback: PlaybackSession,
        transport: TransportConfig,
    ) -> Self {
        Self {
            endpoint,
            playback,
            transport,
        }
    }

    /// Route one line of input.
    ///
    /// Parse and transport failures come back as errors for the loop to
    /// surface; they never tear the loop down. Validation happens before
    /// any connection is opened.
    pub async fn dispatch_line(&self, line: &str) -> Result<DispatchOutcome, ClientError> {
        let Some(command) = Command::parse(line)? else {
            return Ok(DispatchOutcome::Ignored);
        };
        self.dispatch(command).await
    }

    async fn dispatch(&self, command: Command) -> Result<DispatchOutcome, ClientError> {
        let label = command.as_str();

        match command.response_kind() {
            ResponseKind::Stream => {
                let Command::Play(track) = command else {
                    return Ok(DispatchOutcome::Ignored);
                };
                if let Err(err) = self.playback.start(&self.endpoint, track).await {
                    record_exchange_failed(label, &err);
                    return Err(err.into());
                }
                Ok(DispatchOutcome::Playing)
            }
            ResponseKind::Bounded => {
                let Some(wire) = command.wire_text() else {
                    return Ok(DispatchOutcome::Ignored);
                };
                match self.bounded_exchange(&wire).await {
                    Ok(payload) => Ok(DispatchOutcome::Reply(payload)),
                    Err(err) => {
                        record_exchange_failed(label, &err);
                        Err(err.into())
                    }
                }
            }
            ResponseKind::Local => {
                // Both local commands tear down playback; cleanup runs
                // unconditionally, bounded by the stop grace period.
                let exit = matches!(command, Command::Exit);
                self.playback.stop().await;
                Ok(if exit {
                    DispatchOutcome::Exit
                } else {
                    DispatchOutcome::Stopped
                })
            }
        }
    }

    async fn bounded_exchange(&self, wire: &str) -> Result<String, TransportError> {
        let exchange = Exchange::open(&self.endpoint, wire, &self.transport).await?;
        exchange.read_bounded().await
    }

    /// The interactive loop.
    ///
    /// Every failure is reported as a single diagnostic line and the
    /// loop continues; only `exit` or end of input leaves it, and both
    /// stop playback first.
    pub async fn run<S: CommandSource>(&self, mut source: S) -> Result<()> {
        loop {
            print!(">> ");
            let _ = std::io::stdout().flush();

            let line = match source.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.playback.stop().await;
                    break;
                }
                Err(err) => {
                    warn!(target: "dispatcher", %err, "failed to read command input");
                    self.playback.stop().await;
                    break;
                }
            };

            match self.dispatch_line(&line).await {
                Ok(DispatchOutcome::Reply(payload)) => {
                    print!("{payload}");
                    if !payload.ends_with('\n') {
                        println!();
                    }
                }
                Ok(DispatchOutcome::Exit) => {
                    println!("Goodbye!");
                    break;
                }
                Ok(
                    DispatchOutcome::Playing
                    | DispatchOutcome::Stopped
                    | DispatchOutcome::Ignored,
                ) => {}
                Err(ClientError::Parse(ParseError::UnknownCommand(_))) => {
                    eprintln!("ERROR: unknown command");
                }
                Err(err) => {
                    eprintln!("ERROR: {err}");
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn playback(&self) -> &PlaybackSession {
        &self.playback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SilentRenderer;
    use crate::playback::PlaybackConfig;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    struct ScriptedSource {
        lines: VecDeque<String>,
    }

    impl ScriptedSource {
        fn new(lines: Vec<&str>) -> Self {
            Self {
                lines: lines.into_iter().map(String::from).collect(),
            }
        }
    }

    #[async_trait]
    impl CommandSource for ScriptedSource {
        async fn next_line(&mut self) -> std::io::Result<Option<String>> {
            Ok(self.lines.pop_front())
        }
    }

    fn dispatcher_for(endpoint: Endpoint, transport: TransportConfig) -> CommandDispatcher {
        let playback = PlaybackSession::new(
            Arc::new(SilentRenderer),
            PlaybackConfig {
                stop_grace: Duration::from_millis(200),
                chunk_bytes: 2_048,
            },
            transport.clone(),
        );
        CommandDispatcher::new(endpoint, playback, transport)
    }

    fn quick_transport() -> TransportConfig {
        TransportConfig {
            first_byte_deadline: Duration::from_millis(200),
            idle_gap: Duration::from_millis(80),
            chunk_bytes: 2_048,
        }
    }

    /// Counts accepted connections and holds them open without ever
    /// answering.
    async fn spawn_counting_listener() -> (Endpoint, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let accepts = Arc::new(AtomicUsize::new(0));
        let accept_counter = Arc::clone(&accepts);

        tokio::spawn(async move {
            let mut sockets = Vec::new();
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                accept_counter.fetch_add(1, Ordering::SeqCst);
                sockets.push(socket);
            }
        });

        (Endpoint::new("127.0.0.1", port), accepts)
    }

    #[tokio::test]
    async fn unknown_commands_fail_without_side_effects() {
        let (endpoint, accepts) = spawn_counting_listener().await;
        let dispatcher = dispatcher_for(endpoint, quick_transport());

        let result = dispatcher.dispatch_line("frobnicate").await;
        assert!(matches!(
            result,
            Err(ClientError::Parse(ParseError::UnknownCommand(_)))
        ));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_index_never_touches_the_network() {
        let (endpoint, accepts) = spawn_counting_listener().await;
        let dispatcher = dispatcher_for(endpoint, quick_transport());

        let result = dispatcher.dispatch_line("info abc").await;
        assert!(matches!(
            result,
            Err(ClientError::Parse(ParseError::InvalidIndex(_)))
        ));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blank_lines_are_ignored() {
        let (endpoint, _accepts) = spawn_counting_listener().await;
        let dispatcher = dispatcher_for(endpoint, quick_transport());

        assert_eq!(
            dispatcher.dispatch_line("").await.expect("blank"),
            DispatchOutcome::Ignored
        );
        assert_eq!(
            dispatcher.dispatch_line("   ").await.expect("spaces"),
            DispatchOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn list_returns_the_payload_exactly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut prefix = [0_u8; 2];
            socket.read_exact(&mut prefix).await.expect("prefix");
            let mut command = vec![0_u8; u16::from_be_bytes(prefix) as usize];
            socket.read_exact(&mut command).await.expect("command");
            assert_eq!(command, b"list");
            socket
                .write_all(b"1: Song A\n2: Song B\n")
                .await
                .expect("write");
        });

        let dispatcher = dispatcher_for(Endpoint::new("127.0.0.1", port), quick_transport());
        let outcome = dispatcher.dispatch_line("list").await.expect("list");
        assert_eq!(
            outcome,
            DispatchOutcome::Reply("1: Song A\n2: Song B\n".to_string())
        );
    }

    #[tokio::test]
    async fn silent_server_yields_a_response_timeout() {
        let (endpoint, _accepts) = spawn_counting_listener().await;
        let dispatcher = dispatcher_for(endpoint, quick_transport());

        let result = timeout(Duration::from_secs(1), dispatcher.dispatch_line("list"))
            .await
            .expect("bounded read must not hang");
        assert!(matches!(
            result,
            Err(ClientError::Transport(
                TransportError::ResponseTimeout { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn connection_failures_are_reported_not_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let dispatcher = dispatcher_for(Endpoint::new("127.0.0.1", port), quick_transport());
        let result = dispatcher.dispatch_line("list").await;
        assert!(matches!(
            result,
            Err(ClientError::Transport(TransportError::Connect { .. }))
        ));

        // The dispatcher is still usable afterwards.
        assert_eq!(
            dispatcher.dispatch_line("stop").await.expect("stop"),
            DispatchOutcome::Stopped
        );
    }

    #[tokio::test]
    async fn stop_while_idle_is_not_an_error() {
        let (endpoint, _accepts) = spawn_counting_listener().await;
        let dispatcher = dispatcher_for(endpoint, quick_transport());

        assert_eq!(
            dispatcher.dispatch_line("stop").await.expect("stop"),
            DispatchOutcome::Stopped
        );
    }

    #[tokio::test]
    async fn exit_stops_playback_before_leaving() {
        // A server that streams forever so playback is genuinely live.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut frame = [0_u8; 2];
                    if socket.read_exact(&mut frame).await.is_err() {
                        return;
                    }
                    let mut command = vec![0_u8; u16::from_be_bytes(frame) as usize];
                    if socket.read_exact(&mut command).await.is_err() {
                        return;
                    }
                    loop {
                        if socket.write_all(&[0_u8; 128]).await.is_err() {
                            break;
                        }
                        sleep(Duration::from_millis(5)).await;
                    }
                });
            }
        });

        let dispatcher = dispatcher_for(Endpoint::new("127.0.0.1", port), quick_transport());

        dispatcher.dispatch_line("play").await.expect("play");
        sleep(Duration::from_millis(50)).await;
        assert!(dispatcher.playback().is_active().await);

        let outcome = timeout(Duration::from_secs(1), dispatcher.dispatch_line("exit"))
            .await
            .expect("exit must be bounded")
            .expect("exit");
        assert_eq!(outcome, DispatchOutcome::Exit);
        assert!(!dispatcher.playback().is_active().await);
    }

    #[tokio::test]
    async fn run_loop_terminates_on_exit_and_end_of_input() {
        let (endpoint, _accepts) = spawn_counting_listener().await;

        let dispatcher = dispatcher_for(endpoint.clone(), quick_transport());
        let source = ScriptedSource::new(vec!["nonsense", "stop", "exit", "never reached"]);
        timeout(Duration::from_secs(1), dispatcher.run(source))
            .await
            .expect("run must return after exit")
            .expect("run");

        // End of input behaves as exit.
        let dispatcher = dispatcher_for(endpoint, quick_transport());
        let source = ScriptedSource::new(vec!["stop"]);
        timeout(Duration::from_secs(1), dispatcher.run(source))
            .await
            .expect("run must return at end of input")
            .expect("run");
    }
}
