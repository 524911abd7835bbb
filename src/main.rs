use anyhow::Result;
use clap::Parser;
use tracing::info;

use tunebox::audio::default_renderer;
use tunebox::dispatcher::{CommandDispatcher, StdinSource};
use tunebox::playback::{PlaybackConfig, PlaybackSession};
use tunebox::telemetry::init_tracing;
use tunebox::transport::{Endpoint, TransportConfig};

/// Interactive client for the tunebox streaming jukebox.
#[derive(Debug, Parser)]
#[command(name = "tunebox", version, about)]
struct Cli {
    /// Server port.
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,
    /// Server host name or address.
    ip: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing();

    let endpoint = Endpoint::new(cli.ip, cli.port);
    info!(target: "client", %endpoint, "jukebox client starting");

    let transport = TransportConfig::default();
    let playback = PlaybackSession::new(
        default_renderer(),
        PlaybackConfig::default(),
        transport.clone(),
    );
    let dispatcher = CommandDispatcher::new(endpoint, playback, transport);

    dispatcher.run(StdinSource::new()).await
}
