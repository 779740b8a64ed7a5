mod server;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use roomcast_core::{logging, Config};
use server::RoomcastServer;

/// Synchronized multi-client media playback coordinator.
#[derive(Debug, Parser)]
#[command(name = "roomcast", version, about)]
struct Args {
    /// KEY=VALUE configuration file; environment variables override it.
    #[arg(long, env = "ROOMCAST_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the media directory.
    #[arg(long)]
    media_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {e}"))?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(media_dir) = args.media_dir {
        config.media_dir = media_dir;
    }
    config.clamp_ranges();

    logging::init_logging(&config)?;
    info!(
        port = config.port,
        media_dir = %config.media_dir.display(),
        server_mode = config.server_mode,
        "roomcast starting"
    );

    let server = RoomcastServer::build(config).await?;
    server.run().await
}
