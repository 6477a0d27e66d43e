use clap::Parser;
use log::{error, info};
use server::network::Server;
use shared::ServerConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON file with server and world settings; flags below override it
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Server IP address to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Server port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Tick rate (updates per second)
    #[arg(short, long)]
    tick_rate: Option<u32>,

    /// Maximum number of concurrent players
    #[arg(short, long)]
    max_clients: Option<usize>,

    /// Remove players that send nothing for this many seconds
    #[arg(long)]
    timeout_secs: Option<f32>,

    /// Do not announce the server on the LAN
    #[arg(long)]
    no_discovery: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, shared::ConfigError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(tick_rate) = self.tick_rate {
            config.tick_rate = tick_rate;
        }
        if let Some(max_clients) = self.max_clients {
            config.max_clients = max_clients;
        }
        if self.timeout_secs.is_some() {
            config.client_timeout_secs = self.timeout_secs;
        }
        if self.no_discovery {
            config.discovery.enabled = false;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = Args::parse().into_config()?;
    info!(
        "Starting server on {} at {}Hz (max {} players)",
        config.bind_addr(),
        config.tick_rate,
        config.max_clients
    );

    let mut server = Server::new(config).await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        shutdown.shutdown();
    });

    server.run().await?;

    Ok(())
}
