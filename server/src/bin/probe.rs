//! Headless client: finds a server, joins, pushes a velocity and prints broadcasts

use clap::Parser;
use log::{info, warn};
use server::discovery::{discover_service, DiscoveryError};
use shared::protocol::MAX_DATAGRAM_SIZE;
use shared::{ClientMessage, ServerMessage, DEFAULT_DISCOVERY_PORT, DEFAULT_SERVICE_NAME};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address; discovered on the LAN when omitted
    #[arg(short = 's', long)]
    server: Option<SocketAddr>,

    /// Service name to look for during discovery
    #[arg(long, default_value = DEFAULT_SERVICE_NAME)]
    service: String,

    /// Port the server announces itself on
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    /// Seconds to wait for an announcement
    #[arg(long, default_value = "3")]
    discovery_timeout: u64,

    /// Requested horizontal velocity
    #[arg(long, default_value = "50", allow_hyphen_values = true)]
    vx: f32,

    /// Requested vertical velocity
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    vy: f32,

    /// Number of broadcasts to print before leaving
    #[arg(short, long, default_value = "30")]
    ticks: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let server_addr = match args.server {
        Some(addr) => addr,
        None => {
            let wait = Duration::from_secs(args.discovery_timeout);
            match discover_service(&args.service, args.discovery_port, wait).await {
                Ok(addr) => addr,
                Err(DiscoveryError::Timeout { .. }) => {
                    println!("no server found");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    info!("Probe bound to {}, joining {}", socket.local_addr()?, server_addr);

    socket
        .send_to(&ClientMessage::Connect.encode(), server_addr)
        .await?;
    socket
        .send_to(
            &ClientMessage::UpdateVelocity {
                vx: args.vx,
                vy: args.vy,
            }
            .encode(),
            server_addr,
        )
        .await?;

    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut received = 0;
    while received < args.ticks {
        let (len, from) = match timeout(Duration::from_secs(2), socket.recv_from(&mut buffer)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("No broadcast from {} for 2s", server_addr);
                break;
            }
        };
        if from != server_addr {
            continue;
        }

        match ServerMessage::decode(&buffer[..len]) {
            Ok(ServerMessage::PositionBroadcast(players)) => {
                received += 1;
                let line: Vec<String> = players
                    .iter()
                    .map(|p| format!("{}:({:.2}, {:.2}, {:.2})", p.id, p.x, p.y, p.angle))
                    .collect();
                println!("[{}] {}", received, line.join(" "));
            }
            Err(e) => warn!("Undecodable datagram from {}: {}", from, e),
        }
    }

    socket
        .send_to(&ClientMessage::Disconnect.encode(), server_addr)
        .await?;
    info!("Probe finished after {} broadcasts", received);

    Ok(())
}
