//! LAN service discovery
//!
//! A running server announces itself by periodically sending a
//! [`ServiceAnnouncement`] to the discovery port. Clients listen on that port
//! and take the first announcement carrying the service name they look for.

use log::{debug, info, warn};
use shared::discovery::{
    decode_announcement, encode_announcement, AnnouncementError, ServiceAnnouncement,
};
use shared::DiscoveryConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

const LISTEN_BUFFER_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("announcement error: {0}")]
    Announcement(#[from] AnnouncementError),
    #[error("no server announcing '{service}' found within {waited:?}")]
    Timeout { service: String, waited: Duration },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// Keeps the announcement task alive; dropping it stops the broadcasts
#[derive(Debug)]
pub struct ServiceHandle {
    handle: JoinHandle<()>,
    target: SocketAddr,
}

impl ServiceHandle {
    /// Where announcements are sent
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Starts announcing `name` with the game `port` on the LAN
pub fn register_service(
    name: &str,
    port: u16,
    config: &DiscoveryConfig,
) -> Result<ServiceHandle, DiscoveryError> {
    if config.lan_port == 0 {
        return Err(DiscoveryError::InvalidConfig(
            "lan_port must not be 0".into(),
        ));
    }
    if config.interval_ms == 0 {
        return Err(DiscoveryError::InvalidConfig(
            "interval_ms must be positive".into(),
        ));
    }

    let payload = encode_announcement(&ServiceAnnouncement::new(name, port))?;
    let socket = create_broadcast_socket()?;
    let target = SocketAddr::new(config.announce_ip, config.lan_port);
    let period = Duration::from_millis(config.interval_ms);

    let handle = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = socket.send_to(&payload, target).await {
                warn!("LAN announcement to {} failed: {}", target, e);
            }
        }
    });

    info!("Announcing '{}' (port {}) to {}", name, port, target);
    Ok(ServiceHandle { handle, target })
}

/// Socket bound to the discovery port, waiting for announcements
pub struct DiscoveryListener {
    socket: UdpSocket,
}

impl DiscoveryListener {
    pub fn bind(lan_port: u16) -> Result<Self, DiscoveryError> {
        let std_socket =
            std::net::UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), lan_port))?;
        std_socket.set_nonblocking(true)?;
        std_socket.set_broadcast(true)?;
        Ok(Self {
            socket: UdpSocket::from_std(std_socket)?,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        Ok(self.socket.local_addr()?)
    }

    /// Returns the game address of the first server announcing `name`
    pub async fn wait_for(&self, name: &str, wait: Duration) -> Result<SocketAddr, DiscoveryError> {
        match timeout(wait, self.next_match(name)).await {
            Ok(result) => result,
            Err(_) => Err(DiscoveryError::Timeout {
                service: name.to_string(),
                waited: wait,
            }),
        }
    }

    async fn next_match(&self, name: &str) -> Result<SocketAddr, DiscoveryError> {
        let mut buffer = [0u8; LISTEN_BUFFER_SIZE];
        loop {
            let (len, source) = self.socket.recv_from(&mut buffer).await?;
            let announcement = match decode_announcement(&buffer[..len]) {
                Ok(announcement) => announcement,
                Err(AnnouncementError::InvalidMagic) => continue,
                Err(e) => {
                    debug!("Ignoring broken announcement from {}: {}", source, e);
                    continue;
                }
            };

            if announcement.service_name != name {
                debug!(
                    "Skipping '{}' announced by {}",
                    announcement.service_name, source
                );
                continue;
            }

            return Ok(SocketAddr::new(source.ip(), announcement.port));
        }
    }
}

/// Listens on `lan_port` until a server announces `name` or `wait` elapses
pub async fn discover_service(
    name: &str,
    lan_port: u16,
    wait: Duration,
) -> Result<SocketAddr, DiscoveryError> {
    let listener = DiscoveryListener::bind(lan_port)?;
    let found = listener.wait_for(name, wait).await?;
    info!("Discovered '{}' at {}", name, found);
    Ok(found)
}

fn create_broadcast_socket() -> Result<UdpSocket, DiscoveryError> {
    let std_socket =
        std::net::UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
    std_socket.set_nonblocking(true)?;
    std_socket.set_broadcast(true)?;
    Ok(UdpSocket::from_std(std_socket)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config(lan_port: u16) -> DiscoveryConfig {
        DiscoveryConfig {
            enabled: true,
            service_name: "test-arena".to_string(),
            lan_port,
            announce_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            interval_ms: 20,
        }
    }

    #[tokio::test]
    async fn test_announcement_is_discovered() {
        let listener = DiscoveryListener::bind(0).unwrap();
        let lan_port = listener.local_addr().unwrap().port();

        let service = register_service("test-arena", 4242, &loopback_config(lan_port)).unwrap();
        assert_eq!(service.target().port(), lan_port);

        let found = listener
            .wait_for("test-arena", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(found.port(), 4242);
        assert!(found.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_other_services_are_ignored() {
        let listener = DiscoveryListener::bind(0).unwrap();
        let lan_port = listener.local_addr().unwrap().port();

        let _other = register_service("someone-else", 1111, &loopback_config(lan_port)).unwrap();
        let result = listener
            .wait_for("test-arena", Duration::from_millis(150))
            .await;

        assert!(matches!(result, Err(DiscoveryError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_foreign_datagrams_are_ignored() {
        let listener = DiscoveryListener::bind(0).unwrap();
        let lan_port = listener.local_addr().unwrap().port();

        let noise = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        noise
            .send_to(b"/connect\0\0\0\0,\0\0\0", ("127.0.0.1", lan_port))
            .await
            .unwrap();
        let _service = register_service("test-arena", 5151, &loopback_config(lan_port)).unwrap();

        let found = listener
            .wait_for("test-arena", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(found.port(), 5151);
    }

    #[tokio::test]
    async fn test_stopped_service_times_out() {
        let listener = DiscoveryListener::bind(0).unwrap();
        let lan_port = listener.local_addr().unwrap().port();

        let service = register_service("test-arena", 4242, &loopback_config(lan_port)).unwrap();
        service.stop();
        // Drain anything sent before the abort landed
        let _ = listener
            .wait_for("test-arena", Duration::from_millis(50))
            .await;

        let result = listener
            .wait_for("test-arena", Duration::from_millis(150))
            .await;
        assert!(matches!(result, Err(DiscoveryError::Timeout { .. })));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = loopback_config(0);
        assert!(matches!(
            register_service("x", 1, &config),
            Err(DiscoveryError::InvalidConfig(_))
        ));

        config.lan_port = 9999;
        config.interval_ms = 0;
        assert!(matches!(
            register_service("x", 1, &config),
            Err(DiscoveryError::InvalidConfig(_))
        ));
    }
}
