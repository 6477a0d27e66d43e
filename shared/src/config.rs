//! Server and world configuration
//!
//! Every field has a default mirroring the classic multibox arena, so a JSON
//! file only needs to list the values it wants to change.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use thiserror::Error;

use crate::protocol::{position_broadcast_len, MAX_DATAGRAM_SIZE};
use crate::{DEFAULT_DISCOVERY_PORT, DEFAULT_PORT, DEFAULT_SERVICE_NAME};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Physics parameters, fixed for the lifetime of the world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Constant acceleration applied to every body
    pub gravity: (f32, f32),
    /// Lower-left corner of the arena
    pub arena_origin: (f32, f32),
    /// Arena width and height
    pub arena_size: (f32, f32),
    pub restitution: f32,
    pub friction: f32,
    /// Upper bound on any body's speed
    pub max_speed: f32,
    pub player_radius: f32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            gravity: (0.0, 98.0),
            arena_origin: (0.0, 0.0),
            arena_size: (700.0, 400.0),
            restitution: 0.95,
            friction: 0.8,
            max_speed: 200.0,
            player_radius: 25.0,
        }
    }
}

/// How the registry picks a spawn point for a new player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpawnPolicy {
    /// Every player appears at the same point
    Fixed { x: f32, y: f32 },
    /// Players fill a grid row by row
    Grid {
        origin: (f32, f32),
        spacing: f32,
        columns: u32,
    },
    /// Uniformly inside the arena, from a seeded generator
    Random { seed: u64 },
}

impl Default for SpawnPolicy {
    fn default() -> Self {
        SpawnPolicy::Fixed { x: 50.0, y: 100.0 }
    }
}

/// LAN announcement settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub service_name: String,
    /// UDP port announcements are sent to and listened on
    pub lan_port: u16,
    /// Destination of announcements; the limited broadcast address by default
    pub announce_ip: IpAddr,
    pub interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            lan_port: DEFAULT_DISCOVERY_PORT,
            announce_ip: IpAddr::V4(Ipv4Addr::BROADCAST),
            interval_ms: 750,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Simulation steps per second
    pub tick_rate: u32,
    pub max_clients: usize,
    /// Capacity of the inbound datagram queue between receiver and game loop
    pub queue_capacity: usize,
    /// Remove players that stay silent this long; `None` keeps them forever
    pub client_timeout_secs: Option<f32>,
    pub spawn: SpawnPolicy,
    pub world: WorldConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            tick_rate: 60,
            max_clients: 32,
            queue_capacity: 1024,
            client_timeout_secs: None,
            spawn: SpawnPolicy::default(),
            world: WorldConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Fixed simulation step in seconds
    pub fn tick_dt(&self) -> f32 {
        1.0 / self.tick_rate as f32
    }

    /// Idle timeout expressed in whole ticks
    pub fn timeout_ticks(&self) -> Option<u64> {
        self.client_timeout_secs
            .map(|secs| (secs * self.tick_rate as f32).ceil().max(1.0) as u64)
    }

    /// Checks the scheduler-level settings; world parameters are checked when
    /// the world is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::Invalid("tick_rate must be positive".into()));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be positive".into()));
        }
        let full_broadcast = position_broadcast_len(self.max_clients);
        if full_broadcast > MAX_DATAGRAM_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_clients {} needs {} byte broadcasts, limit is {}",
                self.max_clients, full_broadcast, MAX_DATAGRAM_SIZE
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".into()));
        }
        if let Some(secs) = self.client_timeout_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(ConfigError::Invalid(
                    "client_timeout_secs must be a positive number".into(),
                ));
            }
        }
        if let SpawnPolicy::Grid { spacing, columns, .. } = self.spawn {
            if columns == 0 || !spacing.is_finite() || spacing <= 0.0 {
                return Err(ConfigError::Invalid(
                    "grid spawn needs positive spacing and columns".into(),
                ));
            }
        }
        if self.discovery.enabled && self.discovery.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "discovery interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
