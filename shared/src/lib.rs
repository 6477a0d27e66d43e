//! Types shared by the arena server and anything that talks to it:
//! the wire protocol, configuration and the LAN discovery packet format.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod config;
pub mod discovery;
pub mod protocol;

pub use config::{ConfigError, DiscoveryConfig, ServerConfig, SpawnPolicy, WorldConfig};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};

pub const DEFAULT_PORT: u16 = 11337;
pub const DEFAULT_DISCOVERY_PORT: u16 = 11338;
pub const DEFAULT_SERVICE_NAME: &str = "multibox-arena";

/// Server-assigned player identifier, stable for the lifetime of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub u32);

impl PlayerId {
    /// Largest id that fits the signed 32-bit id field on the wire
    pub const MAX: PlayerId = PlayerId(i32::MAX as u32);
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of a position broadcast
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub id: PlayerId,
    pub x: f32,
    pub y: f32,
    /// Orientation in radians
    pub angle: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_id_ordering_and_display() {
        let mut ids = vec![PlayerId(3), PlayerId(1), PlayerId(2)];
        ids.sort();
        assert_eq!(ids, vec![PlayerId(1), PlayerId(2), PlayerId(3)]);
        assert_eq!(PlayerId(42).to_string(), "42");
        assert_eq!(PlayerId::MAX.0, 2_147_483_647);
    }
}
