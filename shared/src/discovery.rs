//! LAN announcement packet used to locate a running server.
//!
//! The server periodically sends the encoded announcement to the discovery
//! port; clients listen there and read the game port from it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Marks a datagram as a multibox announcement
pub const DISCOVERY_MAGIC: &[u8; 8] = b"MBOXDSC1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAnnouncement {
    pub service_name: String,
    /// UDP port the game server listens on
    pub port: u16,
}

impl ServiceAnnouncement {
    pub fn new(service_name: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            port,
        }
    }
}

#[derive(Debug, Error)]
pub enum AnnouncementError {
    #[error("invalid discovery magic")]
    InvalidMagic,
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub fn encode_announcement(announcement: &ServiceAnnouncement) -> Result<Vec<u8>, AnnouncementError> {
    let mut payload = Vec::with_capacity(64);
    payload.extend_from_slice(DISCOVERY_MAGIC);
    payload.extend_from_slice(&bincode::serialize(announcement)?);
    Ok(payload)
}

pub fn decode_announcement(bytes: &[u8]) -> Result<ServiceAnnouncement, AnnouncementError> {
    let body = bytes
        .strip_prefix(DISCOVERY_MAGIC.as_slice())
        .ok_or(AnnouncementError::InvalidMagic)?;
    Ok(bincode::deserialize(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_announcement() {
        let announcement = ServiceAnnouncement::new("arena", 11337);
        let encoded = encode_announcement(&announcement).unwrap();

        assert_eq!(&encoded[..8], DISCOVERY_MAGIC);
        let decoded = decode_announcement(&encoded).unwrap();
        assert_eq!(decoded.service_name, "arena");
        assert_eq!(decoded.port, 11337);
    }

    #[test]
    fn test_foreign_packets_are_rejected() {
        assert!(matches!(
            decode_announcement(b"/connect\0\0\0\0,\0\0\0"),
            Err(AnnouncementError::InvalidMagic)
        ));
        assert!(matches!(
            decode_announcement(&[]),
            Err(AnnouncementError::InvalidMagic)
        ));

        let mut truncated = DISCOVERY_MAGIC.to_vec();
        truncated.push(3);
        assert!(matches!(
            decode_announcement(&truncated),
            Err(AnnouncementError::Serialization(_))
        ));
    }
}
