//! Error types for the server crate

use shared::{ConfigError, PlayerId, ProtocolError};
use std::net::SocketAddr;
use thiserror::Error;

/// Failures raised by the physics world
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorldError {
    #[error("invalid world configuration: {0}")]
    Configuration(String),
    #[error("player {0} already exists in the world")]
    DuplicateId(PlayerId),
    #[error("player {0} does not exist in the world")]
    NotFound(PlayerId),
    #[error("rejected input for player {id}: {reason}")]
    InvalidInput { id: PlayerId, reason: &'static str },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("message from unregistered client {0}")]
    UnknownClient(SocketAddr),
    #[error("server full ({max} players), rejected {addr}")]
    ServerFull { addr: SocketAddr, max: usize },
    #[error(transparent)]
    World(#[from] WorldError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("player ids exhausted, rejected {0}")]
    IdsExhausted(SocketAddr),
    #[error("recording must start before the first tick, game is at tick {0}")]
    RecordingAfterStart(u64),
    #[error("server already started")]
    AlreadyStarted,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Per-message failures that are dropped without affecting the tick
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ServerError::Protocol(_)
                | ServerError::UnknownClient(_)
                | ServerError::ServerFull { .. }
                | ServerError::IdsExhausted(_)
                | ServerError::World(WorldError::NotFound(_))
                | ServerError::World(WorldError::InvalidInput { .. })
        )
    }
}
