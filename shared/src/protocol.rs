//! Wire protocol spoken between the arena server and its clients
//!
//! Every datagram carries exactly one message in OSC framing:
//! - an address pattern (`/connect`, `/update_velocity`, ...) as a
//!   NUL-terminated string padded to a 4-byte boundary
//! - a type tag string starting with `,` (one tag per argument), padded the same way
//! - the arguments themselves, big-endian, 4 bytes each
//!
//! Decoding is pure and total: any byte sequence either yields a typed
//! message or a [`ProtocolError`]. Nothing in here panics on hostile input.

use crate::{PlayerId, PlayerState};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

pub const CONNECT_ADDRESS: &str = "/connect";
pub const UPDATE_VELOCITY_ADDRESS: &str = "/update_velocity";
pub const DISCONNECT_ADDRESS: &str = "/disconnect";
pub const UPDATE_POSITION_ADDRESS: &str = "/update_position";

/// Upper bound for a single datagram, large enough for a few hundred players
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// Errors produced while decoding a datagram
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("datagram truncated while reading {0}")]
    Truncated(&'static str),
    #[error("string field is not NUL-terminated valid UTF-8")]
    InvalidString,
    #[error("address pattern {0:?} does not start with '/'")]
    InvalidAddress(String),
    #[error("type tag string missing or not starting with ','")]
    MissingTypeTags,
    #[error("unsupported argument type tag {0:?}")]
    UnsupportedTag(char),
    #[error("unknown message address {0}")]
    UnknownAddress(String),
    #[error("{address} expects {expected} arguments, got {found}")]
    Arity {
        address: &'static str,
        expected: &'static str,
        found: usize,
    },
    #[error("{address} argument {index} has wrong type (expected {expected})")]
    ArgumentType {
        address: &'static str,
        index: usize,
        expected: &'static str,
    },
    #[error("{0} unexpected trailing bytes after arguments")]
    TrailingBytes(usize),
    #[error("player id {0} does not fit the 32-bit id field")]
    IdOutOfRange(PlayerId),
}

/// A single typed OSC argument
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Argument {
    Int(i32),
    Float(f32),
}

impl Argument {
    fn tag(&self) -> u8 {
        match self {
            Argument::Int(_) => b'i',
            Argument::Float(_) => b'f',
        }
    }

    /// Reads the argument as a float, widening integers
    pub fn as_f32(&self) -> f32 {
        match *self {
            Argument::Int(value) => value as f32,
            Argument::Float(value) => value,
        }
    }
}

/// Address pattern plus arguments, before interpretation
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub address: String,
    pub args: Vec<Argument>,
}

impl RawMessage {
    pub fn new(address: impl Into<String>, args: Vec<Argument>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }

    /// Serializes the message into OSC framing
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(
            padded_len(self.address.len()) + padded_len(self.args.len() + 1) + self.args.len() * 4,
        );

        put_padded_str(&mut buf, self.address.as_bytes());

        let mut tags = Vec::with_capacity(self.args.len() + 1);
        tags.push(b',');
        tags.extend(self.args.iter().map(Argument::tag));
        put_padded_str(&mut buf, &tags);

        for arg in &self.args {
            match *arg {
                Argument::Int(value) => buf.put_i32(value),
                Argument::Float(value) => buf.put_f32(value),
            }
        }

        buf.to_vec()
    }

    /// Parses OSC framing without looking at the address semantics
    pub fn decode(mut data: &[u8]) -> Result<Self, ProtocolError> {
        let address = read_padded_str(&mut data, "address")?;
        if !address.starts_with('/') {
            return Err(ProtocolError::InvalidAddress(address));
        }

        if data.is_empty() {
            return Err(ProtocolError::MissingTypeTags);
        }
        let tags = read_padded_str(&mut data, "type tags")?;
        let tags = tags
            .strip_prefix(',')
            .ok_or(ProtocolError::MissingTypeTags)?;

        let mut args = Vec::with_capacity(tags.len());
        for tag in tags.chars() {
            let arg = match tag {
                'i' => {
                    ensure_remaining(data, 4, "int argument")?;
                    Argument::Int(data.get_i32())
                }
                'f' => {
                    ensure_remaining(data, 4, "float argument")?;
                    Argument::Float(data.get_f32())
                }
                other => return Err(ProtocolError::UnsupportedTag(other)),
            };
            args.push(arg);
        }

        if !data.is_empty() {
            return Err(ProtocolError::TrailingBytes(data.len()));
        }

        Ok(Self { address, args })
    }
}

/// Messages a client may send to the server
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientMessage {
    Connect,
    UpdateVelocity { vx: f32, vy: f32 },
    Disconnect,
}

impl ClientMessage {
    pub fn address(&self) -> &'static str {
        match self {
            ClientMessage::Connect => CONNECT_ADDRESS,
            ClientMessage::UpdateVelocity { .. } => UPDATE_VELOCITY_ADDRESS,
            ClientMessage::Disconnect => DISCONNECT_ADDRESS,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let args = match *self {
            ClientMessage::Connect | ClientMessage::Disconnect => Vec::new(),
            ClientMessage::UpdateVelocity { vx, vy } => {
                vec![Argument::Float(vx), Argument::Float(vy)]
            }
        };
        RawMessage::new(self.address(), args).encode()
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let raw = RawMessage::decode(data)?;
        match raw.address.as_str() {
            CONNECT_ADDRESS => {
                expect_no_args(CONNECT_ADDRESS, &raw.args)?;
                Ok(ClientMessage::Connect)
            }
            DISCONNECT_ADDRESS => {
                expect_no_args(DISCONNECT_ADDRESS, &raw.args)?;
                Ok(ClientMessage::Disconnect)
            }
            UPDATE_VELOCITY_ADDRESS => match raw.args.as_slice() {
                [vx, vy] => Ok(ClientMessage::UpdateVelocity {
                    vx: vx.as_f32(),
                    vy: vy.as_f32(),
                }),
                other => Err(ProtocolError::Arity {
                    address: UPDATE_VELOCITY_ADDRESS,
                    expected: "2",
                    found: other.len(),
                }),
            },
            _ => Err(ProtocolError::UnknownAddress(raw.address)),
        }
    }
}

/// Messages the server sends to clients
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// One `(id, x, y, angle)` entry per registered player
    PositionBroadcast(Vec<PlayerState>),
}

/// Encoded size of a `/update_position` datagram carrying `players` entries
pub fn position_broadcast_len(players: usize) -> usize {
    let tags = 1 + players * 4;
    padded_len(UPDATE_POSITION_ADDRESS.len()) + padded_len(tags) + players * 16
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            ServerMessage::PositionBroadcast(players) => {
                let mut args = Vec::with_capacity(players.len() * 4);
                for player in players {
                    let id = i32::try_from(player.id.0)
                        .map_err(|_| ProtocolError::IdOutOfRange(player.id))?;
                    args.push(Argument::Int(id));
                    args.push(Argument::Float(player.x));
                    args.push(Argument::Float(player.y));
                    args.push(Argument::Float(player.angle));
                }
                Ok(RawMessage::new(UPDATE_POSITION_ADDRESS, args).encode())
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let raw = RawMessage::decode(data)?;
        if raw.address != UPDATE_POSITION_ADDRESS {
            return Err(ProtocolError::UnknownAddress(raw.address));
        }
        if raw.args.len() % 4 != 0 {
            return Err(ProtocolError::Arity {
                address: UPDATE_POSITION_ADDRESS,
                expected: "a multiple of 4",
                found: raw.args.len(),
            });
        }

        let mut players = Vec::with_capacity(raw.args.len() / 4);
        for (chunk_index, chunk) in raw.args.chunks_exact(4).enumerate() {
            let base = chunk_index * 4;
            let id = match chunk[0] {
                Argument::Int(id) if id >= 0 => PlayerId(id as u32),
                _ => return Err(position_type_error(base, "non-negative int")),
            };
            let mut floats = [0.0f32; 3];
            for (offset, slot) in floats.iter_mut().enumerate() {
                match chunk[offset + 1] {
                    Argument::Float(value) => *slot = value,
                    Argument::Int(_) => return Err(position_type_error(base + offset + 1, "float")),
                }
            }
            players.push(PlayerState {
                id,
                x: floats[0],
                y: floats[1],
                angle: floats[2],
            });
        }

        Ok(ServerMessage::PositionBroadcast(players))
    }
}

fn position_type_error(index: usize, expected: &'static str) -> ProtocolError {
    ProtocolError::ArgumentType {
        address: UPDATE_POSITION_ADDRESS,
        index,
        expected,
    }
}

fn expect_no_args(address: &'static str, args: &[Argument]) -> Result<(), ProtocolError> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::Arity {
            address,
            expected: "0",
            found: args.len(),
        })
    }
}

fn padded_len(len: usize) -> usize {
    // One NUL terminator, then round up to the next multiple of 4
    (len + 4) & !3
}

fn put_padded_str(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_slice(bytes);
    buf.put_bytes(0, padded_len(bytes.len()) - bytes.len());
}

fn read_padded_str(data: &mut &[u8], what: &'static str) -> Result<String, ProtocolError> {
    let end = data
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::Truncated(what))?;
    let total = padded_len(end);
    ensure_remaining(data, total, what)?;

    let text = std::str::from_utf8(&data[..end])
        .map_err(|_| ProtocolError::InvalidString)?
        .to_owned();
    if data[end..total].iter().any(|&b| b != 0) {
        return Err(ProtocolError::InvalidString);
    }

    data.advance(total);
    Ok(text)
}

fn ensure_remaining(data: &[u8], needed: usize, what: &'static str) -> Result<(), ProtocolError> {
    if data.remaining() < needed {
        Err(ProtocolError::Truncated(what))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_connect_wire_layout() {
        let bytes = ClientMessage::Connect.encode();
        // "/connect" is 8 bytes -> 12 with terminator padding, "," -> 4
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..8], b"/connect");
        assert_eq!(&bytes[8..12], &[0, 0, 0, 0]);
        assert_eq!(&bytes[12..16], b",\0\0\0");
    }

    #[test]
    fn test_update_velocity_wire_layout() {
        let bytes = ClientMessage::UpdateVelocity { vx: 1.0, vy: -2.0 }.encode();
        // "/update_velocity" (16) -> 20, ",ff" -> 4, two floats -> 8
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[20..24], b",ff\0");
        assert_eq!(&bytes[24..28], &1.0f32.to_be_bytes());
        assert_eq!(&bytes[28..32], &(-2.0f32).to_be_bytes());
    }

    #[test]
    fn test_decode_client_messages() {
        assert_eq!(
            ClientMessage::decode(&ClientMessage::Connect.encode()),
            Ok(ClientMessage::Connect)
        );
        assert_eq!(
            ClientMessage::decode(&ClientMessage::Disconnect.encode()),
            Ok(ClientMessage::Disconnect)
        );

        match ClientMessage::decode(&ClientMessage::UpdateVelocity { vx: 5.0, vy: 0.5 }.encode()) {
            Ok(ClientMessage::UpdateVelocity { vx, vy }) => {
                assert_approx_eq!(vx, 5.0);
                assert_approx_eq!(vy, 0.5);
            }
            other => panic!("Unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_update_velocity_accepts_integer_arguments() {
        let bytes = RawMessage::new(
            UPDATE_VELOCITY_ADDRESS,
            vec![Argument::Int(-1), Argument::Int(1)],
        )
        .encode();

        assert_eq!(
            ClientMessage::decode(&bytes),
            Ok(ClientMessage::UpdateVelocity { vx: -1.0, vy: 1.0 })
        );
    }

    #[test]
    fn test_wrong_arity_is_rejected() {
        let bytes = RawMessage::new(UPDATE_VELOCITY_ADDRESS, vec![Argument::Float(1.0)]).encode();
        assert!(matches!(
            ClientMessage::decode(&bytes),
            Err(ProtocolError::Arity { found: 1, .. })
        ));

        let bytes = RawMessage::new(CONNECT_ADDRESS, vec![Argument::Int(7)]).encode();
        assert!(matches!(
            ClientMessage::decode(&bytes),
            Err(ProtocolError::Arity { found: 1, .. })
        ));
    }

    #[test]
    fn test_unsupported_type_tag_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"/update_velocity\0\0\0\0");
        bytes.extend_from_slice(b",ss\0");
        bytes.extend_from_slice(b"ab\0\0cd\0\0");

        assert_eq!(
            ClientMessage::decode(&bytes),
            Err(ProtocolError::UnsupportedTag('s'))
        );
    }

    #[test]
    fn test_unknown_address_is_rejected() {
        let bytes = RawMessage::new("/teleport", vec![]).encode();
        assert_eq!(
            ClientMessage::decode(&bytes),
            Err(ProtocolError::UnknownAddress("/teleport".to_string()))
        );
    }

    #[test]
    fn test_garbage_never_panics() {
        let valid = ClientMessage::UpdateVelocity { vx: 3.0, vy: 4.0 }.encode();

        for len in 0..valid.len() {
            assert!(ClientMessage::decode(&valid[..len]).is_err());
        }

        assert!(ClientMessage::decode(&[]).is_err());
        assert!(ClientMessage::decode(&[0xFF; 64]).is_err());
        assert!(ClientMessage::decode(b"connect\0,\0\0\0").is_err());

        let mut trailing = valid.clone();
        trailing.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(
            ClientMessage::decode(&trailing),
            Err(ProtocolError::TrailingBytes(4))
        );
    }

    #[test]
    fn test_missing_type_tags() {
        assert_eq!(
            ClientMessage::decode(b"/connect\0\0\0\0"),
            Err(ProtocolError::MissingTypeTags)
        );
    }

    #[test]
    fn test_position_broadcast_layout_and_decode() {
        let players = vec![
            PlayerState {
                id: PlayerId(1),
                x: 0.5,
                y: 2.0,
                angle: 0.0,
            },
            PlayerState {
                id: PlayerId(7),
                x: -3.0,
                y: 4.25,
                angle: 1.5,
            },
        ];

        let bytes = ServerMessage::PositionBroadcast(players.clone()).encode().unwrap();
        // "/update_position" -> 20, ",ifffifff" (9) -> 12, 8 args -> 32
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[20..32], b",ifffifff\0\0\0");

        match ServerMessage::decode(&bytes) {
            Ok(ServerMessage::PositionBroadcast(decoded)) => assert_eq!(decoded, players),
            Err(e) => panic!("Failed to decode broadcast: {}", e),
        }
    }

    #[test]
    fn test_empty_position_broadcast() {
        let bytes = ServerMessage::PositionBroadcast(Vec::new()).encode().unwrap();
        assert_eq!(
            ServerMessage::decode(&bytes),
            Ok(ServerMessage::PositionBroadcast(Vec::new()))
        );
    }

    #[test]
    fn test_position_broadcast_with_bad_entry_types() {
        let bytes = RawMessage::new(
            UPDATE_POSITION_ADDRESS,
            vec![
                Argument::Float(1.0),
                Argument::Float(1.0),
                Argument::Float(1.0),
                Argument::Float(1.0),
            ],
        )
        .encode();

        assert!(matches!(
            ServerMessage::decode(&bytes),
            Err(ProtocolError::ArgumentType { index: 0, .. })
        ));

        let bytes = RawMessage::new(UPDATE_POSITION_ADDRESS, vec![Argument::Int(1)]).encode();
        assert!(matches!(
            ServerMessage::decode(&bytes),
            Err(ProtocolError::Arity { found: 1, .. })
        ));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let message = ServerMessage::PositionBroadcast(vec![PlayerState {
            id: PlayerId(3),
            x: 10.0,
            y: 20.0,
            angle: 0.25,
        }]);
        assert_eq!(message.encode().unwrap(), message.encode().unwrap());
    }

    #[test]
    fn test_broadcast_length_matches_encoding() {
        for count in [0usize, 1, 2, 3, 7, 64, 400] {
            let players: Vec<PlayerState> = (0..count)
                .map(|i| PlayerState {
                    id: PlayerId(i as u32 + 1),
                    x: i as f32,
                    y: 0.0,
                    angle: 0.0,
                })
                .collect();
            let bytes = ServerMessage::PositionBroadcast(players).encode().unwrap();
            assert_eq!(bytes.len(), position_broadcast_len(count), "{} players", count);
        }
    }

    #[test]
    fn test_ids_beyond_wire_range_are_refused() {
        let at_limit = ServerMessage::PositionBroadcast(vec![PlayerState {
            id: PlayerId::MAX,
            x: 0.0,
            y: 0.0,
            angle: 0.0,
        }]);
        let bytes = at_limit.encode().unwrap();
        assert_eq!(ServerMessage::decode(&bytes), Ok(at_limit));

        let beyond = ServerMessage::PositionBroadcast(vec![PlayerState {
            id: PlayerId(PlayerId::MAX.0 + 1),
            x: 0.0,
            y: 0.0,
            angle: 0.0,
        }]);
        assert_eq!(
            beyond.encode(),
            Err(ProtocolError::IdOutOfRange(PlayerId(2_147_483_648)))
        );
    }
}
