//! Player registry: which client address owns which body in the world
//!
//! This module handles the server-side bookkeeping of connected clients:
//! - Idempotent registration keyed by network address
//! - Spawn point selection through a pluggable [`SpawnPolicy`]
//! - Activity tracking in ticks, for the optional idle timeout
//! - Capacity limits and address lists for broadcast fan-out
//!
//! The registry never touches the world on its own; every call that creates
//! or destroys a body receives the world explicitly, so the game loop stays
//! the only mutator of both.

use crate::error::{ServerError, WorldError};
use crate::world::{Vec2, World};
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{PlayerId, SpawnPolicy};
use std::collections::HashMap;
use std::net::SocketAddr;

/// A registered client and the body it controls
#[derive(Debug, Clone)]
pub struct Client {
    /// Identifier shared by the client entry and its body
    pub id: PlayerId,
    /// Network address broadcasts are sent to
    pub addr: SocketAddr,
    /// Tick at which the client joined
    pub joined_tick: u64,
    /// Tick of the last accepted message from this client
    pub last_seen: u64,
}

impl Client {
    pub fn new(id: PlayerId, addr: SocketAddr, tick: u64) -> Self {
        Self {
            id,
            addr,
            joined_tick: tick,
            last_seen: tick,
        }
    }

    /// Returns true once the client stayed silent for more than `max_idle` ticks
    pub fn is_timed_out(&self, now: u64, max_idle: u64) -> bool {
        now.saturating_sub(self.last_seen) > max_idle
    }
}

/// Outcome of [`PlayerRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    New(PlayerId),
    Existing(PlayerId),
}

impl Registration {
    pub fn id(&self) -> PlayerId {
        match *self {
            Registration::New(id) | Registration::Existing(id) => id,
        }
    }
}

/// Produces spawn points according to a [`SpawnPolicy`]
#[derive(Debug)]
pub struct Spawner {
    policy: SpawnPolicy,
    issued: u32,
    rng: Option<StdRng>,
}

impl Spawner {
    pub fn new(policy: SpawnPolicy) -> Self {
        let rng = match policy {
            SpawnPolicy::Random { seed } => Some(StdRng::seed_from_u64(seed)),
            _ => None,
        };
        Self {
            policy,
            issued: 0,
            rng,
        }
    }

    pub fn policy(&self) -> &SpawnPolicy {
        &self.policy
    }

    /// Next spawn point; the world pushes points that overlap a wall back inside
    pub fn next_point(&mut self, world: &World) -> Vec2 {
        let index = self.issued;
        self.issued = self.issued.wrapping_add(1);

        match (&self.policy, self.rng.as_mut()) {
            (SpawnPolicy::Fixed { x, y }, _) => Vec2::new(*x, *y),
            (
                SpawnPolicy::Grid {
                    origin,
                    spacing,
                    columns,
                },
                _,
            ) => {
                let columns = (*columns).max(1);
                let column = index % columns;
                let row = index / columns;
                Vec2::new(
                    origin.0 + column as f32 * spacing,
                    origin.1 + row as f32 * spacing,
                )
            }
            (SpawnPolicy::Random { .. }, Some(rng)) => {
                let arena = world.arena();
                let radius = world.config().player_radius;
                Vec2::new(
                    rng.gen_range((arena.min.x + radius)..(arena.max.x - radius)),
                    rng.gen_range((arena.min.y + radius)..(arena.max.y - radius)),
                )
            }
            (SpawnPolicy::Random { .. }, None) => {
                let arena = world.arena();
                arena.min.add(&arena.max).scale(0.5)
            }
        }
    }
}

/// Maps client addresses to players and keeps the world in sync
pub struct PlayerRegistry {
    /// Registered clients indexed by their network address
    clients: HashMap<SocketAddr, Client>,
    /// Next identifier handed out; identifiers are never reused and stop at `PlayerId::MAX`
    next_id: u32,
    /// Maximum number of concurrent players
    max_clients: usize,
    spawner: Spawner,
}

impl PlayerRegistry {
    pub fn new(max_clients: usize, spawn: SpawnPolicy) -> Self {
        Self {
            clients: HashMap::new(),
            next_id: 1,
            max_clients,
            spawner: Spawner::new(spawn),
        }
    }

    /// Registers `addr`, spawning a body on first contact
    ///
    /// A known address gets its existing id back and no second body is
    /// created. A full server rejects new addresses with `ServerFull`.
    pub fn register(
        &mut self,
        addr: SocketAddr,
        tick: u64,
        world: &mut World,
    ) -> Result<Registration, ServerError> {
        if let Some(client) = self.clients.get_mut(&addr) {
            client.last_seen = tick;
            return Ok(Registration::Existing(client.id));
        }

        if self.clients.len() >= self.max_clients {
            return Err(ServerError::ServerFull {
                addr,
                max: self.max_clients,
            });
        }

        if self.next_id > PlayerId::MAX.0 {
            return Err(ServerError::IdsExhausted(addr));
        }
        let id = PlayerId(self.next_id);
        let spawn = self.spawner.next_point(world);
        match world.spawn_player(id, spawn) {
            Ok(_) => {}
            Err(WorldError::DuplicateId(dup)) => {
                // Registry and world disagree about live ids
                error!("BUG: world already holds a body for new player {}", dup);
                return Err(WorldError::DuplicateId(dup).into());
            }
            Err(e) => return Err(e.into()),
        }

        self.next_id += 1;
        self.clients.insert(addr, Client::new(id, addr, tick));
        info!(
            "Player {} connected from {} at ({:.1}, {:.1})",
            id, addr, spawn.x, spawn.y
        );

        Ok(Registration::New(id))
    }

    /// Removes the client and its body. Unknown addresses are logged and ignored.
    pub fn unregister(&mut self, addr: SocketAddr, world: &mut World) -> Option<PlayerId> {
        let Some(client) = self.clients.remove(&addr) else {
            warn!("Disconnect from unknown address {}", addr);
            return None;
        };

        if let Err(e) = world.remove_player(client.id) {
            error!("BUG: player {} had no body: {}", client.id, e);
        }
        info!("Player {} disconnected ({})", client.id, addr);
        Some(client.id)
    }

    /// Looks up the player owning `addr`
    pub fn resolve(&self, addr: SocketAddr) -> Result<PlayerId, ServerError> {
        self.clients
            .get(&addr)
            .map(|client| client.id)
            .ok_or(ServerError::UnknownClient(addr))
    }

    /// Records activity for `addr` at `tick`
    pub fn touch(&mut self, addr: SocketAddr, tick: u64) {
        if let Some(client) = self.clients.get_mut(&addr) {
            client.last_seen = tick;
        }
    }

    /// Unregisters every client idle for more than `max_idle` ticks
    ///
    /// Returns the removed ids in ascending order.
    pub fn expire_stale(&mut self, now: u64, max_idle: u64, world: &mut World) -> Vec<PlayerId> {
        let mut stale: Vec<(PlayerId, SocketAddr)> = self
            .clients
            .values()
            .filter(|client| client.is_timed_out(now, max_idle))
            .map(|client| (client.id, client.addr))
            .collect();
        stale.sort_by_key(|(id, _)| *id);

        for (id, addr) in &stale {
            info!("Player {} timed out after {} idle ticks", id, max_idle);
            self.unregister(*addr, world);
        }

        stale.into_iter().map(|(id, _)| id).collect()
    }

    /// Every registered address, ordered by player id
    pub fn all_addresses(&self) -> Vec<SocketAddr> {
        let mut entries: Vec<(PlayerId, SocketAddr)> = self
            .clients
            .values()
            .map(|client| (client.id, client.addr))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, addr)| addr).collect()
    }

    pub fn client(&self, addr: SocketAddr) -> Option<&Client> {
        self.clients.get(&addr)
    }

    /// Returns the number of currently registered players
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if nobody is registered
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
