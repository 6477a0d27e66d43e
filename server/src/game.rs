use crate::error::{ServerError, WorldError};
use crate::registry::{PlayerRegistry, Registration};
use crate::world::World;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use shared::{ClientMessage, PlayerId, PlayerState, ServerConfig, ServerMessage};
use std::net::SocketAddr;

/// A raw datagram waiting for the next tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inbound {
    pub addr: SocketAddr,
    pub payload: Vec<u8>,
}

impl Inbound {
    pub fn new(addr: SocketAddr, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            addr,
            payload: payload.into(),
        }
    }
}

/// Datagrams drained during one tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickBatch {
    pub tick: u64,
    pub datagrams: Vec<Inbound>,
}

/// Inbound traffic recorded from tick 0, enough to re-run a session from a fresh world
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputLog {
    /// Number of ticks covered by the log, including ticks without input
    pub total_ticks: u64,
    /// Non-empty batches in tick order
    pub batches: Vec<TickBatch>,
}

impl InputLog {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn datagram_count(&self) -> usize {
        self.batches.iter().map(|batch| batch.datagrams.len()).sum()
    }
}

/// What a tick produced
#[derive(Debug, Clone)]
pub struct TickReport {
    /// Index of the completed tick, starting at 0
    pub tick: u64,
    pub snapshot: Vec<PlayerState>,
    /// Encoded `/update_position` datagram
    pub broadcast: Vec<u8>,
    /// Every registered address, ordered by player id
    pub targets: Vec<SocketAddr>,
    pub accepted: usize,
    pub dropped: usize,
    pub expired: Vec<PlayerId>,
}

/// Everything the game loop owns: the world, the registry and the tick counter
pub struct GameState {
    world: World,
    registry: PlayerRegistry,
    tick: u64,
    dt: f32,
    timeout_ticks: Option<u64>,
    recorder: Option<InputLog>,
}

impl GameState {
    pub fn new(config: &ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let world = World::new(config.world.clone())?;

        Ok(Self {
            world,
            registry: PlayerRegistry::new(config.max_clients, config.spawn.clone()),
            tick: 0,
            dt: config.tick_dt(),
            timeout_ticks: config.timeout_ticks(),
            recorder: None,
        })
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn registry(&self) -> &PlayerRegistry {
        &self.registry
    }

    /// Number of ticks completed so far
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    /// Decodes one datagram and applies it
    pub fn handle_datagram(&mut self, inbound: &Inbound) -> Result<(), ServerError> {
        let message = ClientMessage::decode(&inbound.payload)?;
        self.dispatch(inbound.addr, message)
    }

    pub fn dispatch(&mut self, addr: SocketAddr, message: ClientMessage) -> Result<(), ServerError> {
        match message {
            ClientMessage::Connect => self.handle_connect(addr),
            ClientMessage::UpdateVelocity { vx, vy } => self.handle_update_velocity(addr, vx, vy),
            ClientMessage::Disconnect => self.handle_disconnect(addr),
        }
    }

    fn handle_connect(&mut self, addr: SocketAddr) -> Result<(), ServerError> {
        match self.registry.register(addr, self.tick, &mut self.world)? {
            Registration::New(_) => {}
            Registration::Existing(id) => {
                debug!("Repeated connect from {} (player {})", addr, id);
            }
        }
        Ok(())
    }

    fn handle_update_velocity(&mut self, addr: SocketAddr, vx: f32, vy: f32) -> Result<(), ServerError> {
        let id = self.registry.resolve(addr)?;
        let applied = self.world.set_velocity(id, vx, vy)?;
        self.registry.touch(addr, self.tick);

        if applied.x != vx || applied.y != vy {
            debug!(
                "Player {} velocity ({:.1}, {:.1}) clamped to ({:.1}, {:.1})",
                id, vx, vy, applied.x, applied.y
            );
        }
        Ok(())
    }

    fn handle_disconnect(&mut self, addr: SocketAddr) -> Result<(), ServerError> {
        match self.registry.unregister(addr, &mut self.world) {
            Some(_) => Ok(()),
            None => Err(ServerError::UnknownClient(addr)),
        }
    }

    /// Applies a batch, steps the world once and prepares the broadcast
    pub fn run_tick(&mut self, batch: Vec<Inbound>) -> TickReport {
        let tick = self.tick;
        let mut accepted = 0;
        let mut dropped = 0;

        for inbound in &batch {
            match self.handle_datagram(inbound) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    dropped += 1;
                    log_dropped(inbound.addr, &e);
                }
            }
        }

        if let Some(recorder) = self.recorder.as_mut() {
            recorder.total_ticks = tick + 1;
            if !batch.is_empty() {
                recorder.batches.push(TickBatch {
                    tick,
                    datagrams: batch,
                });
            }
        }

        let expired = match self.timeout_ticks {
            Some(max_idle) => self.registry.expire_stale(tick, max_idle, &mut self.world),
            None => Vec::new(),
        };

        self.world.step(self.dt);
        let snapshot = self.world.snapshot();
        self.tick += 1;

        // The registry never hands out ids beyond the wire range
        let (broadcast, targets) = match ServerMessage::PositionBroadcast(snapshot.clone()).encode() {
            Ok(bytes) => (bytes, self.registry.all_addresses()),
            Err(e) => {
                error!("BUG: broadcast for tick {} not encodable: {}", tick, e);
                (Vec::new(), Vec::new())
            }
        };

        TickReport {
            tick,
            snapshot,
            broadcast,
            targets,
            accepted,
            dropped,
            expired,
        }
    }

    /// Starts capturing every tick's inbound batch
    ///
    /// A log only replays from a fresh world, so recording has to begin
    /// before the first tick runs.
    pub fn start_recording(&mut self) -> Result<(), ServerError> {
        if self.tick != 0 {
            return Err(ServerError::RecordingAfterStart(self.tick));
        }
        self.recorder = Some(InputLog::default());
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    /// Stops recording and hands back what was captured
    pub fn take_recording(&mut self) -> Option<InputLog> {
        self.recorder.take()
    }

    /// Re-runs a recorded session from a fresh world
    ///
    /// Ticks without a batch are stepped with no input, so the returned state
    /// has completed exactly `log.total_ticks` ticks.
    pub fn replay(config: &ServerConfig, log: &InputLog) -> Result<Self, ServerError> {
        let mut game = Self::new(config)?;
        let mut batches = log.batches.iter().peekable();

        for tick in 0..log.total_ticks {
            let datagrams = match batches.next_if(|batch| batch.tick == tick) {
                Some(batch) => batch.datagrams.clone(),
                None => Vec::new(),
            };
            game.run_tick(datagrams);
        }

        if let Some(batch) = batches.next() {
            warn!(
                "Replay ignored batch for tick {} beyond the recorded {} ticks",
                batch.tick, log.total_ticks
            );
        }
        info!(
            "Replayed {} ticks, {} players remain",
            log.total_ticks,
            game.registry.len()
        );

        Ok(game)
    }
}

fn log_dropped(addr: SocketAddr, err: &ServerError) {
    match err {
        ServerError::Protocol(e) => warn!("Dropped malformed datagram from {}: {}", addr, e),
        ServerError::UnknownClient(_) => debug!("Ignored message from unregistered {}", addr),
        ServerError::ServerFull { .. } | ServerError::IdsExhausted(_) => warn!("{}", err),
        ServerError::World(WorldError::NotFound(_) | WorldError::InvalidInput { .. }) => {
            warn!("Rejected input from {}: {}", addr, err)
        }
        other => error!("Failed to handle datagram from {}: {}", addr, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::protocol::{Argument, RawMessage};
    use shared::{SpawnPolicy, WorldConfig};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Zero gravity, arena centred on the origin, everyone spawns at (0, 0)
    fn scenario_config() -> ServerConfig {
        ServerConfig {
            tick_rate: 60,
            spawn: SpawnPolicy::Fixed { x: 0.0, y: 0.0 },
            world: WorldConfig {
                gravity: (0.0, 0.0),
                arena_origin: (-350.0, -200.0),
                arena_size: (700.0, 400.0),
                max_speed: 10.0,
                ..WorldConfig::default()
            },
            ..ServerConfig::default()
        }
    }

    fn connect(port: u16) -> Inbound {
        Inbound::new(addr(port), ClientMessage::Connect.encode())
    }

    fn velocity(port: u16, vx: f32, vy: f32) -> Inbound {
        Inbound::new(addr(port), ClientMessage::UpdateVelocity { vx, vy }.encode())
    }

    fn disconnect(port: u16) -> Inbound {
        Inbound::new(addr(port), ClientMessage::Disconnect.encode())
    }

    fn decode_broadcast(report: &TickReport) -> Vec<PlayerState> {
        match ServerMessage::decode(&report.broadcast).unwrap() {
            ServerMessage::PositionBroadcast(players) => players,
        }
    }

    #[test]
    fn test_single_player_scenario() {
        let mut game = GameState::new(&scenario_config()).unwrap();

        let report = game.run_tick(vec![connect(5000)]);
        assert_eq!(report.tick, 0);
        assert_eq!(report.snapshot.len(), 1);
        assert_eq!(report.snapshot[0].id, PlayerId(1));
        assert_approx_eq!(report.snapshot[0].x, 0.0);

        let report = game.run_tick(vec![velocity(5000, 5.0, 0.0)]);
        let body = game.world().body(PlayerId(1)).unwrap();
        assert_approx_eq!(body.velocity.x, 5.0);
        assert_approx_eq!(body.velocity.y, 0.0);

        let players = decode_broadcast(&report);
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].id, PlayerId(1));
        assert_approx_eq!(players[0].x, 0.0833, 1e-4);
        assert_approx_eq!(players[0].y, 0.0);
        assert_approx_eq!(players[0].angle, 0.0);
        assert_eq!(report.targets, vec![addr(5000)]);
    }

    #[test]
    fn test_repeated_connect_is_idempotent() {
        let mut game = GameState::new(&scenario_config()).unwrap();

        let report = game.run_tick(vec![connect(5000), connect(5000)]);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.snapshot.len(), 1);

        let report = game.run_tick(vec![connect(5000)]);
        assert_eq!(report.snapshot.len(), 1);
        assert_eq!(game.registry().len(), 1);
    }

    #[test]
    fn test_velocity_is_clamped_to_max_speed() {
        let mut game = GameState::new(&scenario_config()).unwrap();
        game.run_tick(vec![connect(5000)]);

        game.run_tick(vec![velocity(5000, 30.0, 40.0)]);
        let body = game.world().body(PlayerId(1)).unwrap();
        assert_approx_eq!(body.velocity.magnitude(), 10.0, 1e-4);
        assert_approx_eq!(body.velocity.x, 6.0, 1e-4);
        assert_approx_eq!(body.velocity.y, 8.0, 1e-4);
    }

    #[test]
    fn test_broadcast_lists_every_player_once() {
        let config = ServerConfig {
            spawn: SpawnPolicy::Grid {
                origin: (-300.0, -150.0),
                spacing: 60.0,
                columns: 8,
            },
            ..scenario_config()
        };
        let mut game = GameState::new(&config).unwrap();

        let batch: Vec<Inbound> = (0..10).map(|i| connect(6000 + i)).collect();
        let report = game.run_tick(batch);

        let players = decode_broadcast(&report);
        assert_eq!(players.len(), 10);
        assert_eq!(report.targets.len(), 10);
        for (index, player) in players.iter().enumerate() {
            assert_eq!(player.id, PlayerId(index as u32 + 1));
        }
    }

    #[test]
    fn test_malformed_input_is_dropped() {
        let mut game = GameState::new(&scenario_config()).unwrap();
        game.run_tick(vec![connect(5000), connect(5001)]);
        game.run_tick(vec![velocity(5001, 3.0, 0.0)]);

        let wrong_arity = RawMessage::new(
            "/update_velocity",
            vec![Argument::Float(1.0), Argument::Float(2.0), Argument::Float(3.0)],
        )
        .encode();
        let unknown = RawMessage::new("/jump", vec![]).encode();
        let batch = vec![
            Inbound::new(addr(5000), wrong_arity),
            Inbound::new(addr(5000), unknown),
            Inbound::new(addr(5000), vec![0xde, 0xad, 0xbe]),
            Inbound::new(addr(5000), Vec::new()),
            velocity(7000, 1.0, 1.0),
        ];

        let report = game.run_tick(batch);
        assert_eq!(report.accepted, 0);
        assert_eq!(report.dropped, 5);
        assert_eq!(report.tick, 2);
        assert_eq!(report.snapshot.len(), 2);

        // Neither player changed velocity because of the garbage
        let still = game.world().body(PlayerId(1)).unwrap();
        assert_eq!(still.velocity.magnitude(), 0.0);
        let moving = game.world().body(PlayerId(2)).unwrap();
        assert_approx_eq!(moving.velocity.x, 3.0);
    }

    #[test]
    fn test_integer_velocity_arguments_are_accepted() {
        let mut game = GameState::new(&scenario_config()).unwrap();
        game.run_tick(vec![connect(5000)]);

        let ints = RawMessage::new(
            "/update_velocity",
            vec![Argument::Int(-1), Argument::Int(0)],
        )
        .encode();
        let report = game.run_tick(vec![Inbound::new(addr(5000), ints)]);

        assert_eq!(report.accepted, 1);
        let body = game.world().body(PlayerId(1)).unwrap();
        assert_approx_eq!(body.velocity.x, -1.0);
    }

    #[test]
    fn test_disconnect_removes_player_from_next_broadcast() {
        let config = ServerConfig {
            spawn: SpawnPolicy::Grid {
                origin: (-300.0, -150.0),
                spacing: 100.0,
                columns: 4,
            },
            ..scenario_config()
        };
        let mut game = GameState::new(&config).unwrap();
        game.run_tick(vec![connect(5000), connect(5001)]);
        game.run_tick(vec![velocity(5000, 10.0, 0.0)]);

        let report = game.run_tick(vec![disconnect(5000)]);
        let ids: Vec<PlayerId> = report.snapshot.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![PlayerId(2)]);
        assert_eq!(report.targets, vec![addr(5001)]);

        // Coming back yields a fresh id at the next spawn point, at rest
        let report = game.run_tick(vec![connect(5000)]);
        let ids: Vec<PlayerId> = report.snapshot.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![PlayerId(2), PlayerId(3)]);

        let returning = game.world().body(PlayerId(3)).unwrap();
        assert_approx_eq!(returning.position.x, -100.0);
        assert_approx_eq!(returning.position.y, -150.0);
        assert_eq!(returning.velocity.magnitude(), 0.0);
    }

    #[test]
    fn test_disconnect_from_unknown_address_is_harmless() {
        let mut game = GameState::new(&scenario_config()).unwrap();
        game.run_tick(vec![connect(5001)]);

        let report = game.run_tick(vec![disconnect(5000)]);
        assert_eq!(report.accepted, 0);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.snapshot.len(), 1);
        assert!(matches!(
            game.dispatch(addr(5000), ClientMessage::Disconnect),
            Err(ServerError::UnknownClient(a)) if a == addr(5000)
        ));
    }

    #[test]
    fn test_server_full_rejects_new_addresses() {
        let config = ServerConfig {
            max_clients: 1,
            ..scenario_config()
        };
        let mut game = GameState::new(&config).unwrap();

        let report = game.run_tick(vec![connect(5000), connect(5001)]);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.targets, vec![addr(5000)]);
    }

    #[test]
    fn test_idle_players_time_out() {
        let config = ServerConfig {
            tick_rate: 10,
            client_timeout_secs: Some(0.5),
            ..scenario_config()
        };
        let mut game = GameState::new(&config).unwrap();
        game.run_tick(vec![connect(5000), connect(5001)]);

        let mut expired = Vec::new();
        for _ in 0..8 {
            let report = game.run_tick(vec![velocity(5001, 1.0, 0.0)]);
            expired.extend(report.expired);
        }

        assert_eq!(expired, vec![PlayerId(1)]);
        assert!(!game.world().contains(PlayerId(1)));
        assert!(game.world().contains(PlayerId(2)));
    }

    #[test]
    fn test_timeout_disabled_by_default() {
        let mut game = GameState::new(&scenario_config()).unwrap();
        game.run_tick(vec![connect(5000)]);

        for _ in 0..600 {
            assert!(game.run_tick(Vec::new()).expired.is_empty());
        }
        assert_eq!(game.registry().len(), 1);
    }

    #[test]
    fn test_invalid_world_config_is_rejected() {
        let mut config = scenario_config();
        config.world.arena_size = (0.0, 400.0);

        assert!(matches!(
            GameState::new(&config),
            Err(ServerError::World(WorldError::Configuration(_)))
        ));
    }

    #[test]
    fn test_replay_reproduces_session() {
        let config = ServerConfig {
            world: WorldConfig::default(),
            spawn: SpawnPolicy::Random { seed: 42 },
            ..scenario_config()
        };
        let mut live = GameState::new(&config).unwrap();
        live.start_recording().unwrap();

        let mut last_broadcast = Vec::new();
        for tick in 0..120u16 {
            let mut batch = Vec::new();
            if tick < 4 {
                batch.push(connect(5000 + tick));
            }
            if tick % 7 == 0 {
                batch.push(velocity(5000 + tick % 4, 150.0, -80.0));
            }
            if tick == 90 {
                batch.push(disconnect(5002));
                batch.push(Inbound::new(addr(5001), vec![1, 2, 3]));
            }
            last_broadcast = live.run_tick(batch).broadcast;
        }

        let log = live.take_recording().unwrap();
        assert_eq!(log.total_ticks, 120);
        assert!(!live.is_recording());

        let restored = InputLog::from_bytes(&log.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, log);

        let replayed = GameState::replay(&config, &restored).unwrap();
        assert_eq!(replayed.tick(), live.tick());
        assert_eq!(replayed.world().snapshot(), live.world().snapshot());
        assert_eq!(
            ServerMessage::PositionBroadcast(replayed.world().snapshot())
                .encode()
                .unwrap(),
            last_broadcast
        );
    }

    #[test]
    fn test_recording_skips_empty_ticks() {
        let config = scenario_config();
        let mut game = GameState::new(&config).unwrap();
        game.start_recording().unwrap();

        game.run_tick(Vec::new());
        game.run_tick(Vec::new());
        game.run_tick(vec![connect(5000)]);
        game.run_tick(vec![velocity(5000, 10.0, 0.0)]);
        game.run_tick(Vec::new());

        let log = game.take_recording().unwrap();
        assert_eq!(log.total_ticks, 5);
        assert_eq!(log.batches.len(), 2);
        assert_eq!(log.batches[0].tick, 2);
        assert_eq!(log.batches[1].tick, 3);
        assert_eq!(log.datagram_count(), 2);

        let replayed = GameState::replay(&config, &log).unwrap();
        assert_eq!(replayed.tick(), 5);
        assert_eq!(replayed.world().snapshot().len(), 1);
        assert_eq!(replayed.world().snapshot(), game.world().snapshot());
    }

    #[test]
    fn test_recording_refused_after_first_tick() {
        let mut game = GameState::new(&scenario_config()).unwrap();
        game.run_tick(vec![connect(5000)]);

        assert!(matches!(
            game.start_recording(),
            Err(ServerError::RecordingAfterStart(1))
        ));
        assert!(!game.is_recording());
    }
}
