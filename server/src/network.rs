//! Server network layer: UDP receive and send tasks around the fixed-rate game loop

use crate::discovery::{register_service, ServiceHandle};
use crate::error::ServerError;
use crate::game::{GameState, Inbound, TickReport};
use log::{debug, error, info, warn};
use shared::protocol::MAX_DATAGRAM_SIZE;
use shared::{DiscoveryConfig, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Lifecycle of the game loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

/// Datagrams queued for the sender task
#[derive(Debug)]
pub struct Outbound {
    pub payload: Arc<Vec<u8>>,
    pub targets: Vec<SocketAddr>,
}

/// Requests a graceful stop of a running [`Server`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        // Nobody listening means the server is already gone
        let _ = self.tx.send(true);
    }
}

/// Main server coordinating networking and game simulation
pub struct Server {
    socket: Option<Arc<UdpSocket>>,
    local_addr: SocketAddr,
    game: GameState,
    tick_duration: Duration,
    queue_capacity: usize,
    discovery: DiscoveryConfig,

    state_tx: watch::Sender<SchedulerState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Validates the configuration and binds the socket
    ///
    /// Only configuration and bind failures are reported here; everything
    /// that goes wrong while running is logged and contained in the tick.
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let game = GameState::new(&config)?;

        let bind_addr = config.bind_addr();
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = socket.local_addr()?;
        info!("Server listening on {}", local_addr);

        let (state_tx, _) = watch::channel(SchedulerState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Server {
            socket: Some(Arc::new(socket)),
            local_addr,
            game,
            tick_duration: Duration::from_secs_f64(1.0 / config.tick_rate as f64),
            queue_capacity: config.queue_capacity,
            discovery: config.discovery,
            state_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state_tx.borrow()
    }

    /// Watch channel following every state transition
    pub fn state_watch(&self) -> watch::Receiver<SchedulerState> {
        self.state_tx.subscribe()
    }

    pub fn game(&self) -> &GameState {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut GameState {
        &mut self.game
    }

    fn set_state(&self, state: SchedulerState) {
        debug!("Scheduler {:?} -> {:?}", self.state(), state);
        self.state_tx.send_replace(state);
    }

    /// Spawns task that continuously listens for incoming datagrams
    fn spawn_network_receiver(
        socket: Arc<UdpSocket>,
        inbound_tx: mpsc::Sender<Inbound>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let inbound = Inbound::new(addr, &buffer[..len]);
                        match inbound_tx.try_send(inbound) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                warn!("Inbound queue full, dropping datagram from {}", addr);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                    Err(e) => {
                        // ICMP port unreachable from a vanished client surfaces here on some platforms
                        debug!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        })
    }

    /// Spawns task that processes outgoing datagram queue
    fn spawn_network_sender(
        socket: Arc<UdpSocket>,
        mut outbound_rx: mpsc::Receiver<Outbound>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                for addr in outbound.targets {
                    if let Err(e) = socket.send_to(&outbound.payload, addr).await {
                        warn!("Failed to send to {}: {}", addr, e);
                    }
                }
            }
        })
    }

    fn drain_inbound(inbound_rx: &mut mpsc::Receiver<Inbound>) -> Vec<Inbound> {
        let mut batch = Vec::new();
        while let Ok(inbound) = inbound_rx.try_recv() {
            batch.push(inbound);
        }
        batch
    }

    fn queue_broadcast(outbound_tx: &mpsc::Sender<Outbound>, report: TickReport) {
        if report.targets.is_empty() {
            return;
        }

        let outbound = Outbound {
            payload: Arc::new(report.broadcast),
            targets: report.targets,
        };
        if let Err(e) = outbound_tx.try_send(outbound) {
            warn!("Dropping broadcast for tick {}: {}", report.tick, e);
        }
    }

    /// Main server loop coordinating all operations
    ///
    /// Returns once a shutdown was requested and every pending send was flushed.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        if self.state() != SchedulerState::Idle {
            return Err(ServerError::AlreadyStarted);
        }
        let socket = match self.socket.as_ref() {
            Some(socket) => Arc::clone(socket),
            None => return Err(ServerError::AlreadyStarted),
        };

        let (inbound_tx, mut inbound_rx) = mpsc::channel(self.queue_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.queue_capacity);

        let receiver = Self::spawn_network_receiver(Arc::clone(&socket), inbound_tx);
        let sender = Self::spawn_network_sender(Arc::clone(&socket), outbound_rx);
        drop(socket);

        let _service: Option<ServiceHandle> = if self.discovery.enabled {
            match register_service(
                &self.discovery.service_name,
                self.local_addr.port(),
                &self.discovery,
            ) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("LAN discovery unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut ticker = interval(self.tick_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_rx = self.shutdown_rx.clone();

        self.set_state(SchedulerState::Running);
        info!("Server started successfully");

        let mut accepted_total = 0usize;
        let mut dropped_total = 0usize;

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                },

                _ = ticker.tick() => {
                    let batch = Self::drain_inbound(&mut inbound_rx);
                    let report = self.game.run_tick(batch);
                    accepted_total += report.accepted;
                    dropped_total += report.dropped;

                    // Periodic performance monitoring
                    if (report.tick + 1) % 60 == 0 {
                        debug!(
                            "Tick {}: {} players, {} accepted, {} dropped",
                            report.tick,
                            report.snapshot.len(),
                            accepted_total,
                            dropped_total
                        );
                        accepted_total = 0;
                        dropped_total = 0;
                    }

                    Self::queue_broadcast(&outbound_tx, report);
                },
            }
        }

        self.set_state(SchedulerState::ShuttingDown);
        info!("Server shutting down after {} ticks", self.game.tick());

        receiver.abort();
        drop(inbound_rx);
        drop(outbound_tx);
        if let Err(e) = sender.await {
            error!("Sender task failed: {}", e);
        }
        if let Err(e) = receiver.await {
            if !e.is_cancelled() {
                error!("Receiver task failed: {}", e);
            }
        }

        self.socket = None;
        self.set_state(SchedulerState::Stopped);
        info!("Server stopped");
        Ok(())
    }
}
