//! # Arena Server Library
//!
//! Authoritative server for the multibox arena: players are circles in a
//! walled 2D box, clients send desired velocities over UDP, and the server
//! runs the only simulation and broadcasts every position once per tick.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! The server owns the physics world. Clients never report positions; they
//! only request velocities, which are clamped to the configured maximum
//! speed before they reach a body.
//!
//! ### Player Registry
//! Handles the lifecycle of client addresses:
//! - Idempotent registration on `/connect`
//! - Spawn point selection through a configurable policy
//! - Explicit `/disconnect` and optional idle timeout
//!
//! ### State Broadcasting
//! After each step the full snapshot is encoded as one `/update_position`
//! datagram and sent to every registered address.
//!
//! ## Architecture Design
//!
//! ### Single Owner Game Loop
//! A receiver task only queues raw datagrams. The game loop drains the queue
//! at the start of every tick and is the only code that touches the world
//! or the registry, so neither needs a lock. Sends go through a separate
//! task so a slow socket never delays a tick.
//!
//! ### Deterministic Ticks
//! The step size is fixed by the tick rate, bodies are visited in id order
//! and activity is counted in ticks. Recording the inbound batches is
//! therefore enough to replay a session exactly (see [`game::InputLog`]).
//!
//! ## Module Organization
//!
//! - `world`: circle bodies, arena walls and the contact solver
//! - `registry`: address to player mapping and spawn policies
//! - `game`: message dispatch and the per-tick pipeline
//! - `network`: UDP tasks, tick timer and shutdown
//! - `discovery`: LAN announcements so clients can find the server
//! - `error`: error types shared by the modules above
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//! use shared::ServerConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         host: "127.0.0.1".to_string(),
//!         ..ServerConfig::default()
//!     };
//!
//!     let mut server = Server::new(config).await?;
//!     let shutdown = server.shutdown_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.shutdown();
//!     });
//!
//!     // Drains input, steps the world and broadcasts until shut down
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod discovery;
pub mod error;
pub mod game;
pub mod network;
pub mod registry;
pub mod world;

pub use error::{ServerError, WorldError};
