//! # Lockstep Game Server Networking
//!
//! Server-side network layer for a real-time strategy game. It accepts TCP
//! clients, frames the lockstep wire protocol (see the `shared` crate) and
//! exposes connections, disconnections and inbound messages to the game
//! logic through thread-safe queues.
//!
//! ## Threads
//!
//! Two threads of control take part:
//!
//! - The **control thread** owns the simulation. It submits [`Command`]s and
//!   polls [`NetworkEvent`]s at its own cadence through a [`NetworkHandle`].
//! - The **network thread** runs the event loop exclusively. It owns the
//!   listening socket, the client registry and every per-client buffer.
//!
//! The only contact points between the two are the command queue, the event
//! queue and a wake signal that interrupts the loop's readiness wait.
//!
//! Neither side ever blocks the other. The loop never waits on a socket or on
//! the control thread; when the control thread falls behind, events are held
//! back in order and client reads pause until it catches up.
//!
//! ## Module Organization
//!
//! ### Client (`client`)
//! A registered connection: its ID, inbound byte accumulator and bounded
//! outbound queue drained by a writer task.
//!
//! ### Client Registry (`client_manager`)
//! Bounded collection of clients with capacity enforcement and ID assignment.
//!
//! ### Queues (`queue`)
//! Bounded single-producer/single-consumer record queues and the wake signal.
//!
//! ### Network (`network`)
//! The event loop, its lifecycle state machine and the control-thread handle.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{Command, NetworkConfig, NetworkEvent, NetworkService};
//! use shared::{NetMessage, StartMessage};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut network = NetworkService::start(NetworkConfig::default())?;
//!
//!     // Seat every client as it connects
//!     while let Some(event) = network.poll_event() {
//!         if let NetworkEvent::ClientConnected { client, .. } = event {
//!             let start = StartMessage::new(2, 0)?;
//!             network.submit_command(&Command::Send {
//!                 client,
//!                 message: NetMessage::Start(start),
//!             })?;
//!         }
//!     }
//!
//!     // Disconnect everyone and wait for the network thread to finish
//!     network.stop()?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod client_manager;
pub mod config;
pub mod error;
pub mod network;
pub mod queue;

pub use client::ClientId;
pub use config::{NetworkConfig, QueueLimits};
pub use error::{NetworkError, QueueError};
pub use network::{Command, DisconnectReason, NetworkEvent, NetworkHandle, NetworkService};
