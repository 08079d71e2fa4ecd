//! # Cycle Server - Cycle-Synchronized Agent Network Core
//!
//! The networking core of a multi-agent simulation server. Remote agents
//! connect over TCP; every cycle the server ingests each agent's pending
//! commands, steps the simulation once and ships each agent its sense
//! update. The simulation itself is an external collaborator reached through
//! the [`AgentSimulation`] trait.
//!
//! ## Architecture Overview
//!
//! ### Core Components
//!
//! * **Message Framer** ([`framing`]) - 4-byte big-endian length prefix plus
//!   payload; the payload `(syn)` is the sync token
//! * **Connection Registry** ([`ConnectionRegistry`]) - owns every transport
//!   and per-agent buffer, locked per connection
//! * **Dynamic Barrier** ([`DynamicBarrier`]) - generation-counted rendezvous
//!   whose size changes only between generations
//! * **Cycle Coordinator** ([`CycleCoordinator`]) - StartCycle → Simulating →
//!   EndCycle, optionally lock-step and optionally with per-agent workers
//! * **Agent Relay** ([`relay`]) - fixed-period proxy in front of the server
//!
//! ### Cycle Flow
//!
//! 1. The acceptor queues new transports; StartCycle registers them
//! 2. StartCycle frames everything agents sent and realizes their commands
//! 3. In sync mode StartCycle waits until every open agent sent `(syn)`
//! 4. The simulation steps once
//! 5. EndCycle produces sense payloads, on worker threads when multi-threaded
//! 6. Payloads are framed and sent, and the next cycle begins
//!
//! ## Error Handling
//!
//! A failing socket or a malformed frame closes only the connection it
//! belongs to ([`RegistryError`], [`FramingError`]). Start-up problems are
//! [`ServerError`]s and relay failures are [`RelayError`]s. Misusing the
//! barrier is a programming error and panics.
//!
//! ## Thread Safety
//!
//! * One coordinator thread plus one worker thread per staffed agent
//! * Registry records are reached through a sharded map and guarded by
//!   their own mutex, so agents never contend with each other
//! * The barrier holds its lock only for counter bookkeeping, never across I/O

pub mod barrier;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod framing;
pub mod relay;
pub mod server;
pub mod simulation;
pub mod transport;
mod utils;
mod worker;

#[cfg(test)]
mod testing;

pub use barrier::{DynamicBarrier, ParticipantHandle, RendezvousResult};
pub use config::{RelayConfig, ServerConfig};
pub use connection::{ConnectionId, ConnectionRegistry};
pub use coordinator::{CoordinatorControls, CycleCoordinator, CyclePhase, CycleReport};
pub use error::{FramingError, RegistryError, RelayError, ServerError};
pub use framing::{LengthPrefixFramer, MessageFramer, SYNC_TOKEN};
pub use relay::{RelayHandle, RelayServer};
pub use server::AgentServer;
pub use simulation::AgentSimulation;
pub use transport::{TcpTransport, Transport};
pub use worker::WorkerTask;
