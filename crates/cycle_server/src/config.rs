//! Server and relay configuration types and defaults.
//!
//! These are plain runtime structures. File loading and command line
//! overrides live in the `cycled` binary, which builds them from its TOML
//! settings.

use crate::connection::registry::DEFAULT_RECV_CHUNK_SIZE;
use crate::error::ServerError;
use std::net::SocketAddr;
use std::time::Duration;

/// Default agent port of the cycle server.
pub const DEFAULT_AGENT_PORT: u16 = 3100;

/// Default listen port of the agent relay.
pub const DEFAULT_RELAY_PORT: u16 = 3110;

/// Configuration structure for the cycle server.
///
/// Contains the network settings of the agent front-end and the mode flags
/// of the cycle coordinator.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The socket address to bind the agent listener to
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent agent connections
    pub max_connections: usize,

    /// Lock-step mode: StartCycle waits for every agent's sync token
    pub sync_mode: bool,

    /// Produce sense payloads on per-agent worker threads
    pub multi_threaded: bool,

    /// Minimum wall-clock length of a cycle; zero runs cycles back to back
    pub cycle_interval: Duration,

    /// How long StartCycle sleeps between polls while waiting for sync tokens
    pub sync_poll_interval: Duration,

    /// Size of a single socket read
    pub recv_chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], DEFAULT_AGENT_PORT)),
            max_connections: 1000,
            sync_mode: false,
            multi_threaded: true,
            cycle_interval: Duration::from_millis(20),
            sync_poll_interval: Duration::from_millis(1),
            recv_chunk_size: DEFAULT_RECV_CHUNK_SIZE,
        }
    }
}

impl ServerConfig {
    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_connections == 0 {
            return Err(ServerError::Config(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.sync_poll_interval.is_zero() {
            return Err(ServerError::Config(
                "sync_poll_interval must be greater than 0".to_string(),
            ));
        }
        if self.recv_chunk_size == 0 {
            return Err(ServerError::Config(
                "recv_chunk_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration of the agent relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Where agents connect to the relay
    pub listen_address: SocketAddr,

    /// The cycle server the relay forwards to
    pub upstream_address: SocketAddr,

    /// Fixed forwarding period, re-armed after every completed round trip
    pub period: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([127, 0, 0, 1], DEFAULT_RELAY_PORT)),
            upstream_address: SocketAddr::from(([127, 0, 0, 1], DEFAULT_AGENT_PORT)),
            period: Duration::from_millis(20),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.period.is_zero() {
            return Err(ServerError::Config("relay period must be greater than 0".to_string()));
        }
        if self.listen_address == self.upstream_address {
            return Err(ServerError::Config(format!(
                "relay listen address {} equals its upstream address",
                self.listen_address
            )));
        }
        Ok(())
    }
}
