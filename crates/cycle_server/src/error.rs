//! Error types for the cycle server.
//!
//! Per-connection failures ([`FramingError`], [`RegistryError`]) never leave
//! the connection they happened on: the registry downgrades the connection to
//! closed and the coordinator keeps cycling. [`ServerError`] and
//! [`RelayError`] cover start-up and relay failures that are surfaced to the
//! caller.

use crate::connection::ConnectionId;
use std::io;
use thiserror::Error;

/// A receive buffer that cannot be split into frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// The length prefix announces a frame larger than the accepted maximum.
    #[error("frame length {length} exceeds the limit of {limit} bytes")]
    Oversized { length: usize, limit: usize },
}

/// Failures of a registry operation on a single connection.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No record exists for this identity (never accepted, or already reclaimed).
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// The connection was closed earlier.
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    /// Malformed framing; the connection has been closed.
    #[error("framing error on connection {id}: {source}")]
    Framing {
        id: ConnectionId,
        #[source]
        source: FramingError,
    },

    /// The transport failed; the connection has been closed.
    #[error("transport error on connection {id}: {source}")]
    Transport {
        id: ConnectionId,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while bringing up or running the network front-end.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket creation, bind or listen failures.
    #[error("Network error: {0}")]
    Network(String),

    /// Invalid configuration values.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Thread spawning or joining failed.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> Self {
        ServerError::Network(err.to_string())
    }
}

/// Errors that end an agent relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Could not reach the upstream server.
    #[error("failed to connect to upstream {address}: {source}")]
    Connect {
        address: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Socket failure on the agent or upstream side.
    #[error("relay I/O error: {0}")]
    Io(#[from] io::Error),

    /// The upstream sent an unframeable byte stream.
    #[error("relay framing error: {0}")]
    Framing(#[from] FramingError),

    /// The peer closed the stream.
    #[error("{0} closed the connection")]
    PeerClosed(&'static str),
}
