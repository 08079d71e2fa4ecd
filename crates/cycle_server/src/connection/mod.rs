//! Connection management for agent connections.
//!
//! The [`ConnectionRegistry`] owns every agent's transport and buffers.
//! Everybody else (coordinator, workers) refers to a connection by its
//! [`ConnectionId`] and goes through the registry for any access.

pub mod client;
pub mod registry;

pub use registry::ConnectionRegistry;

/// Type alias for connection identifiers.
///
/// Identities are handed out in increasing order and never reused while the
/// registry lives.
pub type ConnectionId = usize;
