//! Interface of the external simulation collaborator.
//!
//! The cycle core never interprets command or sense payloads; it hands raw
//! messages to an [`AgentSimulation`] and ships back whatever bytes the
//! simulation produces. Sense generation runs on the per-agent worker
//! threads in multi-threaded mode, so every method takes `&self` and the
//! implementation brings its own interior mutability.

use crate::connection::ConnectionId;

/// Capabilities the coordinator needs from the simulation.
pub trait AgentSimulation: Send + Sync + 'static {
    /// A new agent connection was accepted. Called once per connection,
    /// from the coordinator thread, before any of its commands.
    fn agent_connected(&self, id: ConnectionId);

    /// One decoded command message from `id`, in arrival order. Called from
    /// the coordinator thread during StartCycle.
    fn realize_command(&self, id: ConnectionId, command: &[u8]);

    /// Advances the simulation by one cycle.
    fn step(&self, cycle: u64);

    /// Produces the sense payload for `id` at the end of `cycle`.
    ///
    /// May be called concurrently for different connections. An empty
    /// payload means there is nothing to send this cycle.
    fn sense(&self, id: ConnectionId, cycle: u64) -> Vec<u8>;

    /// The connection is gone. Called once, from the coordinator thread.
    fn agent_disconnected(&self, id: ConnectionId);
}
