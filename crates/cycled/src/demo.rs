//! Stand-in simulation served by the daemon.
//!
//! Keeps a command counter per agent and answers every cycle with
//! `(time <cycle>) (seen <commands>)`, which is enough to drive and observe
//! remote agents without a physics engine behind the server.

use cycle_server::{AgentSimulation, ConnectionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct EchoSimulation {
    seen: Mutex<HashMap<ConnectionId, u64>>,
    last_cycle: AtomicU64,
}

impl EchoSimulation {
    pub fn new() -> Self {
        Self::default()
    }

    fn seen(&self) -> MutexGuard<'_, HashMap<ConnectionId, u64>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commands realized so far for `id`.
    pub fn commands_seen(&self, id: ConnectionId) -> Option<u64> {
        self.seen().get(&id).copied()
    }

    pub fn last_cycle(&self) -> u64 {
        self.last_cycle.load(Ordering::Acquire)
    }
}

impl AgentSimulation for EchoSimulation {
    fn agent_connected(&self, id: ConnectionId) {
        self.seen().insert(id, 0);
        info!("🤖 Agent {} joined the simulation", id);
    }

    fn realize_command(&self, id: ConnectionId, command: &[u8]) {
        debug!(
            "Agent {} command: {}",
            id,
            String::from_utf8_lossy(command)
        );
        *self.seen().entry(id).or_default() += 1;
    }

    fn step(&self, cycle: u64) {
        self.last_cycle.store(cycle, Ordering::Release);
    }

    fn sense(&self, id: ConnectionId, cycle: u64) -> Vec<u8> {
        let seen = self.commands_seen(id).unwrap_or(0);
        format!("(time {cycle}) (seen {seen})").into_bytes()
    }

    fn agent_disconnected(&self, id: ConnectionId) {
        if let Some(seen) = self.seen().remove(&id) {
            info!("🤖 Agent {} left after {} commands", id, seen);
        }
    }
}
