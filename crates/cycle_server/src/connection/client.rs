//! Per-agent connection record.
//!
//! A [`Connection`] is created by the registry at accept time and only ever
//! reached through it. Buffers live behind the connection's own mutex so
//! that work on one agent never waits for another agent.

use super::ConnectionId;
use crate::transport::Transport;
use crate::utils::lock;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

/// Mutable per-connection state guarded by the connection lock.
#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    /// Raw bytes received but not yet framed.
    pub inbound: Vec<u8>,

    /// Decoded commands waiting for the next StartCycle.
    pub commands: VecDeque<Vec<u8>>,

    /// Sense payload produced in EndCycle and not yet sent.
    pub sense: Option<Vec<u8>>,

    /// Whether the agent sent its sync token this cycle.
    pub synced: bool,
}

/// Represents an individual agent connection to the server.
pub(crate) struct Connection {
    id: ConnectionId,
    transport: Box<dyn Transport>,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
    worker_attached: AtomicBool,
    remote_addr: Option<SocketAddr>,
    connected_at: SystemTime,
}

impl Connection {
    pub fn new(id: ConnectionId, transport: Box<dyn Transport>) -> Self {
        let remote_addr = transport.peer_addr();
        Self {
            id,
            transport,
            state: Mutex::new(ConnectionState::default()),
            closed: AtomicBool::new(false),
            worker_attached: AtomicBool::new(false),
            remote_addr,
            connected_at: SystemTime::now(),
        }
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn state(&self) -> MutexGuard<'_, ConnectionState> {
        lock(&self.state)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sets the closed flag; returns true for the call that actually closed it.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn has_worker(&self) -> bool {
        self.worker_attached.load(Ordering::SeqCst)
    }

    pub fn set_worker(&self, attached: bool) {
        self.worker_attached.store(attached, Ordering::SeqCst);
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .field("worker_attached", &self.has_worker())
            .finish()
    }
}
