//! The connection registry.
//!
//! Holds every agent connection keyed by [`ConnectionId`]. The map itself is
//! a sharded [`DashMap`] and each record carries its own lock, so operations
//! on distinct connections never serialize on a registry-wide mutex.
//!
//! Records are reclaimed lazily: a closed connection stays in the map while
//! a worker thread is still attached to it, and is dropped by whichever of
//! [`ConnectionRegistry::disconnect`] and [`ConnectionRegistry::detach_worker`]
//! observes both "closed" and "no worker".

use super::client::Connection;
use super::ConnectionId;
use crate::error::RegistryError;
use crate::framing::{LengthPrefixFramer, MessageFramer};
use crate::transport::Transport;
use crate::utils::lock;
use dashmap::DashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

/// Default size of a single transport read.
pub const DEFAULT_RECV_CHUNK_SIZE: usize = 64 * 1024;

/// Owns all agent transports and their per-connection buffers.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    next_id: AtomicUsize,
    framer: Arc<dyn MessageFramer>,
    /// Closed since the last [`ConnectionRegistry::take_disconnected`].
    disconnected: Mutex<Vec<ConnectionId>>,
    recv_chunk_size: usize,
}

impl ConnectionRegistry {
    /// Creates an empty registry framing messages with `framer`.
    pub fn new(framer: Arc<dyn MessageFramer>) -> Self {
        Self::with_recv_chunk_size(framer, DEFAULT_RECV_CHUNK_SIZE)
    }

    /// Creates an empty registry that reads at most `recv_chunk_size` bytes
    /// per transport read.
    pub fn with_recv_chunk_size(framer: Arc<dyn MessageFramer>, recv_chunk_size: usize) -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicUsize::new(1),
            framer,
            disconnected: Mutex::new(Vec::new()),
            recv_chunk_size: recv_chunk_size.max(1),
        }
    }

    /// The framer used for every connection.
    pub fn framer(&self) -> &Arc<dyn MessageFramer> {
        &self.framer
    }

    fn get(&self, id: ConnectionId) -> Result<Arc<Connection>, RegistryError> {
        self.connections
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(RegistryError::UnknownConnection(id))
    }

    fn get_open(&self, id: ConnectionId) -> Result<Arc<Connection>, RegistryError> {
        let connection = self.get(id)?;
        if connection.is_closed() {
            return Err(RegistryError::Closed(id));
        }
        Ok(connection)
    }

    /// Registers a freshly accepted transport.
    ///
    /// # Returns
    ///
    /// The new connection's identity. Identities increase monotonically and
    /// are never reused while the registry lives.
    pub fn accept(&self, transport: Box<dyn Transport>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(Connection::new(id, transport));
        match connection.remote_addr() {
            Some(addr) => info!("🔗 Connection {} accepted from {}", id, addr),
            None => info!("🔗 Connection {} accepted", id),
        }
        self.connections.insert(id, connection);
        id
    }

    /// Marks the connection closed and shuts its transport down.
    ///
    /// The record is dropped right away unless a worker thread is still
    /// attached, in which case [`ConnectionRegistry::detach_worker`] drops it
    /// once that worker has exited.
    ///
    /// # Returns
    ///
    /// `true` if this call closed the connection, `false` if it was already
    /// closed or unknown.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let Ok(connection) = self.get(id) else {
            return false;
        };
        if !connection.mark_closed() {
            return false;
        }

        if let Err(e) = connection.transport().close() {
            debug!("Connection {} transport close failed: {}", id, e);
        }
        {
            let mut state = connection.state();
            state.inbound.clear();
            state.commands.clear();
            state.sense = None;
            state.synced = false;
        }
        lock(&self.disconnected).push(id);

        let lifetime = connection.connected_at().elapsed().unwrap_or_default();
        info!("🔌 Connection {} closed after {:.1?}", id, lifetime);

        if !connection.has_worker() {
            self.connections.remove(&id);
        }
        true
    }

    /// Records that a worker thread now serves `id`.
    ///
    /// # Returns
    ///
    /// `false` if the connection is unknown or already closed.
    pub fn attach_worker(&self, id: ConnectionId) -> bool {
        match self.get_open(id) {
            Ok(connection) => {
                connection.set_worker(true);
                true
            }
            Err(_) => false,
        }
    }

    /// Records that the worker thread for `id` has exited, reclaiming the
    /// record if the connection was closed meanwhile.
    pub fn detach_worker(&self, id: ConnectionId) {
        let Ok(connection) = self.get(id) else {
            return;
        };
        connection.set_worker(false);
        if connection.is_closed() {
            trace!("Reclaiming connection {} after worker exit", id);
            self.connections.remove(&id);
        }
    }

    /// Whether a worker thread is attached to `id`.
    pub fn has_worker(&self, id: ConnectionId) -> bool {
        self.get(id).map(|c| c.has_worker()).unwrap_or(false)
    }

    /// Appends raw bytes to the connection's inbound buffer.
    pub fn append_bytes(&self, id: ConnectionId, bytes: &[u8]) -> Result<(), RegistryError> {
        let connection = self.get_open(id)?;
        connection.state().inbound.extend_from_slice(bytes);
        Ok(())
    }

    /// Reads everything the transport has pending into the inbound buffer.
    ///
    /// Stops at the first `WouldBlock`. End of stream and transport errors
    /// close the connection.
    ///
    /// # Returns
    ///
    /// The number of bytes read.
    pub fn pump(&self, id: ConnectionId) -> Result<usize, RegistryError> {
        let connection = self.get_open(id)?;
        let mut chunk = vec![0u8; self.recv_chunk_size];
        let mut total = 0;

        loop {
            match connection.transport().recv(&mut chunk) {
                Ok(0) => {
                    debug!("Connection {} reached end of stream", id);
                    self.disconnect(id);
                    return Err(RegistryError::Closed(id));
                }
                Ok(n) => {
                    connection.state().inbound.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Connection {} receive failed: {}", id, e);
                    self.disconnect(id);
                    return Err(RegistryError::Transport { id, source: e });
                }
            }
        }

        if total > 0 {
            trace!("Connection {} received {} bytes", id, total);
        }
        Ok(total)
    }

    /// Removes one complete message from the front of the inbound buffer.
    ///
    /// A framing error closes the connection.
    pub fn try_extract_message(&self, id: ConnectionId) -> Result<Option<Vec<u8>>, RegistryError> {
        let connection = self.get_open(id)?;
        let extracted = {
            let mut state = connection.state();
            self.framer.extract(&mut state.inbound)
        };

        extracted.or_else(|source| {
            warn!("Connection {} sent a malformed frame: {}", id, source);
            self.disconnect(id);
            Err(RegistryError::Framing { id, source })
        })
    }

    /// Queues a decoded command for the simulation.
    pub fn queue_command(&self, id: ConnectionId, command: Vec<u8>) -> Result<(), RegistryError> {
        let connection = self.get_open(id)?;
        connection.state().commands.push_back(command);
        Ok(())
    }

    /// Drains the decoded-command queue in arrival order.
    pub fn take_commands(&self, id: ConnectionId) -> Vec<Vec<u8>> {
        match self.get(id) {
            Ok(connection) => connection.state().commands.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Stores the sense payload produced for this cycle, replacing any older one.
    pub fn set_sense_payload(&self, id: ConnectionId, payload: Vec<u8>) -> Result<(), RegistryError> {
        let connection = self.get_open(id)?;
        connection.state().sense = Some(payload);
        Ok(())
    }

    /// Takes the stored sense payload, if any.
    pub fn take_sense_payload(&self, id: ConnectionId) -> Option<Vec<u8>> {
        self.get(id).ok().and_then(|c| c.state().sense.take())
    }

    /// Frames `payload` and writes it to the connection.
    ///
    /// A transport error closes the connection. A payload too large to frame
    /// is dropped and the connection stays open.
    pub fn send_message(&self, id: ConnectionId, payload: &[u8]) -> Result<(), RegistryError> {
        let connection = self.get_open(id)?;
        let frame = self
            .framer
            .encode(payload)
            .map_err(|source| RegistryError::Framing { id, source })?;
        connection.transport().send(&frame).map_err(|source| {
            warn!("Connection {} send failed: {}", id, source);
            self.disconnect(id);
            RegistryError::Transport { id, source }
        })
    }

    /// Sets the synchronized-this-cycle flag.
    pub fn set_synced(&self, id: ConnectionId, synced: bool) {
        if let Ok(connection) = self.get(id) {
            connection.state().synced = synced;
        }
    }

    /// Whether the connection sent its sync token this cycle.
    pub fn is_synced(&self, id: ConnectionId) -> bool {
        self.get(id).map(|c| c.state().synced).unwrap_or(false)
    }

    /// Whether the connection exists and is not closed.
    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.get_open(id).is_ok()
    }

    /// Identities of all open connections, in ascending order.
    pub fn open_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of records held, including closed ones awaiting their worker.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count()
    }

    /// Connections closed since the previous call, in closing order.
    pub fn take_disconnected(&self) -> Vec<ConnectionId> {
        std::mem::take(&mut *lock(&self.disconnected))
    }

    /// Closes every connection.
    pub fn close_all(&self) {
        for id in self.open_ids() {
            self.disconnect(id);
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(Arc::new(LengthPrefixFramer::new()))
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}
