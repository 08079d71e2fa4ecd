//! In-memory doubles shared by the unit tests.

use crate::connection::ConnectionId;
use crate::framing::{LengthPrefixFramer, MessageFramer};
use crate::simulation::AgentSimulation;
use crate::transport::Transport;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

#[derive(Default)]
struct ScriptedState {
    inbound: Mutex<VecDeque<u8>>,
    outbound: Mutex<Vec<u8>>,
    hung_up: AtomicBool,
    closed: AtomicBool,
}

/// Non-blocking transport fed by a [`ScriptedPeer`].
pub(crate) struct ScriptedTransport {
    state: Arc<ScriptedState>,
}

/// The test's end of a scripted transport.
#[derive(Clone)]
pub(crate) struct ScriptedPeer {
    state: Arc<ScriptedState>,
}

pub(crate) fn scripted_pair() -> (ScriptedTransport, ScriptedPeer) {
    let state = Arc::new(ScriptedState::default());
    (
        ScriptedTransport {
            state: state.clone(),
        },
        ScriptedPeer { state },
    )
}

impl Transport for ScriptedTransport {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        if self.state.closed.load(Ordering::SeqCst) || self.state.hung_up.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted peer gone"));
        }
        self.state.outbound.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        let mut inbound = self.state.inbound.lock().unwrap();
        if inbound.is_empty() {
            if self.state.hung_up.load(Ordering::SeqCst) {
                return Ok(0);
            }
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "nothing pending"));
        }
        let n = buf.len().min(inbound.len());
        for (slot, byte) in buf.iter_mut().zip(inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn close(&self) -> io::Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl ScriptedPeer {
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.state.inbound.lock().unwrap().extend(bytes.iter().copied());
    }

    pub fn push_message(&self, message: &[u8]) {
        self.push_bytes(&LengthPrefixFramer::new().encode(message).unwrap());
    }

    pub fn hang_up(&self) {
        self.state.hung_up.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Drains everything the server sent, split into messages.
    pub fn take_messages(&self) -> Vec<Vec<u8>> {
        let framer = LengthPrefixFramer::new();
        let mut bytes = std::mem::take(&mut *self.state.outbound.lock().unwrap());
        let mut messages = Vec::new();
        while let Some(message) = framer.extract(&mut bytes).unwrap() {
            messages.push(message);
        }
        messages
    }
}

/// What the recording simulation observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SimEvent {
    Connected(ConnectionId),
    Command(ConnectionId, Vec<u8>),
    Step(u64),
    Disconnected(ConnectionId),
}

type SenseHook = Box<dyn Fn(ConnectionId, u64) + Send>;

/// Simulation double that records every call and senses `cycle:<n>`.
#[derive(Default)]
pub(crate) struct RecordingSimulation {
    events: Mutex<Vec<SimEvent>>,
    sensed_by: Mutex<Vec<(ConnectionId, u64, ThreadId)>>,
    on_sense: Mutex<Option<SenseHook>>,
}

impl RecordingSimulation {
    /// Runs `hook` inside every later `sense` call, on the sensing thread.
    pub fn set_sense_hook(&self, hook: impl Fn(ConnectionId, u64) + Send + 'static) {
        *self.on_sense.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn sensed_by(&self) -> Vec<(ConnectionId, u64, ThreadId)> {
        self.sensed_by.lock().unwrap().clone()
    }

    pub fn sensed_in_cycle(&self, cycle: u64) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .sensed_by()
            .into_iter()
            .filter(|(_, c, _)| *c == cycle)
            .map(|(id, _, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl AgentSimulation for RecordingSimulation {
    fn agent_connected(&self, id: ConnectionId) {
        self.events.lock().unwrap().push(SimEvent::Connected(id));
    }

    fn realize_command(&self, id: ConnectionId, command: &[u8]) {
        self.events
            .lock()
            .unwrap()
            .push(SimEvent::Command(id, command.to_vec()));
    }

    fn step(&self, cycle: u64) {
        self.events.lock().unwrap().push(SimEvent::Step(cycle));
    }

    fn sense(&self, id: ConnectionId, cycle: u64) -> Vec<u8> {
        self.sensed_by
            .lock()
            .unwrap()
            .push((id, cycle, thread::current().id()));
        if let Some(hook) = self.on_sense.lock().unwrap().as_ref() {
            hook(id, cycle);
        }
        format!("cycle:{cycle}").into_bytes()
    }

    fn agent_disconnected(&self, id: ConnectionId) {
        self.events.lock().unwrap().push(SimEvent::Disconnected(id));
    }
}
