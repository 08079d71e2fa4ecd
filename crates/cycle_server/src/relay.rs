//! Agent relay.
//!
//! A relay sits between one agent and the cycle server and imposes its own
//! fixed cadence. Each relay runs two threads:
//!
//! - the *agent reader* appends whatever the agent sends to a shared buffer;
//! - the *forwarder* wakes once per period, forwards the buffered messages
//!   followed by a sync token, blocks until one complete reply comes back
//!   from upstream, re-arms its deadline at `now + period` and hands the
//!   reply to the agent.
//!
//! The period is anchored to the last completed round trip, so a slow
//! upstream stretches the cadence instead of bunching requests together.
//! Either side failing raises the shared finished flag; the forwarder then
//! waits for the agent reader to exit before it closes the upstream socket.

use crate::config::RelayConfig;
use crate::error::{RelayError, ServerError};
use crate::framing::{LengthPrefixFramer, MessageFramer, SYNC_TOKEN};
use crate::server::{bind_listener, ACCEPT_POLL_INTERVAL};
use crate::transport::{TcpTransport, Transport};
use crate::utils::lock;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const RELAY_RECV_CHUNK: usize = 16 * 1024;

struct RelayShared {
    agent_buffer: Mutex<Vec<u8>>,
    finished: AtomicBool,
    /// Set by [`RelayHandle::stop`]; errors caused by the stop are not reported.
    stopping: AtomicBool,
    /// The agent closed its end before the relay finished.
    agent_hung_up: AtomicBool,
}

/// A running relay for one agent.
pub struct RelayHandle {
    shared: Arc<RelayShared>,
    agent: Arc<dyn Transport>,
    upstream: Arc<dyn Transport>,
    forwarder: Option<JoinHandle<Result<(), RelayError>>>,
}

impl RelayHandle {
    /// Starts relaying between `agent` and `upstream`.
    ///
    /// Both transports must block on receive.
    pub fn spawn(
        agent: Arc<dyn Transport>,
        upstream: Arc<dyn Transport>,
        period: Duration,
        framer: Arc<dyn MessageFramer>,
    ) -> io::Result<Self> {
        let shared = Arc::new(RelayShared {
            agent_buffer: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            agent_hung_up: AtomicBool::new(false),
        });

        let forwarder = Forwarder {
            shared: shared.clone(),
            agent: agent.clone(),
            upstream: upstream.clone(),
            period,
            framer,
        };
        let handle = thread::Builder::new()
            .name("relay-forwarder".to_string())
            .spawn(move || forwarder.run())?;

        Ok(Self {
            shared,
            agent,
            upstream,
            forwarder: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// Ends the relay; both sockets are shut down, which unblocks any
    /// pending receive.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.finished.store(true, Ordering::SeqCst);
        let _ = self.agent.close();
        let _ = self.upstream.close();
    }

    /// Waits for both relay threads to exit.
    ///
    /// # Returns
    ///
    /// The error that ended the relay, or `Ok(())` if it was stopped or the
    /// agent hung up.
    pub fn join(mut self) -> Result<(), RelayError> {
        match self.forwarder.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(RelayError::Io(io::Error::other("relay forwarder panicked")))),
            None => Ok(()),
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            self.stop();
            let _ = handle.join();
        }
    }
}

struct Forwarder {
    shared: Arc<RelayShared>,
    agent: Arc<dyn Transport>,
    upstream: Arc<dyn Transport>,
    period: Duration,
    framer: Arc<dyn MessageFramer>,
}

impl Forwarder {
    fn run(self) -> Result<(), RelayError> {
        let reader = {
            let shared = self.shared.clone();
            let agent = self.agent.clone();
            thread::Builder::new()
                .name("relay-agent-reader".to_string())
                .spawn(move || read_agent(&shared, agent.as_ref()))
        };
        let result = match reader {
            Ok(reader) => {
                let result = self.forward_loop();
                self.shared.finished.store(true, Ordering::SeqCst);
                // Unblocks the reader; it must be gone before upstream closes.
                let _ = self.agent.close();
                if reader.join().is_err() {
                    error!("Relay agent reader panicked");
                }
                result
            }
            Err(e) => Err(RelayError::Io(e)),
        };

        self.shared.finished.store(true, Ordering::SeqCst);
        let _ = self.upstream.close();

        if self.shared.stopping.load(Ordering::SeqCst)
            || self.shared.agent_hung_up.load(Ordering::SeqCst)
        {
            return Ok(());
        }
        result
    }

    fn forward_loop(&self) -> Result<(), RelayError> {
        let mut deadline = Instant::now() + self.period;
        let mut upstream_buffer = Vec::new();
        let mut chunk = vec![0u8; RELAY_RECV_CHUNK];

        while !self.shared.finished.load(Ordering::SeqCst) {
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            }
            if self.shared.finished.load(Ordering::SeqCst) {
                break;
            }

            let forwarded = self.forward_agent_messages()?;
            self.upstream.send(&self.framer.encode(SYNC_TOKEN)?)?;

            let reply = self.await_reply(&mut upstream_buffer, &mut chunk)?;
            if reply.is_empty() {
                continue;
            }
            deadline = Instant::now() + self.period;
            debug!(
                "Relay round trip: {} agent messages forwarded, {} byte reply",
                forwarded,
                reply.len()
            );
            self.agent.send(&self.framer.encode(&reply)?)?;
        }
        Ok(())
    }

    /// Forwards every complete message the agent has sent; partial frames
    /// stay buffered.
    fn forward_agent_messages(&self) -> Result<usize, RelayError> {
        let mut buffer = lock(&self.shared.agent_buffer);
        let mut forwarded = 0;
        while let Some(message) = self.framer.extract(&mut buffer)? {
            self.upstream.send(&self.framer.encode(&message)?)?;
            forwarded += 1;
        }
        Ok(forwarded)
    }

    fn await_reply(&self, buffer: &mut Vec<u8>, chunk: &mut [u8]) -> Result<Vec<u8>, RelayError> {
        loop {
            if let Some(reply) = self.framer.extract(buffer)? {
                return Ok(reply);
            }
            match self.upstream.recv(chunk) {
                Ok(0) => return Err(RelayError::PeerClosed("upstream")),
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn read_agent(shared: &RelayShared, agent: &dyn Transport) {
    let mut chunk = vec![0u8; RELAY_RECV_CHUNK];
    while !shared.finished.load(Ordering::SeqCst) {
        match agent.recv(&mut chunk) {
            Ok(0) => {
                if !shared.finished.load(Ordering::SeqCst) {
                    debug!("Relay agent hung up");
                    shared.agent_hung_up.store(true, Ordering::SeqCst);
                }
                break;
            }
            Ok(n) => lock(&shared.agent_buffer).extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                if !shared.finished.load(Ordering::SeqCst) {
                    warn!("Relay agent receive failed: {}", e);
                }
                break;
            }
        }
    }
    shared.finished.store(true, Ordering::SeqCst);
}

/// Accepts agents and starts one relay per agent, each with its own
/// upstream connection.
pub struct RelayServer {
    config: RelayConfig,
    stop: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    acceptor: Option<JoinHandle<()>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self {
            config,
            stop: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            acceptor: None,
        })
    }

    /// Binds the listen address and starts accepting agents.
    pub fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.acceptor.is_some() {
            return Err(ServerError::Internal("relay already started".to_string()));
        }
        let listener = bind_listener(self.config.listen_address)?;
        let local_addr = listener.local_addr()?;
        self.stop.store(false, Ordering::SeqCst);
        info!(
            "🔁 Relay listening on {} -> {} every {:?}",
            local_addr, self.config.upstream_address, self.config.period
        );

        let acceptor = RelayAcceptor {
            listener,
            upstream: self.config.upstream_address,
            period: self.config.period,
            stop: self.stop.clone(),
        };
        let handle = thread::Builder::new()
            .name("relay-acceptor".to_string())
            .spawn(move || acceptor.run())
            .map_err(|e| ServerError::Internal(format!("Failed to spawn relay acceptor: {e}")))?;

        self.local_addr = Some(local_addr);
        self.acceptor = Some(handle);
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stops accepting and ends every running relay.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        self.stop.store(true, Ordering::SeqCst);
        match self.acceptor.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| ServerError::Internal("relay acceptor panicked".to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Error while stopping relay: {}", e);
        }
    }
}

struct RelayAcceptor {
    listener: TcpListener,
    upstream: SocketAddr,
    period: Duration,
    stop: Arc<AtomicBool>,
}

impl RelayAcceptor {
    fn run(self) {
        let framer: Arc<dyn MessageFramer> = Arc::new(LengthPrefixFramer::new());
        let mut relays: Vec<RelayHandle> = Vec::new();

        while !self.stop.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => match self.open_relay(stream, framer.clone()) {
                    Ok(relay) => {
                        info!("🔗 Relaying agent {} to {}", addr, self.upstream);
                        relays.push(relay);
                    }
                    Err(e) => warn!("Could not relay agent {}: {}", addr, e),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    error!("Relay failed to accept connection: {}", e);
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }

            let (finished, running): (Vec<_>, Vec<_>) =
                relays.into_iter().partition(RelayHandle::is_finished);
            relays = running;
            for relay in finished {
                match relay.join() {
                    Ok(()) => info!("🔌 Relay finished"),
                    Err(e) => warn!("Relay ended with error: {}", e),
                }
            }
        }

        for relay in &relays {
            relay.stop();
        }
        for relay in relays {
            let _ = relay.join();
        }
        debug!("Relay acceptor exited");
    }

    fn open_relay(
        &self,
        stream: std::net::TcpStream,
        framer: Arc<dyn MessageFramer>,
    ) -> Result<RelayHandle, RelayError> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let agent = TcpTransport::new(stream);
        let upstream = TcpTransport::connect(self.upstream).map_err(|source| {
            let _ = agent.close();
            RelayError::Connect {
                address: self.upstream,
                source,
            }
        })?;
        RelayHandle::spawn(Arc::new(agent), Arc::new(upstream), self.period, framer)
            .map_err(RelayError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::sync::mpsc;

    fn loopback_pair() -> (TcpTransport, TcpTransport) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpTransport::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        (client, TcpTransport::new(stream))
    }

    fn read_message(transport: &TcpTransport, buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
        let framer = LengthPrefixFramer::new();
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(message) = framer.extract(buffer).unwrap() {
                return Some(message);
            }
            match transport.recv(&mut chunk) {
                Ok(0) | Err(_) => return None,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            }
        }
    }

    // Scenario C: the next forward is anchored to the last reply.
    #[test]
    fn test_period_is_anchored_to_last_reply() {
        let period = Duration::from_millis(100);
        let (agent_side, relay_agent) = loopback_pair();
        let (relay_upstream, server_side) = loopback_pair();

        let (tx, rx) = mpsc::channel();
        let upstream = thread::spawn(move || {
            let framer = LengthPrefixFramer::new();
            let mut buffer = Vec::new();
            let mut replied_at: Option<Instant> = None;
            for round in 0..3u8 {
                loop {
                    let message = read_message(&server_side, &mut buffer).unwrap();
                    if message == SYNC_TOKEN {
                        break;
                    }
                    tx.send(message).unwrap();
                }
                let synced_at = Instant::now();
                if let Some(replied_at) = replied_at {
                    assert!(synced_at.duration_since(replied_at) >= Duration::from_millis(95));
                }
                thread::sleep(Duration::from_millis(10));
                server_side.send(&framer.encode(&[b'r', round]).unwrap()).unwrap();
                replied_at = Some(Instant::now());
            }
        });

        let relay = RelayHandle::spawn(
            Arc::new(relay_agent),
            Arc::new(relay_upstream),
            period,
            Arc::new(LengthPrefixFramer::new()),
        )
        .unwrap();

        agent_side.send(&LengthPrefixFramer::new().encode(b"(init)").unwrap()).unwrap();
        let mut agent_buffer = Vec::new();
        for round in 0..3u8 {
            let reply = read_message(&agent_side, &mut agent_buffer).unwrap();
            assert_eq!(reply, vec![b'r', round]);
        }
        upstream.join().unwrap();
        assert_eq!(rx.recv().unwrap(), b"(init)".to_vec());

        relay.stop();
        relay.join().unwrap();
    }

    #[test]
    fn test_upstream_hang_up_finishes_relay() {
        let (_agent_side, relay_agent) = loopback_pair();
        let (relay_upstream, server_side) = loopback_pair();

        let relay = RelayHandle::spawn(
            Arc::new(relay_agent),
            Arc::new(relay_upstream),
            Duration::from_millis(5),
            Arc::new(LengthPrefixFramer::new()),
        )
        .unwrap();
        server_side.close().unwrap();

        let result = relay.join();
        assert!(matches!(
            result,
            Err(RelayError::PeerClosed("upstream")) | Err(RelayError::Io(_))
        ));
    }

    #[test]
    fn test_agent_hang_up_is_a_clean_finish() {
        let (agent_side, relay_agent) = loopback_pair();
        let (relay_upstream, server_side) = loopback_pair();
        let period = Duration::from_millis(5);

        let server = thread::spawn(move || {
            let framer = LengthPrefixFramer::new();
            let mut buffer = Vec::new();
            while let Some(message) = read_message(&server_side, &mut buffer) {
                if message == SYNC_TOKEN && server_side.send(&framer.encode(b"ok").unwrap()).is_err() {
                    break;
                }
            }
        });

        let relay = RelayHandle::spawn(
            Arc::new(relay_agent),
            Arc::new(relay_upstream),
            period,
            Arc::new(LengthPrefixFramer::new()),
        )
        .unwrap();
        agent_side.close().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !relay.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(relay.is_finished());
        relay.join().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_relay_server_forwards_to_upstream() {
        let upstream_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        let upstream = thread::spawn(move || {
            let (stream, _) = upstream_listener.accept().unwrap();
            let server_side = TcpTransport::new(stream);
            let framer = LengthPrefixFramer::new();
            let mut buffer = Vec::new();
            let mut seen = Vec::new();
            while let Some(message) = read_message(&server_side, &mut buffer) {
                if message == SYNC_TOKEN {
                    server_side.send(&framer.encode(b"(time)").unwrap()).unwrap();
                    if !seen.is_empty() {
                        return seen;
                    }
                } else {
                    seen.push(message);
                }
            }
            seen
        });

        let mut relay_server = RelayServer::new(RelayConfig {
            listen_address: "127.0.0.1:0".parse().unwrap(),
            upstream_address: upstream_addr,
            period: Duration::from_millis(10),
        })
        .unwrap();
        let relay_addr = relay_server.start().unwrap();

        let agent = TcpTransport::new(TcpStream::connect(relay_addr).unwrap());
        agent.send(&LengthPrefixFramer::new().encode(b"(scene)").unwrap()).unwrap();
        let mut buffer = Vec::new();
        assert_eq!(read_message(&agent, &mut buffer).unwrap(), b"(time)".to_vec());

        assert_eq!(upstream.join().unwrap(), vec![b"(scene)".to_vec()]);
        relay_server.stop().unwrap();
    }
}
