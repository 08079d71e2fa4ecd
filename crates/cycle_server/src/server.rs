//! TCP front-end of the cycle server.
//!
//! [`AgentServer`] owns two threads: an acceptor that turns incoming TCP
//! connections into transports and queues them on a channel, and the
//! coordinator thread that registers them at its next StartCycle and runs
//! cycles until stopped.

use crate::config::ServerConfig;
use crate::connection::ConnectionRegistry;
use crate::coordinator::{CoordinatorControls, CycleCoordinator};
use crate::error::ServerError;
use crate::framing::LengthPrefixFramer;
use crate::simulation::AgentSimulation;
use crate::transport::{TcpTransport, Transport};
use crossbeam::channel::{unbounded, Sender};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long the acceptor sleeps when no connection is pending.
pub(crate) const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(5);

const LISTEN_BACKLOG: i32 = 1024;

/// Binds a non-blocking listener with address reuse enabled.
pub(crate) fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ServerError::Network(format!("Socket creation failed: {e}")))?;
    socket.set_reuse_address(true).ok();
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::Network(format!("Failed to bind {addr}: {e}")))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| ServerError::Network(format!("Listen failed: {e}")))?;

    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// The cycle server: agent listener plus cycle coordinator.
pub struct AgentServer {
    config: ServerConfig,
    simulation: Arc<dyn AgentSimulation>,
    registry: Arc<ConnectionRegistry>,
    stop: Arc<AtomicBool>,
    controls: Option<CoordinatorControls>,
    local_addr: Option<SocketAddr>,
    acceptor: Option<JoinHandle<()>>,
    coordinator: Option<JoinHandle<()>>,
}

impl AgentServer {
    /// Creates a server; nothing is bound until [`AgentServer::start`].
    pub fn new(config: ServerConfig, simulation: Arc<dyn AgentSimulation>) -> Result<Self, ServerError> {
        config.validate()?;
        let registry = Arc::new(ConnectionRegistry::with_recv_chunk_size(
            Arc::new(LengthPrefixFramer::new()),
            config.recv_chunk_size,
        ));

        Ok(Self {
            config,
            simulation,
            registry,
            stop: Arc::new(AtomicBool::new(false)),
            controls: None,
            local_addr: None,
            acceptor: None,
            coordinator: None,
        })
    }

    /// Binds the listener and starts the acceptor and coordinator threads.
    ///
    /// # Returns
    ///
    /// The bound address, which differs from the configured one when port 0
    /// was requested.
    pub fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.coordinator.is_some() {
            return Err(ServerError::Internal("server already started".to_string()));
        }

        let listener = bind_listener(self.config.bind_address)?;
        self.stop.store(false, Ordering::SeqCst);
        let local_addr = listener.local_addr()?;
        info!("🚀 Cycle server listening on {}", local_addr);

        let (sender, receiver) = unbounded::<Box<dyn Transport>>();
        let mut coordinator = CycleCoordinator::new(
            self.registry.clone(),
            self.simulation.clone(),
            receiver,
            &self.config,
        );
        let controls = coordinator.controls();

        let cycle_interval = self.config.cycle_interval;
        let coordinator_thread = thread::Builder::new()
            .name("cycle-coordinator".to_string())
            .spawn(move || coordinator.run(cycle_interval))
            .map_err(|e| ServerError::Internal(format!("Failed to spawn coordinator: {e}")))?;

        let acceptor = Acceptor {
            listener,
            sender,
            registry: self.registry.clone(),
            stop: self.stop.clone(),
            max_connections: self.config.max_connections,
        };
        let acceptor_thread = match thread::Builder::new()
            .name("agent-acceptor".to_string())
            .spawn(move || acceptor.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                controls.request_stop();
                let _ = coordinator_thread.join();
                return Err(ServerError::Internal(format!("Failed to spawn acceptor: {e}")));
            }
        };

        self.controls = Some(controls);
        self.local_addr = Some(local_addr);
        self.acceptor = Some(acceptor_thread);
        self.coordinator = Some(coordinator_thread);
        Ok(local_addr)
    }

    /// Stops accepting, lets the current cycle finish and shuts down.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(controls) = &self.controls {
            controls.request_stop();
        }

        let mut result = Ok(());
        if let Some(handle) = self.acceptor.take() {
            if handle.join().is_err() {
                result = Err(ServerError::Internal("acceptor thread panicked".to_string()));
            }
        }
        if let Some(handle) = self.coordinator.take() {
            if handle.join().is_err() {
                result = Err(ServerError::Internal("coordinator thread panicked".to_string()));
            }
            info!("✅ Cycle server stopped");
        }
        result
    }

    pub fn is_running(&self) -> bool {
        self.coordinator
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Runtime switches; `None` before [`AgentServer::start`].
    pub fn controls(&self) -> Option<&CoordinatorControls> {
        self.controls.as_ref()
    }

    pub fn set_sync_mode(&self, enabled: bool) {
        if let Some(controls) = &self.controls {
            controls.set_sync_mode(enabled);
        }
    }

    pub fn set_multi_threaded(&self, enabled: bool) {
        if let Some(controls) = &self.controls {
            controls.set_multi_threaded(enabled);
        }
    }
}

impl Drop for AgentServer {
    fn drop(&mut self) {
        if self.coordinator.is_some() {
            if let Err(e) = self.stop() {
                error!("Error while stopping cycle server: {}", e);
            }
        }
    }
}

struct Acceptor {
    listener: TcpListener,
    sender: Sender<Box<dyn Transport>>,
    registry: Arc<ConnectionRegistry>,
    stop: Arc<AtomicBool>,
    max_connections: usize,
}

impl Acceptor {
    fn run(self) {
        while !self.stop.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    // Queued transports are not in the registry yet.
                    let live = self.registry.open_count() + self.sender.len();
                    if live >= self.max_connections {
                        warn!(
                            "🚫 Rejecting connection from {}: limit of {} reached",
                            addr, self.max_connections
                        );
                        let _ = stream.shutdown(Shutdown::Both);
                        continue;
                    }
                    match TcpTransport::accepted(stream) {
                        Ok(transport) => {
                            debug!("Accepted agent socket from {}", addr);
                            if self.sender.send(Box::new(transport)).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to configure socket from {}: {}", addr, e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
        debug!("Agent acceptor exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSimulation;

    #[test]
    fn test_bind_listener_reports_port() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        };
        let result = AgentServer::new(config, Arc::new(RecordingSimulation::default()));
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[test]
    fn test_start_and_stop() {
        let config = ServerConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            cycle_interval: Duration::from_millis(2),
            ..ServerConfig::default()
        };
        let mut server = AgentServer::new(config, Arc::new(RecordingSimulation::default())).unwrap();
        let addr = server.start().unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert!(server.is_running());
        assert!(server.start().is_err());

        server.stop().unwrap();
        assert!(!server.is_running());
    }
}
