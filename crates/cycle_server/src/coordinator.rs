//! The cycle coordinator.
//!
//! One [`CycleCoordinator`] drives the authoritative cycle clock on a single
//! thread. Every cycle runs three phases in order:
//!
//! 1. **StartCycle**: accept queued connections, pull bytes off every open
//!    socket, frame them and hand commands to the simulation. In
//!    synchronous mode this repeats until every still-open connection has
//!    sent its sync token.
//! 2. **Simulating**: one call to [`AgentSimulation::step`].
//! 3. **EndCycle**: produce each open connection's sense payload, either
//!    sequentially or on the worker threads (one release rendezvous, one done
//!    rendezvous), then send the payloads.
//!
//! Connections accepted while multi-threaded get their workers spawned and
//! joined to the barrier between the release and done rendezvous of
//! EndCycle. That is the only place the coordinator resizes the barrier, so
//! a new worker is first counted in the next cycle's release.

use crate::barrier::{DynamicBarrier, ParticipantHandle};
use crate::config::ServerConfig;
use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::framing::is_sync_token;
use crate::simulation::AgentSimulation;
use crate::transport::Transport;
use crate::worker::{produce_sense, AgentWorker, TaskBoard, WorkerContext, WorkerTask};
use crossbeam::channel::{Receiver, TryRecvError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Phase of the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    StartCycle,
    Simulating,
    EndCycle,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::StartCycle => "StartCycle",
            CyclePhase::Simulating => "Simulating",
            CyclePhase::EndCycle => "EndCycle",
        };
        f.write_str(name)
    }
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    /// Connections accepted during this cycle.
    pub accepted: Vec<ConnectionId>,
    /// Connections closed during this cycle.
    pub closed: Vec<ConnectionId>,
    /// Commands handed to the simulation.
    pub commands: usize,
    /// Sense payloads written to agents.
    pub senses_sent: usize,
    /// Open connections after EndCycle.
    pub open_connections: usize,
    /// Worker threads alive after EndCycle.
    pub workers: usize,
}

#[derive(Debug)]
struct ControlFlags {
    sync_mode: AtomicBool,
    multi_threaded: AtomicBool,
    stop: AtomicBool,
}

/// Runtime switches of a coordinator, usable from any thread.
///
/// Mode changes take effect at the next phase that reads them: the sync
/// mode at the next StartCycle, the threading mode at the next EndCycle.
#[derive(Debug, Clone)]
pub struct CoordinatorControls {
    flags: Arc<ControlFlags>,
}

impl CoordinatorControls {
    fn new(sync_mode: bool, multi_threaded: bool) -> Self {
        Self {
            flags: Arc::new(ControlFlags {
                sync_mode: AtomicBool::new(sync_mode),
                multi_threaded: AtomicBool::new(multi_threaded),
                stop: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_sync_mode(&self, enabled: bool) {
        self.flags.sync_mode.store(enabled, Ordering::SeqCst);
    }

    pub fn sync_mode(&self) -> bool {
        self.flags.sync_mode.load(Ordering::SeqCst)
    }

    pub fn set_multi_threaded(&self, enabled: bool) {
        self.flags.multi_threaded.store(enabled, Ordering::SeqCst);
    }

    pub fn multi_threaded(&self) -> bool {
        self.flags.multi_threaded.load(Ordering::SeqCst)
    }

    /// Asks the run loop to stop after the current cycle. Also ends a
    /// pending sync wait.
    pub fn request_stop(&self) {
        self.flags.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.flags.stop.load(Ordering::SeqCst)
    }
}

/// Drives StartCycle → Simulating → EndCycle over the registry.
pub struct CycleCoordinator {
    registry: Arc<ConnectionRegistry>,
    simulation: Arc<dyn AgentSimulation>,
    incoming: Receiver<Box<dyn Transport>>,
    controls: CoordinatorControls,
    sync_poll_interval: Duration,

    barrier: Arc<DynamicBarrier>,
    participant: ParticipantHandle,
    board: Arc<TaskBoard>,
    workers: BTreeMap<ConnectionId, AgentWorker>,
    /// Connections waiting for a worker; staffed at the next EndCycle.
    unstaffed: Vec<ConnectionId>,
    workers_enabled: bool,

    cycle: u64,
    phase: CyclePhase,
    accepted: Vec<ConnectionId>,
    closed: Vec<ConnectionId>,
}

impl CycleCoordinator {
    /// Creates a coordinator over `registry`.
    ///
    /// # Arguments
    ///
    /// * `registry` - Shared connection registry, also used by the workers
    /// * `simulation` - The simulation collaborator
    /// * `incoming` - Accepted transports to register at the next StartCycle
    /// * `config` - Initial mode flags and the sync poll interval
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        simulation: Arc<dyn AgentSimulation>,
        incoming: Receiver<Box<dyn Transport>>,
        config: &ServerConfig,
    ) -> Self {
        let (barrier, mut handles) = DynamicBarrier::new(1);
        let participant = handles.remove(0);

        Self {
            registry,
            simulation,
            incoming,
            controls: CoordinatorControls::new(config.sync_mode, config.multi_threaded),
            sync_poll_interval: config.sync_poll_interval,
            barrier: Arc::new(barrier),
            participant,
            board: Arc::new(TaskBoard::new()),
            workers: BTreeMap::new(),
            unstaffed: Vec::new(),
            workers_enabled: config.multi_threaded,
            cycle: 0,
            phase: CyclePhase::StartCycle,
            accepted: Vec::new(),
            closed: Vec::new(),
        }
    }

    /// Handle for flipping modes or stopping from other threads.
    pub fn controls(&self) -> CoordinatorControls {
        self.controls.clone()
    }

    pub fn set_sync_mode(&self, enabled: bool) {
        self.controls.set_sync_mode(enabled);
    }

    pub fn set_multi_threaded(&self, enabled: bool) {
        self.controls.set_multi_threaded(enabled);
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Number of the next cycle to run.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Participant count of the current barrier generation, coordinator included.
    pub fn barrier_capacity(&self) -> usize {
        self.barrier.capacity()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Registers a transport immediately instead of through the channel.
    pub fn accept(&mut self, transport: Box<dyn Transport>) -> ConnectionId {
        let id = self.registry.accept(transport);
        self.simulation.agent_connected(id);
        self.accepted.push(id);
        if self.workers_enabled {
            self.unstaffed.push(id);
        }
        id
    }

    /// Runs one full cycle.
    pub fn run_cycle(&mut self) -> CycleReport {
        let cycle = self.cycle;
        trace!("Cycle {} begins", cycle);

        self.phase = CyclePhase::StartCycle;
        let commands = self.start_cycle();

        self.phase = CyclePhase::Simulating;
        self.simulation.step(cycle);

        self.phase = CyclePhase::EndCycle;
        self.end_cycle();
        let senses_sent = self.flush_senses();
        self.collect_disconnected();
        self.reap_workers();

        self.cycle += 1;
        self.phase = CyclePhase::StartCycle;

        CycleReport {
            cycle,
            accepted: std::mem::take(&mut self.accepted),
            closed: std::mem::take(&mut self.closed),
            commands,
            senses_sent,
            open_connections: self.registry.open_count(),
            workers: self.workers.len(),
        }
    }

    /// Runs cycles until a stop is requested, then shuts down.
    ///
    /// With a non-zero `cycle_interval` each cycle is padded to at least
    /// that length.
    pub fn run(&mut self, cycle_interval: Duration) {
        info!(
            "🔄 Cycle coordinator running (sync: {}, multi-threaded: {})",
            self.controls.sync_mode(),
            self.controls.multi_threaded()
        );
        let mut had_agents = false;

        while !self.controls.stop_requested() {
            let started = Instant::now();
            let report = self.run_cycle();

            for id in &report.accepted {
                debug!("Agent {} joined in cycle {}", id, report.cycle);
            }
            if report.open_connections == 0 && had_agents {
                info!("📭 No agents connected after cycle {}", report.cycle);
            }
            had_agents = report.open_connections > 0;
            trace!("{:?}", report);

            let elapsed = started.elapsed();
            if elapsed < cycle_interval {
                thread::sleep(cycle_interval - elapsed);
            }
        }

        self.shutdown();
    }

    /// Retires every worker and closes every connection.
    pub fn shutdown(&mut self) {
        info!("🛑 Cycle coordinator shutting down after {} cycles", self.cycle);
        self.retire_workers();
        self.registry.close_all();
        self.collect_disconnected();
    }

    fn start_cycle(&mut self) -> usize {
        let sync_mode = self.controls.sync_mode();
        let mut commands = 0;

        loop {
            self.accept_incoming();
            for id in self.registry.open_ids() {
                commands += self.ingest(id, sync_mode);
            }
            self.collect_disconnected();

            if !sync_mode || self.controls.stop_requested() || self.all_synced() {
                break;
            }
            thread::sleep(self.sync_poll_interval);
        }
        commands
    }

    fn accept_incoming(&mut self) {
        loop {
            match self.incoming.try_recv() {
                Ok(transport) => {
                    self.accept(transport);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Frames and realizes everything `id` has sent. In synchronous mode
    /// bytes after the sync token stay buffered for the next cycle.
    fn ingest(&self, id: ConnectionId, sync_mode: bool) -> usize {
        if sync_mode && self.registry.is_synced(id) {
            return 0;
        }
        if let Err(e) = self.registry.pump(id) {
            debug!("Skipping connection {}: {}", id, e);
            return 0;
        }

        loop {
            match self.registry.try_extract_message(id) {
                Ok(Some(message)) if is_sync_token(&message) => {
                    self.registry.set_synced(id, true);
                    if sync_mode {
                        break;
                    }
                }
                Ok(Some(message)) => {
                    if let Err(e) = self.registry.queue_command(id, message) {
                        debug!("Dropping command for connection {}: {}", id, e);
                    }
                }
                Ok(None) => break,
                Err(_) => return 0,
            }
        }

        let commands = self.registry.take_commands(id);
        for command in &commands {
            self.simulation.realize_command(id, command);
        }
        commands.len()
    }

    fn all_synced(&self) -> bool {
        self.registry
            .open_ids()
            .into_iter()
            .all(|id| self.registry.is_synced(id))
    }

    fn end_cycle(&mut self) {
        let multi_threaded = self.controls.multi_threaded();

        if multi_threaded != self.workers_enabled {
            self.switch_threading(multi_threaded);
        }

        if !multi_threaded {
            for id in self.registry.open_ids() {
                self.sense_sequentially(id);
            }
            return;
        }

        self.board.post(WorkerTask::Sense { cycle: self.cycle });
        self.barrier.rendezvous(&mut self.participant);

        let spawned = self.spawn_pending_workers();

        // Everything without a running worker this round, including the
        // connections whose worker was just spawned.
        for id in self.registry.open_ids() {
            if !self.workers.contains_key(&id) {
                self.sense_sequentially(id);
            }
        }

        self.barrier.rendezvous(&mut self.participant);

        for worker in spawned {
            self.workers.insert(worker.id(), worker);
        }
    }

    fn sense_sequentially(&self, id: ConnectionId) {
        produce_sense(&self.registry, self.simulation.as_ref(), id, self.cycle);
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            registry: self.registry.clone(),
            simulation: self.simulation.clone(),
            barrier: self.barrier.clone(),
            board: self.board.clone(),
        }
    }

    /// Spawns workers for the batched connections. Only called between the
    /// release and done rendezvous of EndCycle.
    fn spawn_pending_workers(&mut self) -> Vec<AgentWorker> {
        if self.unstaffed.is_empty() {
            return Vec::new();
        }
        let ctx = self.worker_context();
        let mut spawned = Vec::new();

        for id in std::mem::take(&mut self.unstaffed) {
            if !self.registry.is_open(id) || self.workers.contains_key(&id) {
                continue;
            }
            match AgentWorker::spawn(&ctx, id) {
                Ok(worker) => {
                    debug!("Spawned worker for connection {}", id);
                    spawned.push(worker);
                }
                Err(e) => {
                    warn!("Failed to spawn worker for connection {}: {}", id, e);
                    self.unstaffed.push(id);
                }
            }
        }
        spawned
    }

    fn switch_threading(&mut self, enabled: bool) {
        if enabled {
            info!("Switching to multi-threaded sense generation");
            self.unstaffed = self
                .registry
                .open_ids()
                .into_iter()
                .filter(|id| !self.workers.contains_key(id))
                .collect();
        } else {
            info!("Switching to single-threaded sense generation");
            self.retire_workers();
            self.unstaffed.clear();
        }
        self.workers_enabled = enabled;
    }

    /// Posts the retire task, runs one release/done pair and joins every
    /// worker thread.
    fn retire_workers(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        debug!("Retiring {} workers", self.workers.len());
        self.board.post(WorkerTask::Retire);
        self.barrier.rendezvous(&mut self.participant);
        self.barrier.rendezvous(&mut self.participant);

        for (_, worker) in std::mem::take(&mut self.workers) {
            worker.join();
        }
    }

    fn flush_senses(&self) -> usize {
        let mut sent = 0;
        for id in self.registry.open_ids() {
            let Some(payload) = self.registry.take_sense_payload(id) else {
                continue;
            };
            match self.registry.send_message(id, &payload) {
                Ok(()) => sent += 1,
                Err(e) => debug!("Sense for connection {} not delivered: {}", id, e),
            }
        }
        sent
    }

    fn collect_disconnected(&mut self) {
        for id in self.registry.take_disconnected() {
            self.simulation.agent_disconnected(id);
            self.closed.push(id);
        }
    }

    fn reap_workers(&mut self) {
        let finished: Vec<ConnectionId> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for id in finished {
            if let Some(worker) = self.workers.remove(&id) {
                worker.join();
                trace!("Reaped worker for connection {}", id);
            }
        }
    }
}

impl Drop for CycleCoordinator {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            error!(
                "Cycle coordinator dropped with {} live workers; retiring them",
                self.workers.len()
            );
            self.retire_workers();
        }
    }
}
