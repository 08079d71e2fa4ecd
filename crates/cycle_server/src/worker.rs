//! Per-agent worker threads.
//!
//! In multi-threaded mode every staffed connection gets one OS thread that
//! produces its sense payload during EndCycle. The coordinator posts a
//! [`WorkerTask`] on the shared [`TaskBoard`], releases the workers with one
//! rendezvous and waits for them with a second one. A worker never touches
//! any connection but its own, and only through the registry.

use crate::barrier::{DynamicBarrier, ParticipantHandle};
use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::simulation::AgentSimulation;
use crate::utils::lock;
use crossbeam::channel::{bounded, Sender};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

/// Work the coordinator hands to every worker for one EndCycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTask {
    /// Nothing posted yet.
    Idle,
    /// Produce the sense payload for `cycle`.
    Sense { cycle: u64 },
    /// Leave the barrier and exit.
    Retire,
}

/// The task posted for the current release.
///
/// Written by the coordinator before the release rendezvous and read by
/// workers after it, so the barrier orders every access.
#[derive(Debug)]
pub(crate) struct TaskBoard {
    task: Mutex<WorkerTask>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self {
            task: Mutex::new(WorkerTask::Idle),
        }
    }

    pub fn post(&self, task: WorkerTask) {
        *lock(&self.task) = task;
    }

    pub fn current(&self) -> WorkerTask {
        *lock(&self.task)
    }
}

/// Shared collaborators of every worker.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub registry: Arc<ConnectionRegistry>,
    pub simulation: Arc<dyn AgentSimulation>,
    pub barrier: Arc<DynamicBarrier>,
    pub board: Arc<TaskBoard>,
}

/// Asks the simulation for `id`'s sense payload and stores it for sending.
///
/// Clears the synchronized flag first, in every mode, so a token left over
/// from free-running cycles cannot satisfy a later lock-step StartCycle. A
/// panicking simulation closes only this connection.
pub(crate) fn produce_sense(
    registry: &ConnectionRegistry,
    simulation: &dyn AgentSimulation,
    id: ConnectionId,
    cycle: u64,
) {
    registry.set_synced(id, false);

    let sensed = panic::catch_unwind(AssertUnwindSafe(|| simulation.sense(id, cycle)));
    match sensed {
        Ok(payload) if payload.is_empty() => {}
        Ok(payload) => {
            if let Err(e) = registry.set_sense_payload(id, payload) {
                debug!("Dropping sense for connection {}: {}", id, e);
            }
        }
        Err(_) => {
            error!("Simulation panicked while sensing connection {}", id);
            registry.disconnect(id);
        }
    }
}

/// A running worker thread.
#[derive(Debug)]
pub(crate) struct AgentWorker {
    id: ConnectionId,
    handle: JoinHandle<()>,
}

impl AgentWorker {
    /// Spawns the worker for `id` and registers it with the barrier.
    ///
    /// The thread is started before it joins the barrier, so a failed spawn
    /// leaves the barrier's capacity untouched. Must be called between the
    /// coordinator's release and done rendezvous so that the new participant
    /// is first counted in the next release.
    pub fn spawn(ctx: &WorkerContext, id: ConnectionId) -> io::Result<Self> {
        let (handle_tx, handle_rx) = bounded::<ParticipantHandle>(1);
        let worker_ctx = ctx.clone();

        let handle = thread::Builder::new()
            .name(format!("agent-worker-{id}"))
            .spawn(move || {
                let Ok(participant) = handle_rx.recv() else {
                    worker_ctx.registry.detach_worker(id);
                    return;
                };
                run_worker(&worker_ctx, id, participant);
            })?;

        if !ctx.registry.attach_worker(id) {
            // Closed before we got here: the thread exits without joining.
            drop(handle_tx);
            return Ok(Self { id, handle });
        }
        Self::admit(ctx, handle_tx, id);
        Ok(Self { id, handle })
    }

    fn admit(ctx: &WorkerContext, handle_tx: Sender<ParticipantHandle>, id: ConnectionId) {
        let participant = ctx.barrier.join();
        trace!(
            "Worker for connection {} admitted at generation {}",
            id,
            participant.admitted_at()
        );
        if let Err(returned) = handle_tx.send(participant) {
            // The receiving thread is gone; give the slot back.
            let mut participant = returned.into_inner();
            ctx.barrier.leave(&mut participant);
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the thread to exit.
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("Worker thread for connection {} panicked", self.id);
        }
    }
}

fn run_worker(ctx: &WorkerContext, id: ConnectionId, mut participant: ParticipantHandle) {
    debug!("🧵 Worker for connection {} started", id);

    loop {
        ctx.barrier.rendezvous(&mut participant);

        let task = ctx.board.current();
        if task == WorkerTask::Retire || !ctx.registry.is_open(id) {
            ctx.barrier.leave(&mut participant);
            ctx.barrier.rendezvous(&mut participant);
            break;
        }

        if let WorkerTask::Sense { cycle } = task {
            produce_sense(&ctx.registry, ctx.simulation.as_ref(), id, cycle);
        }

        ctx.barrier.rendezvous(&mut participant);
    }

    ctx.registry.detach_worker(id);
    debug!("🧵 Worker for connection {} exited", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{scripted_pair, RecordingSimulation};

    fn context(simulation: Arc<RecordingSimulation>) -> (WorkerContext, ParticipantHandle) {
        let (barrier, mut handles) = DynamicBarrier::new(1);
        let ctx = WorkerContext {
            registry: Arc::new(ConnectionRegistry::default()),
            simulation,
            barrier: Arc::new(barrier),
            board: Arc::new(TaskBoard::new()),
        };
        (ctx, handles.remove(0))
    }

    #[test]
    fn test_worker_senses_from_next_release_and_retires() {
        let simulation = Arc::new(RecordingSimulation::default());
        let (ctx, mut coordinator) = context(simulation.clone());
        let id = ctx.registry.accept(Box::new(scripted_pair().0));

        // Cycle 0: spawned between release and done, not used yet.
        ctx.board.post(WorkerTask::Sense { cycle: 0 });
        ctx.barrier.rendezvous(&mut coordinator);
        let worker = AgentWorker::spawn(&ctx, id).unwrap();
        assert_eq!(ctx.barrier.capacity(), 1);
        ctx.barrier.rendezvous(&mut coordinator);
        assert_eq!(ctx.barrier.capacity(), 2);
        assert!(simulation.sensed_in_cycle(0).is_empty());

        // Cycle 1: the worker senses.
        ctx.board.post(WorkerTask::Sense { cycle: 1 });
        ctx.barrier.rendezvous(&mut coordinator);
        ctx.barrier.rendezvous(&mut coordinator);
        assert_eq!(simulation.sensed_in_cycle(1), vec![id]);
        assert_eq!(ctx.registry.take_sense_payload(id), Some(b"cycle:1".to_vec()));
        let (_, _, thread_id) = simulation.sensed_by()[0];
        assert_ne!(thread_id, thread::current().id());

        ctx.board.post(WorkerTask::Retire);
        ctx.barrier.rendezvous(&mut coordinator);
        ctx.barrier.rendezvous(&mut coordinator);
        worker.join();
        assert_eq!(ctx.barrier.capacity(), 1);
        assert!(!ctx.registry.has_worker(id));
    }

    #[test]
    fn test_worker_leaves_when_connection_closes() {
        let simulation = Arc::new(RecordingSimulation::default());
        let (ctx, mut coordinator) = context(simulation.clone());
        let id = ctx.registry.accept(Box::new(scripted_pair().0));

        ctx.barrier.rendezvous(&mut coordinator);
        let worker = AgentWorker::spawn(&ctx, id).unwrap();
        ctx.barrier.rendezvous(&mut coordinator);

        ctx.registry.disconnect(id);
        assert_eq!(ctx.registry.len(), 1);

        ctx.board.post(WorkerTask::Sense { cycle: 1 });
        ctx.barrier.rendezvous(&mut coordinator);
        ctx.barrier.rendezvous(&mut coordinator);
        worker.join();

        assert!(simulation.sensed_in_cycle(1).is_empty());
        assert!(ctx.registry.is_empty());
        assert_eq!(ctx.barrier.capacity(), 1);
    }

    #[test]
    fn test_spawn_for_closed_connection_does_not_join() {
        let simulation = Arc::new(RecordingSimulation::default());
        let (ctx, mut coordinator) = context(simulation);
        let id = ctx.registry.accept(Box::new(scripted_pair().0));
        ctx.registry.disconnect(id);

        let worker = AgentWorker::spawn(&ctx, id).unwrap();
        worker.join();
        assert_eq!(ctx.barrier.pending_capacity(), 1);
        assert!(ctx.barrier.rendezvous(&mut coordinator).is_leader);
    }

    #[test]
    fn test_sense_clears_sync_flag_and_empty_sense_is_not_stored() {
        struct Silent;
        impl AgentSimulation for Silent {
            fn agent_connected(&self, _: ConnectionId) {}
            fn realize_command(&self, _: ConnectionId, _: &[u8]) {}
            fn step(&self, _: u64) {}
            fn sense(&self, _: ConnectionId, _: u64) -> Vec<u8> {
                Vec::new()
            }
            fn agent_disconnected(&self, _: ConnectionId) {}
        }

        let registry = ConnectionRegistry::default();
        let id = registry.accept(Box::new(scripted_pair().0));
        registry.set_synced(id, true);

        produce_sense(&registry, &Silent, id, 3);
        assert!(!registry.is_synced(id));
        assert_eq!(registry.take_sense_payload(id), None);
    }
}
