//! Dynamically resizable rendezvous barrier.
//!
//! A [`DynamicBarrier`] is a generation counter guarded by one mutex plus a
//! condvar. Every generation has a fixed capacity: the number of arrivals
//! that completes it. Joins and leaves only touch the *pending* capacity;
//! the participant that completes a generation installs the pending
//! capacity as the next generation's capacity, bumps the generation and
//! wakes everybody. A resize can therefore never change the count of a
//! rendezvous that is already in flight.
//!
//! Participants are tracked through [`ParticipantHandle`]s:
//!
//! - a handle from [`DynamicBarrier::join`] is first counted in the
//!   generation after the one active at join time, and a rendezvous issued
//!   earlier simply waits for that generation to begin;
//! - [`DynamicBarrier::leave`] removes the handle from every later
//!   generation, but if the handle is counted in the active generation it
//!   still owes one final rendezvous there.
//!
//! Misusing a handle is a bug in the caller and panics.

use crate::utils::{lock, wait};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use tracing::trace;

static NEXT_BARRIER_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
struct BarrierState {
    /// Arrivals that complete the current generation.
    capacity: usize,
    /// Arrivals so far in the current generation.
    arrived: usize,
    generation: u64,
    /// Capacity the next generation will use.
    pending_capacity: usize,
    resize_pending: bool,
}

impl BarrierState {
    /// Closes the current generation and installs any staged resize.
    fn advance(&mut self) {
        self.arrived = 0;
        self.generation += 1;
        if self.resize_pending {
            trace!(
                "Barrier resized {} -> {} at generation {}",
                self.capacity,
                self.pending_capacity,
                self.generation
            );
            self.capacity = self.pending_capacity;
            self.resize_pending = false;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParticipantStatus {
    Active,
    /// Left, but still owes the rendezvous of the generation it left in.
    Leaving,
    Left,
}

/// One participant's right to take part in rendezvous.
///
/// Handles are not `Clone`: each one stands for exactly one slot of the
/// barrier's capacity.
#[derive(Debug)]
pub struct ParticipantHandle {
    barrier_id: usize,
    /// First generation that counts this participant.
    admitted_at: u64,
    /// Generation of the last completed rendezvous.
    last_generation: Option<u64>,
    status: ParticipantStatus,
}

impl ParticipantHandle {
    /// First generation in which this participant is counted.
    pub fn admitted_at(&self) -> u64 {
        self.admitted_at
    }

    /// Generation of this participant's most recent rendezvous.
    pub fn last_generation(&self) -> Option<u64> {
        self.last_generation
    }

    /// Whether the handle has left and completed its final rendezvous.
    pub fn has_left(&self) -> bool {
        self.status == ParticipantStatus::Left
    }
}

/// Outcome of a completed rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousResult {
    /// The generation that was completed.
    pub generation: u64,
    /// True for exactly one participant per generation: the one whose
    /// arrival completed it and installed the next capacity.
    pub is_leader: bool,
}

/// A rendezvous barrier whose participant count may change between
/// generations.
#[derive(Debug)]
pub struct DynamicBarrier {
    id: usize,
    state: Mutex<BarrierState>,
    condvar: Condvar,
}

impl DynamicBarrier {
    /// Creates a barrier with `participants` initial participants, all
    /// counted from generation 0.
    ///
    /// # Panics
    ///
    /// If `participants` is zero.
    pub fn new(participants: usize) -> (Self, Vec<ParticipantHandle>) {
        assert!(participants > 0, "a barrier needs at least one participant");
        let id = NEXT_BARRIER_ID.fetch_add(1, Ordering::Relaxed);
        let barrier = Self {
            id,
            state: Mutex::new(BarrierState {
                capacity: participants,
                arrived: 0,
                generation: 0,
                pending_capacity: participants,
                resize_pending: false,
            }),
            condvar: Condvar::new(),
        };
        let handles = (0..participants)
            .map(|_| ParticipantHandle {
                barrier_id: id,
                admitted_at: 0,
                last_generation: None,
                status: ParticipantStatus::Active,
            })
            .collect();
        (barrier, handles)
    }

    /// Adds a participant, counted from the next generation on.
    pub fn join(&self) -> ParticipantHandle {
        let mut state = lock(&self.state);
        state.pending_capacity += 1;
        state.resize_pending = true;
        let admitted_at = state.generation + 1;

        // Nobody is left to complete the current generation.
        if state.capacity == 0 {
            state.advance();
            self.condvar.notify_all();
        }

        trace!(
            "Barrier participant joined; admitted at generation {}",
            admitted_at
        );
        ParticipantHandle {
            barrier_id: self.id,
            admitted_at,
            last_generation: None,
            status: ParticipantStatus::Active,
        }
    }

    /// Removes a participant from every later generation.
    ///
    /// If the participant is counted in the current generation it must still
    /// call [`DynamicBarrier::rendezvous`] once more; that final call is its
    /// last. A participant that was not yet admitted is gone immediately.
    ///
    /// # Panics
    ///
    /// If the handle belongs to another barrier or has already left.
    pub fn leave(&self, handle: &mut ParticipantHandle) {
        self.check_owner(handle);
        assert!(
            handle.status == ParticipantStatus::Active,
            "participant left the barrier twice"
        );

        let mut state = lock(&self.state);
        state.pending_capacity = state
            .pending_capacity
            .checked_sub(1)
            .unwrap_or_else(|| panic!("barrier pending capacity underflow"));
        state.resize_pending = true;

        handle.status = if state.generation < handle.admitted_at {
            ParticipantStatus::Left
        } else {
            ParticipantStatus::Leaving
        };
        trace!(
            "Barrier participant leaving at generation {} ({:?})",
            state.generation,
            handle.status
        );
    }

    /// Blocks until every participant of the current generation arrived.
    ///
    /// # Panics
    ///
    /// If the handle belongs to another barrier, already completed its final
    /// rendezvous, or rendezvoused in this generation already.
    pub fn rendezvous(&self, handle: &mut ParticipantHandle) -> RendezvousResult {
        self.check_owner(handle);
        assert!(
            handle.status != ParticipantStatus::Left,
            "rendezvous after the participant's final rendezvous"
        );

        let mut state = lock(&self.state);
        while state.generation < handle.admitted_at {
            state = wait(&self.condvar, state);
        }

        let generation = state.generation;
        assert!(
            handle.last_generation != Some(generation),
            "participant rendezvoused twice in generation {}",
            generation
        );

        state.arrived += 1;
        assert!(
            state.arrived <= state.capacity,
            "barrier generation {} got {} arrivals for capacity {}",
            generation,
            state.arrived,
            state.capacity
        );

        let is_leader = state.arrived == state.capacity;
        if is_leader {
            state.advance();
            self.condvar.notify_all();
        } else {
            while state.generation == generation {
                state = wait(&self.condvar, state);
            }
        }
        drop(state);

        handle.last_generation = Some(generation);
        if handle.status == ParticipantStatus::Leaving {
            handle.status = ParticipantStatus::Left;
        }
        RendezvousResult {
            generation,
            is_leader,
        }
    }

    /// Capacity of the current generation.
    pub fn capacity(&self) -> usize {
        lock(&self.state).capacity
    }

    /// Capacity staged for the next generation.
    pub fn pending_capacity(&self) -> usize {
        lock(&self.state).pending_capacity
    }

    /// Number of completed generations.
    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    fn check_owner(&self, handle: &ParticipantHandle) {
        assert_eq!(
            handle.barrier_id, self.id,
            "participant handle belongs to a different barrier"
        );
    }
}
