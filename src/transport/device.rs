use crate::error::{CohortError, Result};
use crate::types::{Rank, Tag};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Message lane inside a comm. Collective traffic and point-to-point
/// traffic live in disjoint lanes so a user-supplied tag can never match a
/// collective's tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Slot {
    Collective(Tag),
    Direct(Tag),
}

struct Envelope {
    src: Rank,
    slot: Slot,
    payload: Vec<u8>,
}

struct Comm {
    size: u32,
    mailboxes: Vec<VecDeque<Envelope>>,
}

struct MeshState {
    comms: HashMap<u64, Comm>,
}

/// An in-process transport device: a message hub connecting every rank of
/// every comm created on it.
///
/// Delivery is eager — `post` copies the payload into the destination
/// mailbox and wakes waiters. Matching is by `(accepted sources, slot)`
/// with FIFO order preserved per `(src, slot)` pair, which is what the
/// lockstep collective algorithms rely on.
pub struct MeshDevice {
    state: Mutex<MeshState>,
    arrived: Condvar,
    next_comm: AtomicU64,
}

impl MeshDevice {
    pub fn new() -> Arc<MeshDevice> {
        Arc::new(MeshDevice {
            state: Mutex::new(MeshState {
                comms: HashMap::new(),
            }),
            arrived: Condvar::new(),
            next_comm: AtomicU64::new(1),
        })
    }

    /// Allocate a comm for `size` ranks. Called by rank 0 during rendezvous;
    /// the id travels to the other ranks through the store.
    pub(crate) fn create_comm(&self, size: u32) -> u64 {
        let id = self.next_comm.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock_state();
        state.comms.insert(
            id,
            Comm {
                size,
                mailboxes: (0..size).map(|_| VecDeque::new()).collect(),
            },
        );
        id
    }

    /// Validate that `rank` can participate in `comm_id`.
    pub(crate) fn attach(&self, comm_id: u64, rank: Rank, size: u32) -> Result<()> {
        let state = self.lock_state();
        let comm = state
            .comms
            .get(&comm_id)
            .ok_or_else(|| unknown_comm(comm_id))?;
        if comm.size != size {
            return Err(CohortError::invalid_argument(
                "connect_full_mesh",
                format!("comm {comm_id} has size {}, expected {size}", comm.size),
            ));
        }
        if rank >= size {
            return Err(CohortError::InvalidRank {
                rank,
                world_size: size,
            });
        }
        Ok(())
    }

    pub(crate) fn post(
        &self,
        comm_id: u64,
        src: Rank,
        dst: Rank,
        slot: Slot,
        payload: Vec<u8>,
    ) -> Result<()> {
        let mut state = self.lock_state();
        let comm = state
            .comms
            .get_mut(&comm_id)
            .ok_or_else(|| unknown_comm(comm_id))?;
        if dst >= comm.size {
            return Err(CohortError::InvalidRank {
                rank: dst,
                world_size: comm.size,
            });
        }
        comm.mailboxes[dst as usize].push_back(Envelope { src, slot, payload });
        self.arrived.notify_all();
        Ok(())
    }

    /// Take the oldest envelope in `dst`'s mailbox whose slot matches and
    /// whose source is in `srcs`, blocking up to `timeout`.
    pub(crate) fn match_recv(
        &self,
        comm_id: u64,
        dst: Rank,
        srcs: &[Rank],
        slot: Slot,
        timeout: Duration,
        operation: &'static str,
    ) -> Result<(Rank, Vec<u8>)> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        loop {
            let comm = state
                .comms
                .get_mut(&comm_id)
                .ok_or_else(|| unknown_comm(comm_id))?;
            if dst >= comm.size {
                return Err(CohortError::InvalidRank {
                    rank: dst,
                    world_size: comm.size,
                });
            }
            let mailbox = &mut comm.mailboxes[dst as usize];
            if let Some(pos) = mailbox
                .iter()
                .position(|env| env.slot == slot && srcs.contains(&env.src))
            {
                let env = mailbox.remove(pos).expect("position is in bounds");
                return Ok((env.src, env.payload));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CohortError::Timeout {
                    operation,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let (guard, _) = self
                .arrived
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MeshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unknown_comm(comm_id: u64) -> CohortError {
    CohortError::invalid_argument("transport", format!("unknown comm id {comm_id}"))
}
