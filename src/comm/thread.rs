//! In-process SPMD runtime: one OS thread per rank.
//!
//! Ranks never share simulation data. Each all-to-all round serializes the
//! outgoing payloads into per-destination mailboxes and each rank takes its
//! own column after a barrier, which mirrors message passing between
//! processes.
//!
//! A rank whose communicator is dropped (the rank returned or panicked)
//! marks the world as abandoned; peers blocked in a collective are woken
//! with [`CommError::PeerLost`] rather than waiting forever.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

use crate::comm::{CommError, Communicator};
use crate::topology::TopologyError;
use crate::types::Rank;

/// Barrier bookkeeping guarded by a single mutex.
#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    abandoned: bool,
}

/// State shared by all ranks of one world.
#[derive(Debug)]
struct Shared {
    size: usize,
    barrier: Mutex<BarrierState>,
    released: Condvar,
    /// `mailboxes[dst][src]` holds what `src` sent to `dst` this round
    mailboxes: Mutex<Vec<Vec<Option<Vec<u8>>>>>,
    /// One proposal per rank for the current all-reduce
    reduce_slots: Mutex<Vec<f64>>,
}

impl Shared {
    fn new(size: usize) -> Self {
        Self {
            size,
            barrier: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
            mailboxes: Mutex::new(vec![vec![None; size]; size]),
            reduce_slots: Mutex::new(vec![f64::INFINITY; size]),
        }
    }

    fn wait(&self, rank: Rank) -> Result<(), CommError> {
        let mut state = self.barrier.lock();
        if state.abandoned {
            return Err(CommError::PeerLost { rank });
        }

        let generation = state.generation;
        state.arrived += 1;

        if state.arrived == self.size {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(());
        }

        while state.generation == generation {
            if state.abandoned {
                return Err(CommError::PeerLost { rank });
            }
            self.released.wait(&mut state);
        }
        Ok(())
    }

    fn abandon(&self) {
        let mut state = self.barrier.lock();
        state.abandoned = true;
        self.released.notify_all();
    }
}

/// Factory for the communicators of an in-process world.
///
/// # Example
///
/// ```
/// use rankmerge::comm::{Communicator, ThreadWorld};
///
/// let comms = ThreadWorld::create(2).unwrap();
/// assert_eq!(comms.len(), 2);
/// assert_eq!(comms[1].rank(), 1);
/// ```
#[derive(Debug)]
pub struct ThreadWorld;

impl ThreadWorld {
    /// Creates `size` connected communicators, one per rank, in rank order.
    pub fn create(size: usize) -> Result<Vec<ThreadComm>, TopologyError> {
        if size == 0 {
            return Err(TopologyError::EmptyWorld);
        }

        let shared = Arc::new(Shared::new(size));
        Ok((0..size)
            .map(|rank| ThreadComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect())
    }
}

/// One rank's endpoint in a [`ThreadWorld`].
#[derive(Debug)]
pub struct ThreadComm {
    rank: Rank,
    shared: Arc<Shared>,
}

impl Communicator for ThreadComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.shared.wait(self.rank)
    }

    fn all_to_all_bytes(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError> {
        let size = self.shared.size;
        if outgoing.len() != size {
            return Err(CommError::PartitionCount {
                expected: size,
                got: outgoing.len(),
            });
        }

        {
            let mut mailboxes = self.shared.mailboxes.lock();
            for (dst, payload) in outgoing.into_iter().enumerate() {
                mailboxes[dst][self.rank] = Some(payload);
            }
        }

        self.shared.wait(self.rank)?;

        let received = {
            let mut mailboxes = self.shared.mailboxes.lock();
            mailboxes[self.rank]
                .iter_mut()
                .map(|slot| slot.take().unwrap_or_default())
                .collect()
        };

        // Nobody may deposit the next round before every rank has taken this one.
        self.shared.wait(self.rank)?;
        Ok(received)
    }

    fn all_reduce_min(&self, value: f64) -> Result<f64, CommError> {
        self.shared.reduce_slots.lock()[self.rank] = value;
        self.shared.wait(self.rank)?;

        let min = self
            .shared
            .reduce_slots
            .lock()
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);

        self.shared.wait(self.rank)?;
        Ok(min)
    }
}

impl Drop for ThreadComm {
    fn drop(&mut self) {
        self.shared.abandon();
    }
}

/// Runs `f` once per rank on its own thread and collects the results in
/// rank order.
///
/// Each thread owns its rank's [`ThreadComm`]. A rank that panics is
/// reported as [`TopologyError::RankPanicked`]; its peers are released from
/// any collective they were blocked in.
pub fn run_ranks<F, T>(size: usize, f: F) -> Result<Vec<T>, TopologyError>
where
    F: Fn(ThreadComm) -> T + Sync,
    T: Send,
{
    let comms = ThreadWorld::create(size)?;
    let f = &f;

    std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| scope.spawn(move || f(comm)))
            .collect();

        // Join every rank before reporting, so no panicked thread is left unjoined.
        let joined: Vec<_> = handles.into_iter().map(|handle| handle.join()).collect();

        joined
            .into_iter()
            .enumerate()
            .map(|(rank, outcome)| outcome.map_err(|_| TopologyError::RankPanicked { rank }))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_world_rejected() {
        assert!(matches!(ThreadWorld::create(0), Err(TopologyError::EmptyWorld)));
    }

    #[test]
    fn test_ranks_are_ordered() {
        let ranks = run_ranks(4, |comm| (comm.rank(), comm.size())).unwrap();
        assert_eq!(ranks, vec![(0, 4), (1, 4), (2, 4), (3, 4)]);
    }

    #[test]
    fn test_all_reduce_min() {
        let mins = run_ranks(3, |comm| {
            let proposal = 10.0 - comm.rank() as f64;
            comm.all_reduce_min(proposal).unwrap()
        })
        .unwrap();

        assert_eq!(mins, vec![8.0, 8.0, 8.0]);
    }

    #[test]
    fn test_all_to_all_routes_by_destination() {
        let received = run_ranks(3, |comm| {
            let me = comm.rank() as u8;
            let outgoing = (0..3u8).map(|dst| vec![me, dst]).collect();
            comm.all_to_all_bytes(outgoing).unwrap()
        })
        .unwrap();

        for (dst, inbox) in received.iter().enumerate() {
            let expected: Vec<Vec<u8>> = (0..3u8).map(|src| vec![src, dst as u8]).collect();
            assert_eq!(inbox, &expected);
        }
    }

    #[test]
    fn test_repeated_rounds_do_not_mix() {
        let received = run_ranks(2, |comm| {
            let mut rounds = Vec::new();
            for round in 0..5u8 {
                let outgoing = vec![vec![round], vec![round]];
                rounds.push(comm.all_to_all_bytes(outgoing).unwrap());
                comm.barrier().unwrap();
            }
            rounds
        })
        .unwrap();

        for rounds in received {
            for (round, inbox) in rounds.iter().enumerate() {
                assert_eq!(inbox, &vec![vec![round as u8], vec![round as u8]]);
            }
        }
    }

    #[test]
    fn test_peer_lost_instead_of_hang() {
        let results = run_ranks(2, |comm| {
            if comm.rank() == 1 {
                // Leaves without joining the barrier
                return Ok(());
            }
            comm.barrier()
        })
        .unwrap();

        assert_eq!(results[0], Err(CommError::PeerLost { rank: 0 }));
        assert_eq!(results[1], Ok(()));
    }

    #[test]
    fn test_panicking_rank_reported() {
        let result = run_ranks(2, |comm| {
            if comm.rank() == 1 {
                panic!("rank failure");
            }
            comm.barrier().is_err()
        });

        assert!(matches!(result, Err(TopologyError::RankPanicked { rank: 1 })));
    }
}
