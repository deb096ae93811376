//! Rank topology: who am I, and how many of us are there.

use serde::Serialize;
use thiserror::Error;

use crate::comm::Communicator;
use crate::types::Rank;

/// Failures establishing the parallel runtime. All of them are fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// A world with no ranks was requested.
    #[error("parallel runtime has no ranks")]
    EmptyWorld,

    /// The runtime reported a rank id outside `[0, host_count)`.
    #[error("rank id {rank} is outside a world of {host_count} ranks")]
    RankOutOfRange { rank: Rank, host_count: usize },

    /// A rank's thread panicked before finishing.
    #[error("rank {rank} panicked")]
    RankPanicked { rank: Rank },
}

/// This process's place in the run. Immutable once established.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RankContext {
    rank: Rank,
    host_count: usize,
}

impl RankContext {
    /// Builds a context for `rank` in a world of `host_count` ranks.
    pub fn new(rank: Rank, host_count: usize) -> Result<Self, TopologyError> {
        if host_count == 0 {
            return Err(TopologyError::EmptyWorld);
        }
        if rank >= host_count {
            return Err(TopologyError::RankOutOfRange { rank, host_count });
        }
        Ok(Self { rank, host_count })
    }

    /// Returns this process's rank id.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Returns the number of ranks in the run.
    pub fn host_count(&self) -> usize {
        self.host_count
    }

    /// Returns true on the collecting rank (rank 0).
    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    /// Returns true when more than one rank takes part.
    pub fn is_distributed(&self) -> bool {
        self.host_count > 1
    }
}

/// Reads the rank topology from an established communicator.
///
/// Call once per run, before any other component. An inconsistent
/// runtime (no ranks, or a rank id outside the world) is fatal.
pub fn init_topology<C: Communicator + ?Sized>(comm: &C) -> Result<RankContext, TopologyError> {
    let ctx = RankContext::new(comm.rank(), comm.size())?;
    tracing::debug!(rank = ctx.rank, host_count = ctx.host_count, "rank topology established");
    Ok(ctx)
}
