//! Communicator trait and backends.
//!
//! A `Communicator` is the only path by which data moves between ranks.
//! Every operation on it is a collective: all ranks must call the same
//! operations, the same number of times, in the same order.
//!
//! # Backends
//!
//! - [`LocalComm`]: the single-rank runtime used for non-distributed runs.
//! - [`ThreadWorld`]: an in-process SPMD runtime with one OS thread per
//!   rank, explicit mailboxes and a generation barrier.

pub mod local;
pub mod thread;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::types::Rank;

pub use local::LocalComm;
pub use thread::{run_ranks, ThreadComm, ThreadWorld};

/// Errors reported by a communicator backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommError {
    /// A peer left the collective (its communicator was dropped) while
    /// this rank was waiting on it.
    #[error("rank {rank}: a peer left while waiting in a collective")]
    PeerLost { rank: Rank },

    /// An all-to-all was called with the wrong number of outgoing buffers.
    #[error("all-to-all needs one buffer per rank: expected {expected}, got {got}")]
    PartitionCount { expected: usize, got: usize },
}

/// Errors from a typed collective exchange.
#[derive(Error, Debug)]
pub enum CollectiveError {
    #[error(transparent)]
    Comm(#[from] CommError),

    /// A payload could not be encoded or decoded.
    #[error("collective payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// The collective operations a rank runtime must provide.
pub trait Communicator: Send {
    /// Returns this process's rank id.
    fn rank(&self) -> Rank;

    /// Returns the number of ranks taking part in the run.
    fn size(&self) -> usize;

    /// Blocks until every rank has reached the barrier.
    fn barrier(&self) -> Result<(), CommError>;

    /// Sends `outgoing[dst]` to every rank `dst` and returns the buffers
    /// received from every rank, indexed by source rank.
    fn all_to_all_bytes(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError>;

    /// Returns the minimum of `value` over all ranks.
    fn all_reduce_min(&self, value: f64) -> Result<f64, CommError>;
}

impl<T: Communicator + ?Sized> Communicator for Box<T> {
    fn rank(&self) -> Rank {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn barrier(&self) -> Result<(), CommError> {
        (**self).barrier()
    }

    fn all_to_all_bytes(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError> {
        (**self).all_to_all_bytes(outgoing)
    }

    fn all_reduce_min(&self, value: f64) -> Result<f64, CommError> {
        (**self).all_reduce_min(value)
    }
}

/// Typed all-to-all: serializes `outgoing[dst]` for each destination and
/// decodes what every source sent to this rank, in source-rank order.
///
/// Payloads travel as JSON bytes, so no memory is shared between ranks.
pub fn all_to_all<C, T>(comm: &C, outgoing: Vec<T>) -> Result<Vec<T>, CollectiveError>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned,
{
    let encoded = outgoing
        .iter()
        .map(serde_json::to_vec)
        .collect::<Result<Vec<_>, _>>()?;

    let received = comm.all_to_all_bytes(encoded)?;

    received
        .iter()
        .map(|bytes| serde_json::from_slice(bytes).map_err(CollectiveError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_all_to_all_local() {
        let comm = LocalComm::new();
        let received: Vec<Vec<f64>> = all_to_all(&comm, vec![vec![0.1, 0.2]]).unwrap();
        assert_eq!(received, vec![vec![0.1, 0.2]]);
    }

    #[test]
    fn test_typed_all_to_all_wrong_count() {
        let comm = LocalComm::new();
        let result: Result<Vec<u32>, _> = all_to_all(&comm, vec![1, 2]);
        assert!(matches!(
            result,
            Err(CollectiveError::Comm(CommError::PartitionCount { expected: 1, got: 2 }))
        ));
    }

    #[test]
    fn test_boxed_communicator() {
        let comm: Box<dyn Communicator> = Box::new(LocalComm::new());
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.size(), 1);
        assert!(comm.barrier().is_ok());
    }
}
