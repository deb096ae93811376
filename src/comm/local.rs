//! Single-rank communicator.

use crate::comm::{CommError, Communicator};
use crate::types::Rank;

/// Communicator for a non-distributed run: one rank, id 0.
///
/// Collectives complete immediately; an all-to-all hands the single
/// outgoing buffer straight back.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalComm;

impl LocalComm {
    /// Creates the single-rank communicator.
    pub fn new() -> Self {
        Self
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> Rank {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), CommError> {
        Ok(())
    }

    fn all_to_all_bytes(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError> {
        if outgoing.len() != 1 {
            return Err(CommError::PartitionCount {
                expected: 1,
                got: outgoing.len(),
            });
        }
        Ok(outgoing)
    }

    fn all_reduce_min(&self, value: f64) -> Result<f64, CommError> {
        Ok(value)
    }
}
